// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Nested request parsing
//!
//! A request path embeds a complete secondary URL:
//!
//! ```text
//! /https:/r2-auth@data.example.com/reports/sales.csv/tb0?select=region,total&limit=10
//!  ^^^^^   ^^^^^^^ ^^^^^^^^^^^^^^^^ ^^^^^^^^^^^^^^^^^^ ^^^ ^^^^^^^^^^^^^^^^^^^^^^^^^^^^^
//!  scheme  alias   host             data set path      table  query shaping
//! ```
//!
//! Upstream routers tend to collapse `//` into `/`, so the raw text is
//! normalized before handing it to the URL parser. A request without a
//! scheme addresses the local serve root.

use crate::{Error, Result};
use percent_encoding::percent_decode_str;
use std::fmt;
use std::path::Path;
use url::Url;

/// Schemes accepted in the nested URL
pub const SCHEMES: [&str; 2] = ["https", "http"];

/// First path segment reserved for named pipelines
pub const PIPELINE_MARKER: &str = "pipeline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(Self::Asc),
            "desc" | "descending" => Ok(Self::Desc),
            other => Err(Error::malformed(format!(
                "sortdirection must be asc or desc, got '{}'",
                other
            ))),
        }
    }

    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Structured form of one nested request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NestedRequest {
    /// `None` in local mode
    pub scheme: Option<String>,
    pub user_alias: Option<String>,
    /// Host, with `:port` when one was given
    pub host: Option<String>,
    /// Absolute, percent-decoded; never contains the scheme or query string
    pub data_set_path: String,
    pub table: Option<String>,
    pub column_path: Option<String>,
    pub select: Vec<String>,
    pub where_clause: Option<String>,
    pub group_by: Option<String>,
    pub having: Option<String>,
    pub order_by: Option<String>,
    pub sort_direction: Option<SortDirection>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub debug: bool,
}

impl NestedRequest {
    /// Parse a raw request path
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = normalize_request_path(raw);
        if has_scheme_prefix(&normalized) {
            Self::parse_remote(raw, &normalized)
        } else {
            Self::parse_local(raw, &normalized)
        }
    }

    fn parse_remote(raw: &str, normalized: &str) -> Result<Self> {
        let url = Url::parse(normalized)
            .map_err(|e| Error::malformed(format!("cannot parse '{}': {}", raw, e)))?;

        let scheme = url.scheme().to_string();
        if !SCHEMES.contains(&scheme.as_str()) {
            return Err(Error::malformed(format!(
                "unsupported scheme '{}' in '{}'",
                scheme, raw
            )));
        }

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => match url.port() {
                Some(port) => format!("{}:{}", h, port),
                None => h.to_string(),
            },
            _ => return Err(Error::malformed(format!("no host in '{}'", raw))),
        };

        let user_alias = match url.username() {
            "" => None,
            name => Some(decode(name)),
        };

        let mut request = Self {
            scheme: Some(scheme),
            user_alias,
            host: Some(host),
            ..Self::default()
        };
        request.apply_path(url.path(), raw)?;
        if let Some(query) = url.query() {
            request.apply_query(query)?;
        }
        Ok(request)
    }

    fn parse_local(raw: &str, normalized: &str) -> Result<Self> {
        if contains_foreign_scheme(normalized) {
            return Err(Error::malformed(format!(
                "unsupported scheme in '{}'; expected one of {}",
                raw,
                SCHEMES.join(", ")
            )));
        }

        let (path, query) = match normalized.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (normalized, None),
        };
        if !path.is_empty() && !path.starts_with('/') {
            return Err(Error::malformed(format!(
                "'{}' is neither a nested URL nor an absolute local path",
                raw
            )));
        }

        let mut request = Self::default();
        request.apply_path(path, raw)?;
        if let Some(query) = query {
            request.apply_query(query)?;
        }
        Ok(request)
    }

    /// Split a URL path into data set path, table and column
    fn apply_path(&mut self, encoded: &str, raw: &str) -> Result<()> {
        let segments: Vec<String> = encoded
            .split('/')
            .filter(|s| !s.is_empty())
            .map(decode)
            .collect();

        if segments.iter().any(|s| s == ".." || s == ".") {
            return Err(Error::malformed(format!(
                "relative segments are not allowed in '{}'",
                raw
            )));
        }

        // The data set is the last extension-bearing segment among the final
        // three (dataset/table/column), so dotted directories stay in the path.
        let tail = segments.len().saturating_sub(3);
        let boundary = segments[tail..]
            .iter()
            .rposition(|s| has_extension(s))
            .map(|idx| tail + idx);
        let (dataset, rest) = match boundary {
            Some(idx) => segments.split_at(idx + 1),
            None => (segments.as_slice(), &[][..]),
        };

        let mut suffix = rest.iter().cloned();
        self.table = suffix.next();
        self.column_path = suffix.next();

        self.data_set_path = format!("/{}", dataset.join("/"));
        Ok(())
    }

    fn apply_query(&mut self, query: &str) -> Result<()> {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = value.trim().to_string();
            match key.to_ascii_lowercase().as_str() {
                "select" => {
                    self.select = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                "where" => self.where_clause = non_empty(value),
                "groupby" => self.group_by = non_empty(value),
                "having" => self.having = non_empty(value),
                "orderby" => self.order_by = non_empty(value),
                "sortdirection" => {
                    if !value.is_empty() {
                        self.sort_direction = Some(SortDirection::parse(&value)?);
                    }
                }
                "limit" => self.limit = parse_count("limit", &value)?,
                "offset" => self.offset = parse_count("offset", &value)?,
                "debug" => {
                    self.debug = matches!(value.to_ascii_lowercase().as_str(), "" | "true" | "1" | "yes");
                }
                other => {
                    diagnostics::debug!("Ignoring unknown query parameter {param}", param: other);
                }
            }
        }
        Ok(())
    }

    /// No scheme or host: served from the local serve root
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.scheme.is_none()
    }

    /// Path segments including the table and column suffix
    #[must_use]
    pub fn path_segments(&self) -> Vec<&str> {
        self.data_set_path
            .split('/')
            .filter(|s| !s.is_empty())
            .chain(self.table.as_deref())
            .chain(self.column_path.as_deref())
            .collect()
    }

    /// Whether the request names a pipeline, e.g. `/pipeline/sales`
    #[must_use]
    pub fn is_pipeline(&self) -> bool {
        self.path_segments().first() == Some(&PIPELINE_MARKER)
    }

    /// Address of the data set itself, without table, column or query
    #[must_use]
    pub fn dataset_address(&self) -> String {
        let mut out = String::new();
        if let (Some(scheme), Some(host)) = (&self.scheme, &self.host) {
            out.push_str(scheme);
            out.push_str("://");
            if let Some(alias) = &self.user_alias {
                out.push_str(alias);
                out.push('@');
            }
            out.push_str(host);
        }
        out.push_str(&self.data_set_path);
        out
    }
}

impl fmt::Display for NestedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dataset_address())?;
        if let Some(table) = &self.table {
            write!(f, "/{}", table)?;
        }
        if let Some(column) = &self.column_path {
            write!(f, "/{}", column)?;
        }
        Ok(())
    }
}

/// Repair upstream mangling of a nested request path
///
/// - `https:/host` becomes `https://host`
/// - a leading `/` before `scheme://` is dropped
/// - `alias@https://host` collapses to `alias@host`, keeping the scheme in front
#[must_use]
pub fn normalize_request_path(raw: &str) -> String {
    let repaired = repair_scheme_slashes(raw.trim());

    let stripped = match repaired.strip_prefix('/') {
        Some(rest) if has_any_scheme_prefix(rest) => rest.to_string(),
        _ => repaired,
    };

    collapse_scheme_after_alias(&stripped)
}

fn repair_scheme_slashes(input: &str) -> String {
    let mut out = input.to_string();
    for scheme in SCHEMES {
        let token = format!("{}:/", scheme);
        let lone = out.match_indices(&token).find_map(|(pos, _)| {
            let after = pos + token.len();
            let preceded_by_letter = out[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_ascii_alphanumeric());
            (!out[after..].starts_with('/') && !preceded_by_letter).then_some(after)
        });
        if let Some(after) = lone {
            out.insert(after, '/');
        }
    }
    out
}

fn collapse_scheme_after_alias(input: &str) -> String {
    let (head, query) = match input.split_once('?') {
        Some((h, q)) => (h, Some(q)),
        None => (input, None),
    };

    let Some(at) = head.rfind('@') else {
        return input.to_string();
    };
    let (before, after) = (&head[..at], &head[at + 1..]);

    for scheme in SCHEMES {
        let Some(rest) = after.strip_prefix(&format!("{}:", scheme)) else {
            continue;
        };
        let rest = rest.trim_start_matches('/');

        let mut out = if has_scheme_prefix(before) {
            format!("{}@{}", before, rest)
        } else {
            format!("{}://{}@{}", scheme, before.trim_start_matches('/'), rest)
        };
        if let Some(q) = query {
            out.push('?');
            out.push_str(q);
        }
        return out;
    }
    input.to_string()
}

fn has_scheme_prefix(s: &str) -> bool {
    SCHEMES
        .iter()
        .any(|scheme| s.starts_with(&format!("{}://", scheme)))
}

/// `token://` at the start of `s`, for any alphabetic token
fn has_any_scheme_prefix(s: &str) -> bool {
    match s.split_once("://") {
        Some((token, _)) => {
            !token.is_empty()
                && token
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn contains_foreign_scheme(s: &str) -> bool {
    let head = s.split('?').next().unwrap_or_default();
    has_any_scheme_prefix(head.trim_start_matches('/'))
}

fn has_extension(segment: &str) -> bool {
    Path::new(segment)
        .extension()
        .is_some_and(|ext| !ext.is_empty())
}

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn parse_count(name: &str, value: &str) -> Result<Option<u64>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::malformed(format!("{} must be a non-negative integer, got '{}'", name, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mangled_scheme_with_alias() {
        let req = NestedRequest::parse("/https:/alias@host/path/file.csv").expect("parse");
        assert_eq!(req.scheme.as_deref(), Some("https"));
        assert_eq!(req.user_alias.as_deref(), Some("alias"));
        assert_eq!(req.host.as_deref(), Some("host"));
        assert_eq!(req.data_set_path, "/path/file.csv");
        assert_eq!(req.table, None);
    }

    #[test]
    fn test_duplicated_scheme_after_alias() {
        assert_eq!(
            normalize_request_path("https://alias@https://host/a/b.csv"),
            "https://alias@host/a/b.csv"
        );
        assert_eq!(
            normalize_request_path("/https:/alias@https:/host/a/b.csv?limit=1"),
            "https://alias@host/a/b.csv?limit=1"
        );
        assert_eq!(
            normalize_request_path("alias@https://host/a/b.csv"),
            "https://alias@host/a/b.csv"
        );
    }

    #[test]
    fn test_at_sign_in_query_is_left_alone() {
        let raw = "https://host/a.csv?where=email='x@https://y'";
        assert_eq!(normalize_request_path(raw), raw);
    }

    #[test]
    fn test_canonical_url_passes_through() {
        assert_eq!(
            normalize_request_path("https://host/data.csv"),
            "https://host/data.csv"
        );
        assert_eq!(
            normalize_request_path("/http://host:8080/data.csv"),
            "http://host:8080/data.csv"
        );
    }

    #[test]
    fn test_table_and_column_suffix() {
        let req = NestedRequest::parse("https://host/dir/db.sqlite/orders/total").expect("parse");
        assert_eq!(req.data_set_path, "/dir/db.sqlite");
        assert_eq!(req.table.as_deref(), Some("orders"));
        assert_eq!(req.column_path.as_deref(), Some("total"));

        // Three plain segments past the file cannot be table/column.
        let req = NestedRequest::parse("https://host/db.sqlite/a/b/c").expect("parse");
        assert_eq!(req.data_set_path, "/db.sqlite/a/b/c");
        assert_eq!(req.table, None);
    }

    #[test]
    fn test_dotted_directories_stay_in_data_set() {
        let req = NestedRequest::parse("/v1.2/data.csv").expect("parse");
        assert_eq!(req.data_set_path, "/v1.2/data.csv");
        assert_eq!(req.table, None);

        let req = NestedRequest::parse("https://host/example.com/2024.01/sales.csv/tb0").expect("parse");
        assert_eq!(req.data_set_path, "/example.com/2024.01/sales.csv");
        assert_eq!(req.table.as_deref(), Some("tb0"));

        let req = NestedRequest::parse("https://host/v1.2/reports/2024/").expect("parse");
        assert_eq!(req.data_set_path, "/v1.2/reports/2024");
        assert_eq!(req.table, None);
    }

    #[test]
    fn test_directory_path_has_no_table() {
        let req = NestedRequest::parse("https://host/some/dir/").expect("parse");
        assert_eq!(req.data_set_path, "/some/dir");
        assert_eq!(req.table, None);
    }

    #[test]
    fn test_query_parameters() {
        let req = NestedRequest::parse(
            "https://host/a.csv?SELECT=name,%20count(*)&where=x%3E1&groupBy=name&having=count(*)%3E2&orderby=name&sortdirection=desc&limit=5&offset=10&debug=true",
        )
        .expect("parse");
        assert_eq!(req.select, vec!["name".to_string(), "count(*)".to_string()]);
        assert_eq!(req.where_clause.as_deref(), Some("x>1"));
        assert_eq!(req.group_by.as_deref(), Some("name"));
        assert_eq!(req.having.as_deref(), Some("count(*)>2"));
        assert_eq!(req.order_by.as_deref(), Some("name"));
        assert_eq!(req.sort_direction, Some(SortDirection::Desc));
        assert_eq!(req.limit, Some(5));
        assert_eq!(req.offset, Some(10));
        assert!(req.debug);
        assert!(!req.data_set_path.contains('?'));
    }

    #[test]
    fn test_invalid_query_values() {
        for raw in [
            "https://host/a.csv?limit=ten",
            "https://host/a.csv?offset=-1",
            "https://host/a.csv?sortdirection=sideways",
        ] {
            let err = NestedRequest::parse(raw).expect_err(raw);
            assert_eq!(err.kind(), crate::ErrorKind::MalformedRequest, "{raw}");
        }
    }

    #[test]
    fn test_local_mode() {
        let req = NestedRequest::parse("/reports/q1.csv?limit=2").expect("parse");
        assert!(req.is_local());
        assert_eq!(req.host, None);
        assert_eq!(req.data_set_path, "/reports/q1.csv");
        assert_eq!(req.limit, Some(2));

        let root = NestedRequest::parse("/").expect("parse root");
        assert_eq!(root.data_set_path, "/");
    }

    #[test]
    fn test_unusable_requests() {
        for raw in [
            "ftp://host/file.csv",
            "/ftp://host/file.csv",
            "relative/file.csv",
            "/a/../etc/passwd",
            "https://",
        ] {
            let err = NestedRequest::parse(raw).expect_err(raw);
            assert_eq!(err.kind(), crate::ErrorKind::MalformedRequest, "{raw}");
        }
    }

    #[test]
    fn test_percent_encoded_path() {
        let req = NestedRequest::parse("https://host/my%20data/q%231.csv").expect("parse");
        assert_eq!(req.data_set_path, "/my data/q#1.csv");
    }

    #[test]
    fn test_pipeline_detection() {
        let req = NestedRequest::parse("/pipeline/sales/tb0").expect("parse");
        assert!(req.is_pipeline());
        assert_eq!(req.path_segments(), vec!["pipeline", "sales", "tb0"]);
    }

    #[test]
    fn test_display_round_trips_location() {
        let req = NestedRequest::parse("/https:/alias@host/path/file.csv/tb0").expect("parse");
        assert_eq!(req.to_string(), "https://alias@host/path/file.csv/tb0");
    }
}
