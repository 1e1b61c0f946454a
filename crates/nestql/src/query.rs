// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! SQL composition from request fields
//!
//! The WHERE, GROUP BY and HAVING fragments are inserted verbatim: the
//! request parser is the trust boundary for them. Composition itself never
//! fails; the artifact is opened read-only when the statement runs.

use crate::convert::DEFAULT_TABLE;
use crate::request::{NestedRequest, SortDirection};

/// Quote an SQL identifier, doubling embedded quotes
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Select items that are plain names get quoted; `*` and expressions pass through
fn select_item(item: &str) -> String {
    let is_expression = item == "*"
        || item.contains('(')
        || item.contains(char::is_whitespace)
        || item.starts_with('"');
    if is_expression {
        item.to_string()
    } else {
        quote_ident(item)
    }
}

/// Everything that shapes one SELECT
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryShape {
    pub table: Option<String>,
    pub select: Vec<String>,
    pub where_clause: Option<String>,
    pub group_by: Option<String>,
    pub having: Option<String>,
    pub order_by: Option<String>,
    pub sort_direction: Option<SortDirection>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryShape {
    /// Shape from a parsed request; a column path stands in for an empty select
    #[must_use]
    pub fn from_request(request: &NestedRequest, table: Option<String>, column: Option<String>) -> Self {
        let select = if request.select.is_empty() {
            column.into_iter().collect()
        } else {
            request.select.clone()
        };
        Self {
            table,
            select,
            where_clause: request.where_clause.clone(),
            group_by: request.group_by.clone(),
            having: request.having.clone(),
            order_by: request.order_by.clone(),
            sort_direction: request.sort_direction,
            limit: request.limit,
            offset: request.offset,
        }
    }

    /// Compose the SELECT statement
    ///
    /// Without an explicit ordering, grouped queries order by the grouping
    /// expression and plain queries by `rowid`, so paging is reproducible.
    #[must_use]
    pub fn compose(&self) -> String {
        let columns = if self.select.is_empty() {
            "*".to_string()
        } else {
            self.select
                .iter()
                .map(|s| select_item(s))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let table = self.table.as_deref().unwrap_or(DEFAULT_TABLE);

        let mut sql = format!("SELECT {} FROM {}", columns, quote_ident(table));

        if let Some(w) = &self.where_clause {
            sql.push_str(&format!(" WHERE {}", w));
        }
        if let Some(g) = &self.group_by {
            sql.push_str(&format!(" GROUP BY {}", g));
        }
        if let Some(h) = &self.having {
            sql.push_str(&format!(" HAVING {}", h));
        }

        match (&self.order_by, &self.group_by) {
            (Some(order), _) => {
                let direction = self.sort_direction.unwrap_or(SortDirection::Asc);
                sql.push_str(&format!(" ORDER BY {} {}", order, direction.as_sql()));
            }
            (None, Some(group)) => sql.push_str(&format!(" ORDER BY {}", group)),
            (None, None) => sql.push_str(" ORDER BY rowid"),
        }

        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }
        sql
    }
}

/// Statement listing the tables and views of an artifact
#[must_use]
pub fn compose_catalog() -> String {
    "SELECT name, type FROM sqlite_master WHERE type IN ('table', 'view') ORDER BY name".to_string()
}
