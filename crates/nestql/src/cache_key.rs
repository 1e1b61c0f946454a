// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Cache key derivation
//!
//! Keys are filesystem-safe names built from the alias, host, data set path
//! and a prefix of the stored remote configuration's fingerprint. The scheme
//! and query string never contribute, so `http`/`https` variants and
//! different query shapes share one artifact.
//!
//! Sanitizing is lossy (`/a/b.csv` and `/a_b.csv` read the same), so remote
//! keys end with a short digest of the unsanitized target.

use crate::request::NestedRequest;
use crate::resolve::{Resolution, Route};
use sha2::{Digest, Sha256};

/// Length of the fingerprint prefix embedded in keys
const FINGERPRINT_CHARS: usize = 16;

/// Keys longer than this are shortened with a digest suffix
const MAX_KEY_LEN: usize = 180;
const TRUNCATED_PREFIX_LEN: usize = 120;

/// Length of the target digest that ends every remote key
const TARGET_DIGEST_CHARS: usize = 8;

/// Derive the cache key for a resolved request
#[must_use]
pub fn cache_key(request: &NestedRequest, resolution: &Resolution) -> String {
    if let Route::Pipeline { id, .. } = &resolution.route {
        return bounded(sanitize(id));
    }

    let fingerprint = &resolution.stored_fingerprint
        [..FINGERPRINT_CHARS.min(resolution.stored_fingerprint.len())];
    let alias = request.user_alias.as_deref().unwrap_or_default();
    let host = request.host.as_deref().unwrap_or("local");
    let path = request.data_set_path.as_str();

    let mut parts: Vec<String> = [alias, host, path, fingerprint]
        .iter()
        .map(|p| sanitize(p))
        .filter(|p| !p.is_empty())
        .collect();
    parts.push(target_digest(&[alias, host, path]));

    bounded(parts.join("-"))
}

/// Short digest of the raw target parts, NUL separated
fn target_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    digest[..TARGET_DIGEST_CHARS].to_string()
}

/// Replace anything outside `[A-Za-z0-9._@-]` with `_`, collapsing runs
#[must_use]
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let safe = c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '-');
        let c = if safe { c } else { '_' };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    // A leading dot would hide the artifact; ".." must never appear alone.
    out.trim_matches(|c| c == '_' || c == '.').to_string()
}

fn bounded(key: String) -> String {
    if key.len() <= MAX_KEY_LEN {
        return key;
    }
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    // Keys are ASCII after sanitizing, so byte slicing is safe.
    format!("{}-{}", &key[..TRUNCATED_PREFIX_LEN], &digest[..FINGERPRINT_CHARS])
}
