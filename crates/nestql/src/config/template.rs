// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Tera pre-expansion for configuration files
//!
//! Lets credentials stay out of the YAML file itself:
//!
//! ```text
//! remotes:
//!   r2-auth:
//!     backend:
//!       type: s3
//!       secret_access_key: "{{ env(name='R2_SECRET') }}"
//!       region: "{{ env(name='R2_REGION', default='auto') }}"
//! ```

use crate::Result;
use std::collections::HashMap;
use tera::{Tera, Value};

/// Expand `env(...)` calls in configuration text
pub fn expand_config_template(content: &str) -> Result<String> {
    let mut tera = Tera::default();
    tera.register_function("env", lookup_env);
    tera.render_str(content, &tera::Context::new())
        .map_err(|e| crate::Error::config(format!("Template expansion failed: {}", source_chain(&e))))
}

/// Tera nests the useful message (e.g. the missing variable) in `source()`
fn source_chain(err: &tera::Error) -> String {
    std::iter::successors(Some(err as &dyn std::error::Error), |e| e.source())
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ")
}

/// `env(name="VAR")`, with an optional `default="x"` for unset variables
fn lookup_env(args: &HashMap<String, Value>) -> tera::Result<Value> {
    let arg = |key: &str| args.get(key).and_then(Value::as_str);
    let name = arg("name").ok_or_else(|| tera::Error::msg("env() takes a 'name' argument"))?;
    match (std::env::var(name), arg("default")) {
        (Ok(value), _) => Ok(Value::String(value)),
        (Err(std::env::VarError::NotPresent), Some(default)) => Ok(Value::String(default.to_string())),
        (Err(e), _) => Err(tera::Error::msg(format!("env '{}': {}", name, e))),
    }
}
