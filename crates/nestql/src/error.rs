// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Error types for the request pipeline
//!
//! Errors are `Clone` so the outcome of a single cache build can be handed to
//! every request that was waiting on it. Underlying library errors are
//! flattened to their messages for that reason.

use std::time::Duration;
use thiserror::Error;

/// Result type for nestql operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("Query failed: {message}")]
    QueryFailed {
        message: String,
        /// Only populated when the request asked for debug output
        sql: Option<String>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Deadline of {after:?} exceeded during {stage}")]
    Timeout { stage: String, after: Duration },

    #[error("Cache build for key {0} was abandoned by its initiating request")]
    Cancelled(String),
}

/// Coarse classification used for exit codes and status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedRequest,
    NotFound,
    ConversionFailed,
    IoFailure,
    QueryFailed,
    Config,
    Timeout,
    Cancelled,
}

impl Error {
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedRequest(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn conversion<S: Into<String>>(msg: S) -> Self {
        Error::ConversionFailed(msg.into())
    }

    pub fn io<S: Into<String>>(msg: S) -> Self {
        Error::IoFailure(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn timeout<S: Into<String>>(stage: S, after: Duration) -> Self {
        Error::Timeout {
            stage: stage.into(),
            after,
        }
    }

    /// Build a query failure, attaching the SQL only when `debug` is set
    pub fn query<S: Into<String>>(msg: S, sql: &str, debug: bool) -> Self {
        Error::QueryFailed {
            message: msg.into(),
            sql: debug.then(|| sql.to_string()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedRequest(_) => ErrorKind::MalformedRequest,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::ConversionFailed(_) => ErrorKind::ConversionFailed,
            Error::IoFailure(_) => ErrorKind::IoFailure,
            Error::QueryFailed { .. } => ErrorKind::QueryFailed,
            Error::Config(_) => ErrorKind::Config,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// HTTP-style status for hosts that serve results over a request/response protocol
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::MalformedRequest | ErrorKind::QueryFailed => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::ConversionFailed | ErrorKind::IoFailure | ErrorKind::Config => 500,
            ErrorKind::Cancelled => 502,
            ErrorKind::Timeout => 504,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            _ => Error::IoFailure(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::IoFailure(format!("SQLite: {}", err))
    }
}

impl From<object_store::Error> for Error {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => {
                Error::NotFound(format!("remote object '{}'", path))
            }
            other => Error::IoFailure(format!("Remote storage: {}", other)),
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::MalformedRequest(format!("URL parse error: {}", err))
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(err: serde_yaml_ng::Error) -> Self {
        Error::Config(format!("Invalid YAML: {}", err))
    }
}

impl From<tera::Error> for Error {
    fn from(err: tera::Error) -> Self {
        Error::Config(format!("Template expansion failed: {}", err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IoFailure(format!("Background task failed: {}", err))
    }
}
