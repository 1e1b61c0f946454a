// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! nestql: query remote files through nested URLs
//!
//! A request path embeds a second URL (`/https://alias@host/dir/file.csv`).
//! The file is fetched once, converted to a SQLite artifact in a local cache
//! and queried with the request's select/where/order parameters until its
//! time-to-live runs out.

pub mod cache;
pub mod cache_key;
pub mod config;
pub mod convert;
mod error;
pub mod fetch;
pub mod query;
pub mod remote;
pub mod render;
pub mod request;
pub mod resolve;
pub mod service;
pub mod stream;

pub use cache::{CacheState, CacheStore};
pub use config::{BackendConfig, Config, ConfigStore, PipelineDescriptor, RemoteDescriptor, Settings};
pub use error::{Error, ErrorKind, Result};
pub use render::{OutputFormat, TableRenderer};
pub use request::NestedRequest;
pub use resolve::{Resolution, Route};
pub use service::{Engine, Plan, RequestOptions, Served};
pub use stream::{QueryResult, RowLinks};
