pub mod query;
pub mod resolve;
pub mod status;

pub use query::query_command;
pub use resolve::resolve_command;
pub use status::status_command;
