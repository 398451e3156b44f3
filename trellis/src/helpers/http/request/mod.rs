//! Helpers for HTTP requests

pub mod path;
pub mod query_string;
