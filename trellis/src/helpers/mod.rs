//! Helpers used across the framework and made available to applications.

pub mod http;
