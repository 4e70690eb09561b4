//! Interceptor Relay - an intercepting HTTP relay with live exchange streaming
//!
//! Requests addressed to `/{code}/...` are forwarded to the destination
//! registered for `code`. Every exchange is captured with sensitive headers
//! removed, streamed to live observers over SSE, and persisted for later
//! paging.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod proxy;

pub use application::Application;
pub use error::{Error, Result};
