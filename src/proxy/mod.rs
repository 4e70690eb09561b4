//! Proxy module for forwarding, capturing and streaming exchanges
//!
//! Two paths run side by side:
//! - Forwarding: route by mapping code, rewrite, relay the response as it
//!   streams in
//! - Recording: every dispatched exchange becomes an `ExchangeRecord`,
//!   broadcast to observers and queued for persistence without blocking
//!   the caller

pub mod capture;
pub mod error_response;
pub mod forwarding;
pub mod guard;
pub mod headers;
pub mod log_writer;
pub mod middleware;
pub mod middleware_stack;
pub mod mock;
pub mod observer_hub;
pub mod recorder;
pub mod service;
pub mod types;
pub mod url_resolver;

#[cfg(test)]
pub mod test_utils;


pub use service::{BackgroundTasks, RelayComponents, RelayService, RelayState};
pub use types::{DeploymentMode, ProxyConfig, ProxyError, ProxyResult};
