//! Application wiring
//!
//! Turns `Settings` into running components: stores, session validator,
//! relay service, and the HTTP server with graceful shutdown.

pub mod app;

pub use app::Application;
