//! Domain types for the interceptor relay
//!
//! Mappings select a destination, exchange records describe what was
//! forwarded, identifiers tie the two together.

pub mod exchange;
pub mod identifiers;
pub mod mapping;

pub use exchange::*;
pub use identifiers::*;
pub use mapping::*;
