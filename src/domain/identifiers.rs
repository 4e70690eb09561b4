//! Identifiers used across the relay
//!
//! Generated identifiers are newtypes around UUID v7 so that records and
//! observers sort by creation time. Externally supplied identifiers
//! (mapping codes, client keys) are validated at the boundary.

use nutype::nutype;
use uuid::Uuid;

/// Maximum length of a mapping code
pub const MAPPING_CODE_MAX_LEN: usize = 64;

/// Correlation id for one inbound request, echoed in `x-request-id`
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRef
))]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }

    /// Parse an id previously rendered with `Display`
    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self::new)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Unique identifier of a captured exchange record
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRef
))]
pub struct ExchangeId(Uuid);

impl ExchangeId {
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::generate()
    }
}

/// Identifier of a live observer connection
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRef
))]
pub struct ObserverId(Uuid);

impl ObserverId {
    pub fn generate() -> Self {
        Self::new(Uuid::now_v7())
    }
}

/// Short public code that selects a mapping
///
/// Codes appear as the first path segment of a proxied URL, so they are
/// restricted to URL-safe characters.
#[nutype(
    sanitize(trim),
    validate(
        not_empty,
        len_char_max = 64,
        predicate = |code: &str| code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    ),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        AsRef,
        Display
    )
)]
pub struct MappingCode(String);

/// Key used to bucket clients for rate limiting
#[nutype(
    sanitize(trim),
    derive(Debug, Clone, PartialEq, Eq, Hash, AsRef, Display)
)]
pub struct ClientKey(String);

impl ClientKey {
    /// Key shared by every client whose address could not be determined
    pub fn unknown() -> Self {
        Self::new("unknown".to_string())
    }
}
