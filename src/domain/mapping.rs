//! Mapping from a public code to a destination base URL

use crate::domain::identifiers::MappingCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner recorded for mappings when access control is bypassed
pub const SYSTEM_OWNER: &str = "system";

/// A registered code → destination binding
///
/// Mappings are owned by the registration API; the relay only reads them.
/// The destination is kept as the raw stored string and validated when a
/// request is forwarded, so a misconfigured row surfaces as a 400 instead
/// of failing the lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub code: MappingCode,
    pub destination_base_url: String,
    pub active: bool,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

impl Mapping {
    /// Create an active mapping owned by the system identity
    pub fn new(code: MappingCode, destination_base_url: impl Into<String>) -> Self {
        Self {
            code,
            destination_base_url: destination_base_url.into(),
            active: true,
            owner: SYSTEM_OWNER.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn is_owned_by(&self, identity: &str) -> bool {
        self.owner == identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code() -> MappingCode {
        MappingCode::try_new("ab12cd").unwrap()
    }

    #[test]
    fn new_mapping_is_active_and_system_owned() {
        let mapping = Mapping::new(code(), "https://example.test");
        assert!(mapping.active);
        assert_eq!(mapping.owner, SYSTEM_OWNER);
        assert!(mapping.is_owned_by(SYSTEM_OWNER));
    }

    #[test]
    fn builder_methods_adjust_owner_and_state() {
        let mapping = Mapping::new(code(), "https://example.test")
            .with_owner("user-1")
            .deactivated();
        assert!(!mapping.active);
        assert!(mapping.is_owned_by("user-1"));
        assert!(!mapping.is_owned_by(SYSTEM_OWNER));
    }

    #[test]
    fn mapping_serializes_with_camel_case_fields() {
        let json = serde_json::to_value(Mapping::new(code(), "https://example.test")).unwrap();
        assert_eq!(json["destinationBaseUrl"], "https://example.test");
        assert_eq!(json["code"], "ab12cd");
        assert!(json.get("createdAt").is_some());
    }
}
