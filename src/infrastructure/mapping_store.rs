//! Mapping lookup
//!
//! The relay never writes mappings; registration belongs to another
//! service. The in-memory store is seeded from configuration.

use crate::domain::{Mapping, MappingCode};
use crate::infrastructure::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::{PgPool, Row};
use std::collections::HashMap;

#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Mapping for `code` regardless of its state
    async fn get(&self, code: &MappingCode) -> Result<Option<Mapping>, StoreError>;

    /// Active mapping for `code`; inactive mappings are invisible
    async fn lookup(&self, code: &MappingCode) -> Result<Option<Mapping>, StoreError> {
        Ok(self.get(code).await?.filter(|mapping| mapping.active))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryMappingStore {
    mappings: RwLock<HashMap<MappingCode, Mapping>>,
}

impl InMemoryMappingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mappings(mappings: impl IntoIterator<Item = Mapping>) -> Self {
        let store = Self::new();
        for mapping in mappings {
            store.insert(mapping);
        }
        store
    }

    /// Insert or replace
    pub fn insert(&self, mapping: Mapping) {
        self.mappings.write().insert(mapping.code.clone(), mapping);
    }

    pub fn remove(&self, code: &MappingCode) -> Option<Mapping> {
        self.mappings.write().remove(code)
    }

    pub fn len(&self) -> usize {
        self.mappings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.read().is_empty()
    }
}

#[async_trait]
impl MappingStore for InMemoryMappingStore {
    async fn get(&self, code: &MappingCode) -> Result<Option<Mapping>, StoreError> {
        Ok(self.mappings.read().get(code).cloned())
    }
}

/// Mappings table owned by the registration service
#[derive(Debug, Clone)]
pub struct PostgresMappingStore {
    pool: PgPool,
}

impl PostgresMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MappingStore for PostgresMappingStore {
    async fn get(&self, code: &MappingCode) -> Result<Option<Mapping>, StoreError> {
        let row = sqlx::query(
            "SELECT code, destination_base_url, active, owner, created_at \
             FROM mappings WHERE code = $1",
        )
        .bind(code.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let stored_code: String = row.try_get("code")?;
        let code = MappingCode::try_new(stored_code.clone())
            .map_err(|e| StoreError::Corrupt(format!("mapping code '{stored_code}': {e}")))?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;

        Ok(Some(Mapping {
            code,
            destination_base_url: row.try_get("destination_base_url")?,
            active: row.try_get("active")?,
            owner: row.try_get("owner")?,
            created_at,
        }))
    }
}
