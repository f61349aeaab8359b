//! Row models returned by the repository.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in the syncer and the token manager.

use chrono::{DateTime, Utc};

use crate::model::EntityType;

/// Stored link between an upstream record and its content-store record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapping {
    pub entity_type: EntityType,
    pub external_id: i64,
    pub internal_id: String,
    /// Version indicator of the last successful upsert.
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    pub character_id: i64,
    pub access_token: Option<String>,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}
