//! Reference metadata record and its content hash.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::core::types::Role;

/// Structured metadata attached to a task reference.
///
/// Each write replaces the whole record. Fields this version does not know
/// about are kept in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub role: String,
    pub status: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub skills: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub commits: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetadataRecord {
    pub fn new(role: Role, status: &str) -> Self {
        Self {
            role: role.as_str().to_string(),
            status: status.to_string(),
            labels: BTreeSet::new(),
            skills: BTreeSet::new(),
            commits: 0,
            last_activity: None,
            extra: Map::new(),
        }
    }

    /// Role parsed from the stored string, if it is one we know.
    pub fn role(&self) -> Option<Role> {
        self.role.parse().ok()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw.trim())
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// SHA-256 (hex) over the raw stored note content.
pub fn content_hash(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// A record together with the hash of the content it was parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub record: MetadataRecord,
    pub hash: String,
}
