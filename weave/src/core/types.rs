//! Shared deterministic types for the weave core.
//!
//! These types define stable contracts between core components and the
//! persisted formats. They do no I/O.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::identity::to_canonical_name;
use crate::error::WeaveError;

/// Agent role; selects the Definition-of-Done checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Pm,
    Architect,
    #[serde(alias = "engineer")]
    Implementer,
    Reviewer,
    Ux,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Pm,
        Role::Architect,
        Role::Implementer,
        Role::Reviewer,
        Role::Ux,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Pm => "pm",
            Role::Architect => "architect",
            Role::Implementer => "implementer",
            Role::Reviewer => "reviewer",
            Role::Ux => "ux",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = WeaveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pm" => Ok(Role::Pm),
            "architect" => Ok(Role::Architect),
            "implementer" | "engineer" => Ok(Role::Implementer),
            "reviewer" => Ok(Role::Reviewer),
            "ux" => Ok(Role::Ux),
            other => Err(WeaveError::identifier(
                other,
                "unknown role (pm, architect, implementer, reviewer, ux)",
            )),
        }
    }
}

/// A unit of work. Immutable once spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: u64,
    pub canonical_name: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Build a task, deriving the canonical name from `slug` (or the role name).
    pub fn new(id: u64, role: Role, slug: Option<&str>) -> Result<Self, WeaveError> {
        let canonical_name = to_canonical_name(id, slug.unwrap_or(role.as_str()))?;
        Ok(Self {
            id,
            canonical_name,
            role,
            created_at: Utc::now(),
        })
    }
}

/// Ground-truth agreement between cache, registry and filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Healthy,
    /// Present on disk or in the registry but not in the cache (or the reverse).
    Orphaned,
    /// Cached, but the directory is gone.
    Missing,
}

impl Health {
    pub fn is_healthy(&self) -> bool {
        *self == Health::Healthy
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Healthy => "healthy",
            Health::Orphaned => "orphaned",
            Health::Missing => "missing",
        })
    }
}

/// Workspace lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceState {
    Requested,
    Created,
    Active,
    Completing,
    Removed,
    Corrupted,
}

impl WorkspaceState {
    /// Allowed transitions. `Corrupted` is left only through `recover`, which
    /// either restores `Active` or drops the workspace (`Removed`).
    pub fn can_transition_to(self, next: WorkspaceState) -> bool {
        use WorkspaceState::{Active, Completing, Corrupted, Created, Removed, Requested};
        matches!(
            (self, next),
            (Requested, Created)
                | (Created, Active)
                | (Active, Completing)
                | (Completing, Removed)
                | (Completing, Active)
                | (Created, Corrupted)
                | (Active, Corrupted)
                | (Corrupted, Active)
                | (Corrupted, Removed)
        )
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkspaceState::Requested => "requested",
            WorkspaceState::Created => "created",
            WorkspaceState::Active => "active",
            WorkspaceState::Completing => "completing",
            WorkspaceState::Removed => "removed",
            WorkspaceState::Corrupted => "corrupted",
        })
    }
}

/// Status strings written into reference metadata.
pub mod status {
    pub const ACTIVE: &str = "active";
    pub const COMPLETING: &str = "completing";
    pub const COMPLETED: &str = "completed";
    pub const ORPHANED: &str = "orphaned";
    pub const RECOVERED: &str = "recovered";
}
