//! Core types for reconciliation runs

use crate::model::RoleSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Whether operations mutate the server or only report what they would do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Send mutating statements
    #[default]
    Apply,
    /// Re-check preconditions only
    Check,
}

impl Mode {
    pub fn is_check(&self) -> bool {
        matches!(self, Self::Check)
    }
}

/// Major versions accepted when nothing else is configured (2008 through 2022).
pub const DEFAULT_SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 10..=16;

/// Options for a reconciliation run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: Mode,
    /// Worker threads; 0 means one per available core
    pub jobs: usize,
    /// Major versions the engine will run against
    pub supported_versions: BTreeSet<u32>,
    /// Roles that are created when requested but missing
    pub auto_create_roles: RoleSet,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Apply,
            jobs: 0,
            supported_versions: DEFAULT_SUPPORTED_VERSIONS.collect(),
            auto_create_roles: RoleSet::new(),
        }
    }
}

impl RunOptions {
    pub fn check() -> Self {
        Self {
            mode: Mode::Check,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }
}

/// Snapshot of a login as read from the server catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedLoginState {
    pub exists: bool,
    pub enabled: bool,
    /// True when undeclared or equal to the declared value
    pub default_database_matches: bool,
    pub default_language_matches: bool,
    pub password_matches: bool,
    /// One entry per declared binding, in declaration order
    pub bindings: Vec<ObservedBinding>,
}

impl ObservedLoginState {
    /// What a login that does not exist yet looks like.
    pub fn missing() -> Self {
        Self {
            exists: false,
            enabled: true,
            default_database_matches: true,
            default_language_matches: true,
            password_matches: true,
            bindings: Vec::new(),
        }
    }
}

/// Observed state of one (user, database) binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedBinding {
    pub user: String,
    pub database: String,
    pub status: BindingStatus,
}

/// Whether a binding can be reconciled, and what the catalog holds if so.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingStatus {
    /// The database must not be touched right now
    Skipped(SkipReason),
    /// Reading the database failed
    Failed(String),
    /// The database was readable
    Ready(ObservedUserState),
}

/// Why a database binding was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Offline or read-only
    Unavailable,
    /// Not the primary replica of its availability group
    NotPrimaryReplica,
    /// Mirroring secondary
    MirroredSecondary,
}

impl SkipReason {
    /// Warning text for a skipped database.
    pub fn warning(&self, database: &str) -> String {
        match self {
            Self::Unavailable => format!("database: {database} unavailable"),
            Self::NotPrimaryReplica => format!("database: {database} is not primary hadr replica"),
            Self::MirroredSecondary => format!("database: {database} is a mirrored secondary"),
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::NotPrimaryReplica => write!(f, "not primary replica"),
            Self::MirroredSecondary => write!(f, "mirrored secondary"),
        }
    }
}

/// Snapshot of a database user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedUserState {
    pub exists: bool,
    /// Mapped to the login being reconciled
    pub linked: bool,
    pub memberships: RoleSet,
    pub available_roles: RoleSet,
}
