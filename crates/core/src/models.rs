//! Domain model types used throughout restfed.
//!
//! These types bridge the remote directory client, the sync engine and the
//! local identity store.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Remote record
// ---------------------------------------------------------------------------

/// One user as served by the remote directory.
///
/// `roles` and `attributes` distinguish "absent" (leave local state alone)
/// from "empty" (clear what this source owns).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub roles: Option<BTreeSet<String>>,
    #[serde(default)]
    pub attributes: Option<BTreeMap<String, Vec<String>>>,
    #[serde(default)]
    pub password: Option<String>,
}

impl RemoteRecord {
    /// Username if present and non-empty.
    pub fn username(&self) -> Option<&str> {
        self.user_name.as_deref().filter(|s| !s.is_empty())
    }

    /// Email if present and non-empty.
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref().filter(|s| !s.is_empty())
    }

    /// Both identity keys are present, so the record may be projected.
    pub fn is_eligible(&self) -> bool {
        self.username().is_some() && self.email().is_some()
    }
}

// ---------------------------------------------------------------------------
// Local identity
// ---------------------------------------------------------------------------

/// Where a role lives in the local store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "client")]
pub enum RoleScope {
    Realm,
    Client(String),
}

impl RoleScope {
    /// Stable storage key for the scope.
    pub fn key(&self) -> String {
        match self {
            Self::Realm => "realm".to_string(),
            Self::Client(client) => format!("client:{}", client),
        }
    }

    /// Inverse of [`RoleScope::key`].
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "realm" => Some(Self::Realm),
            other => other
                .strip_prefix("client:")
                .map(|client| Self::Client(client.to_string())),
        }
    }
}

impl std::fmt::Display for RoleScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Realm => write!(f, "realm"),
            Self::Client(client) => write!(f, "client '{}'", client),
        }
    }
}

/// A role granted to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoleGrant {
    pub scope: RoleScope,
    pub name: String,
}

impl RoleGrant {
    pub fn new(scope: RoleScope, name: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
        }
    }
}

/// Credential type used for synchronized passwords.
pub const PASSWORD_CREDENTIAL: &str = "password";

/// A stored credential (opaque hashed material plus hashing metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub credential_type: String,
    pub value: String,
    pub algorithm: String,
    pub hash_iterations: u32,
    /// Milliseconds since the Unix epoch.
    pub created_date: i64,
}

/// A user in the local identity store.
///
/// The engine mutates these but the store owns their lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub enabled: bool,
    pub email_verified: bool,
    /// Source that created and owns this identity, if any.
    pub federation_link: Option<String>,
    pub roles: BTreeSet<RoleGrant>,
    pub attributes: BTreeMap<String, Vec<String>>,
    pub credentials: Vec<Credential>,
    pub created_at: DateTime<Utc>,
}

impl LocalIdentity {
    /// A fresh, unlinked identity with only a username.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.into().to_lowercase(),
            email: None,
            first_name: None,
            last_name: None,
            enabled: false,
            email_verified: false,
            federation_link: None,
            roles: BTreeSet::new(),
            attributes: BTreeMap::new(),
            credentials: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Whether `source_id` owns this identity.
    pub fn is_linked_to(&self, source_id: &str) -> bool {
        self.federation_link.as_deref() == Some(source_id)
    }

    /// Names of roles granted in `scope`.
    pub fn role_names(&self, scope: &RoleScope) -> Vec<&str> {
        self.roles
            .iter()
            .filter(|r| &r.scope == scope)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// The stored password credential, if any.
    pub fn password_credential(&self) -> Option<&Credential> {
        self.credentials
            .iter()
            .find(|c| c.credential_type == PASSWORD_CREDENTIAL)
    }
}

// ---------------------------------------------------------------------------
// Sync run
// ---------------------------------------------------------------------------

/// Which slice of the remote directory a run reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "since")]
pub enum SyncMode {
    Full,
    UpdatedSince(DateTime<Utc>),
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::UpdatedSince(since) => write!(f, "updated since {}", since.to_rfc3339()),
        }
    }
}

/// Counters accumulated over one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub failed: usize,
    /// The run was skipped (by-pass active).
    pub ignored: bool,
}

impl SyncResult {
    /// Result of a by-passed run.
    pub fn empty() -> Self {
        Self {
            ignored: true,
            ..Default::default()
        }
    }

    pub fn increase_added(&mut self) {
        self.added += 1;
    }

    pub fn increase_updated(&mut self) {
        self.updated += 1;
    }

    pub fn increase_failed(&mut self) {
        self.failed += 1;
    }
}

impl std::fmt::Display for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.ignored {
            return write!(f, "Synchronization ignored as it's already in progress or by-passed");
        }
        write!(
            f,
            "{} imported users, {} updated users, {} removed users, {} users failed sync",
            self.added, self.updated, self.removed, self.failed
        )
    }
}

// ---------------------------------------------------------------------------
// Audit Entry
// ---------------------------------------------------------------------------

/// An audit-log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: String,
    pub details: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create a success audit entry.
    pub fn success(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a failure audit entry.
    pub fn failure(action: &str, details: &str) -> Self {
        Self {
            action: action.to_string(),
            details: details.to_string(),
            success: false,
            timestamp: Utc::now(),
        }
    }
}
