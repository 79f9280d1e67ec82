//! Local identity store seam.
//!
//! The engine never holds a store session across records. Each record is
//! applied through [`IdentityStore::unit_of_work`], which hands a fresh
//! [`StoreSession`] to the closure and commits only if the closure succeeds.

pub mod schema;
pub mod sqlite;

pub use sqlite::{Database, SqliteIdentityStore};

use crate::errors::{RecordError, StoreError};
use crate::models::{LocalIdentity, RoleScope};

/// Operations available inside one unit of work.
pub trait StoreSession {
    /// Look up an identity in the primary index (case-insensitive username).
    fn find_by_username(&mut self, username: &str) -> Result<Option<LocalIdentity>, StoreError>;

    /// Look up an identity through every layer the store has, read caches
    /// included. Stores without such layers answer like [`find_by_username`].
    ///
    /// [`find_by_username`]: StoreSession::find_by_username
    fn find_through_storage(
        &mut self,
        username: &str,
    ) -> Result<Option<LocalIdentity>, StoreError> {
        self.find_by_username(username)
    }

    /// Allocate a new, unlinked identity with the given username.
    fn create_identity(&mut self, username: &str) -> Result<LocalIdentity, StoreError>;

    /// Persist every field of `identity`, including roles, attributes and
    /// credentials.
    fn save_identity(&mut self, identity: &LocalIdentity) -> Result<(), StoreError>;

    fn remove_identity(&mut self, id: &str) -> Result<(), StoreError>;

    /// Drop any cached copy of the identity.
    fn evict_from_cache(&mut self, id: &str);

    fn client_exists(&mut self, client_id: &str) -> Result<bool, StoreError>;

    fn role_exists(&mut self, scope: &RoleScope, name: &str) -> Result<bool, StoreError>;

    fn create_role(&mut self, scope: &RoleScope, name: &str) -> Result<(), StoreError>;
}

/// Factory for isolated units of work.
pub trait IdentityStore: Send + Sync {
    /// Run `work` against a fresh session. Changes are committed when `work`
    /// returns `Ok` and discarded otherwise.
    fn unit_of_work(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreSession) -> Result<(), RecordError>,
    ) -> Result<(), RecordError>;
}
