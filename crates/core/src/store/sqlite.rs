//! SQLite-backed identity store.
//!
//! [`Database`] owns the connection (WAL journaling, foreign keys, schema
//! migrations) and the run bookkeeping tables. [`SqliteIdentityStore`] layers
//! the per-record unit of work and a read-through identity cache on top of it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use super::{schema, IdentityStore, StoreSession};
use crate::errors::{RecordError, StoreError};
use crate::models::{AuditEntry, Credential, LocalIdentity, RoleGrant, RoleScope};

// ---------------------------------------------------------------------------
// Database handle
// ---------------------------------------------------------------------------

/// Main database handle wrapping a SQLite connection.
///
/// The inner connection is wrapped in a `Mutex` so that `Database` is
/// `Send + Sync` and can be shared through an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening identity database");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("database opened successfully with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), StoreError> {
        info!("initializing identity store schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("identity store schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// A poisoned lock is recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit entry.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, details, success, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.action,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, "inserted audit_log entry");
        Ok(id)
    }

    /// Most recent audit entries, newest first.
    pub fn list_audit_entries(&self, limit: u32) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT action, details, success, created_at FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEntry {
                    action: row.get(0)?,
                    details: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    success: row.get(2)?,
                    timestamp: parse_datetime(&row.get::<_, String>(3)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// Parse a datetime string, returning `Utc::now()` as a fallback.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ---------------------------------------------------------------------------
// Identity store
// ---------------------------------------------------------------------------

type IdentityCache = Mutex<HashMap<String, LocalIdentity>>;

fn lock_cache(cache: &IdentityCache) -> MutexGuard<'_, HashMap<String, LocalIdentity>> {
    cache.lock().unwrap_or_else(|poisoned| {
        warn!("identity cache mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// [`IdentityStore`] over a [`Database`], with a read-through cache keyed by
/// lower-cased username.
///
/// The cache is only filled by [`SqliteIdentityStore::get_identity`]; a cached
/// entry can outlive its row when the row is deleted behind the store's back.
pub struct SqliteIdentityStore {
    db: Arc<Database>,
    cache: IdentityCache,
}

impl SqliteIdentityStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Declare a client so that roles can be scoped to it.
    pub fn register_client(&self, client_id: &str) -> Result<(), StoreError> {
        let conn = self.db.conn();
        conn.execute(
            "INSERT OR IGNORE INTO clients (client_id, created_at) VALUES (?1, ?2)",
            params![client_id, Utc::now().to_rfc3339()],
        )?;
        info!(client_id, "registered client");
        Ok(())
    }

    /// Read an identity through the cache.
    pub fn get_identity(&self, username: &str) -> Result<Option<LocalIdentity>, StoreError> {
        let key = username.to_lowercase();
        if let Some(hit) = lock_cache(&self.cache).get(&key) {
            return Ok(Some(hit.clone()));
        }
        let loaded = select_identity(&self.db.conn(), &key)?;
        if let Some(ref identity) = loaded {
            lock_cache(&self.cache).insert(key, identity.clone());
        }
        Ok(loaded)
    }

    /// Whether a copy of the identity is held in the cache.
    pub fn is_cached(&self, username: &str) -> bool {
        lock_cache(&self.cache).contains_key(&username.to_lowercase())
    }

    /// Every identity row, ordered by username.
    pub fn list_usernames(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare("SELECT username FROM identities ORDER BY username")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn unit_of_work(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreSession) -> Result<(), RecordError>,
    ) -> Result<(), RecordError> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        {
            let mut session = SqliteSession {
                conn: &tx,
                cache: &self.cache,
            };
            work(&mut session)?;
        }
        tx.commit()?;
        Ok(())
    }
}

/// Session bound to one open transaction.
struct SqliteSession<'a> {
    conn: &'a Connection,
    cache: &'a IdentityCache,
}

impl StoreSession for SqliteSession<'_> {
    fn find_by_username(&mut self, username: &str) -> Result<Option<LocalIdentity>, StoreError> {
        select_identity(self.conn, &username.to_lowercase())
    }

    fn find_through_storage(
        &mut self,
        username: &str,
    ) -> Result<Option<LocalIdentity>, StoreError> {
        let key = username.to_lowercase();
        if let Some(identity) = select_identity(self.conn, &key)? {
            return Ok(Some(identity));
        }
        Ok(lock_cache(self.cache).get(&key).cloned())
    }

    fn create_identity(&mut self, username: &str) -> Result<LocalIdentity, StoreError> {
        let identity = LocalIdentity::new(username);
        self.conn.execute(
            "INSERT INTO identities (id, username, enabled, email_verified, created_at)
             VALUES (?1, ?2, 0, 0, ?3)",
            params![
                identity.id,
                identity.username,
                identity.created_at.to_rfc3339()
            ],
        )?;
        debug!(id = %identity.id, username = %identity.username, "created identity");
        Ok(identity)
    }

    fn save_identity(&mut self, identity: &LocalIdentity) -> Result<(), StoreError> {
        write_identity(self.conn, identity)
    }

    fn remove_identity(&mut self, id: &str) -> Result<(), StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM identities WHERE id = ?1", params![id])?;
        if removed == 0 {
            return Err(StoreError::NotFound {
                entity: "identity".into(),
                id: id.to_string(),
            });
        }
        self.evict_from_cache(id);
        debug!(id, "removed identity");
        Ok(())
    }

    fn evict_from_cache(&mut self, id: &str) {
        lock_cache(self.cache).retain(|_, cached| cached.id != id);
    }

    fn client_exists(&mut self, client_id: &str) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM clients WHERE client_id = ?1",
                params![client_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn role_exists(&mut self, scope: &RoleScope, name: &str) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM roles WHERE scope = ?1 AND name = ?2",
                params![scope.key(), name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn create_role(&mut self, scope: &RoleScope, name: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO roles (scope, name, created_at) VALUES (?1, ?2, ?3)",
            params![scope.key(), name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn select_identity(conn: &Connection, username: &str) -> Result<Option<LocalIdentity>, StoreError> {
    let identity = conn
        .query_row(
            "SELECT id, username, email, first_name, last_name, enabled, email_verified,
                    federation_link, created_at
             FROM identities WHERE username = ?1",
            params![username],
            |row| {
                Ok(LocalIdentity {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    first_name: row.get(3)?,
                    last_name: row.get(4)?,
                    enabled: row.get(5)?,
                    email_verified: row.get(6)?,
                    federation_link: row.get(7)?,
                    roles: BTreeSet::new(),
                    attributes: BTreeMap::new(),
                    credentials: Vec::new(),
                    created_at: parse_datetime(&row.get::<_, String>(8)?),
                })
            },
        )
        .optional()?;

    let Some(mut identity) = identity else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT name, value FROM identity_attributes WHERE identity_id = ?1 ORDER BY name, position",
    )?;
    let rows = stmt
        .query_map(params![identity.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (name, value) in rows {
        identity.attributes.entry(name).or_default().push(value);
    }

    let mut stmt = conn.prepare("SELECT scope, name FROM role_mappings WHERE identity_id = ?1")?;
    let rows = stmt
        .query_map(params![identity.id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (scope, name) in rows {
        let scope = RoleScope::from_key(&scope).ok_or_else(|| StoreError::Corrupt {
            entity: "role_mapping".into(),
            detail: format!("unknown scope '{}'", scope),
        })?;
        identity.roles.insert(RoleGrant::new(scope, name));
    }

    let mut stmt = conn.prepare(
        "SELECT id, credential_type, value, algorithm, hash_iterations, created_date
         FROM credentials WHERE identity_id = ?1",
    )?;
    identity.credentials = stmt
        .query_map(params![identity.id], |row| {
            Ok(Credential {
                id: row.get(0)?,
                credential_type: row.get(1)?,
                value: row.get(2)?,
                algorithm: row.get(3)?,
                hash_iterations: row.get(4)?,
                created_date: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(identity))
}

fn write_identity(conn: &Connection, identity: &LocalIdentity) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE identities SET username = ?2, email = ?3, first_name = ?4, last_name = ?5,
                enabled = ?6, email_verified = ?7, federation_link = ?8
         WHERE id = ?1",
        params![
            identity.id,
            identity.username,
            identity.email,
            identity.first_name,
            identity.last_name,
            identity.enabled,
            identity.email_verified,
            identity.federation_link,
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::NotFound {
            entity: "identity".into(),
            id: identity.id.clone(),
        });
    }

    conn.execute(
        "DELETE FROM identity_attributes WHERE identity_id = ?1",
        params![identity.id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO identity_attributes (identity_id, name, position, value) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (name, values) in &identity.attributes {
        for (position, value) in values.iter().enumerate() {
            stmt.execute(params![identity.id, name, position as i64, value])?;
        }
    }

    conn.execute(
        "DELETE FROM role_mappings WHERE identity_id = ?1",
        params![identity.id],
    )?;
    let mut stmt =
        conn.prepare("INSERT INTO role_mappings (identity_id, scope, name) VALUES (?1, ?2, ?3)")?;
    for grant in &identity.roles {
        stmt.execute(params![identity.id, grant.scope.key(), grant.name])?;
    }

    conn.execute(
        "DELETE FROM credentials WHERE identity_id = ?1",
        params![identity.id],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO credentials (id, identity_id, credential_type, value, algorithm,
                                  hash_iterations, created_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for credential in &identity.credentials {
        stmt.execute(params![
            credential.id,
            identity.id,
            credential.credential_type,
            credential.value,
            credential.algorithm,
            credential.hash_iterations,
            credential.created_date,
        ])?;
    }

    debug!(id = %identity.id, username = %identity.username, "saved identity");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PASSWORD_CREDENTIAL;

    fn setup_store() -> SqliteIdentityStore {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        SqliteIdentityStore::new(Arc::new(db))
    }

    fn create(store: &SqliteIdentityStore, username: &str, email: &str) -> LocalIdentity {
        let mut created = None;
        store
            .unit_of_work(&mut |session| {
                let mut identity = session.create_identity(username)?;
                identity.email = Some(email.to_string());
                session.save_identity(&identity)?;
                created = Some(identity);
                Ok(())
            })
            .unwrap();
        created.unwrap()
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identities.db");
        let db = Database::new(&path).expect("failed to create file db");
        db.initialize().expect("failed to initialize schema");
        assert!(path.exists());
    }

    #[test]
    fn test_identity_round_trip() {
        let store = setup_store();
        store
            .unit_of_work(&mut |session| {
                let scope = RoleScope::Realm;
                session.create_role(&scope, "EXT_ADMIN")?;
                let mut identity = session.create_identity("Alice")?;
                identity.email = Some("a@x.com".into());
                identity.enabled = true;
                identity.federation_link = Some("rest-federation".into());
                identity.roles.insert(RoleGrant::new(scope, "EXT_ADMIN"));
                identity
                    .attributes
                    .insert("EXT_LOCALE".into(), vec!["fr".into(), "en".into()]);
                identity.credentials.push(Credential {
                    id: "cred-1".into(),
                    credential_type: PASSWORD_CREDENTIAL.into(),
                    value: "hash".into(),
                    algorithm: "sha256".into(),
                    hash_iterations: 1000,
                    created_date: 1_700_000_000_000,
                });
                session.save_identity(&identity)?;
                Ok(())
            })
            .unwrap();

        let loaded = store.get_identity("ALICE").unwrap().unwrap();
        assert_eq!(loaded.username, "alice");
        assert!(loaded.enabled);
        assert!(loaded.is_linked_to("rest-federation"));
        assert_eq!(loaded.role_names(&RoleScope::Realm), vec!["EXT_ADMIN"]);
        assert_eq!(loaded.attributes["EXT_LOCALE"], vec!["fr", "en"]);
        assert_eq!(loaded.password_credential().unwrap().hash_iterations, 1000);
    }

    #[test]
    fn test_failed_unit_of_work_rolls_back() {
        let store = setup_store();
        let result = store.unit_of_work(&mut |session| {
            session.create_identity("bob")?;
            Err(RecordError::MissingRequiredField("email"))
        });
        assert!(result.is_err());
        assert!(store.list_usernames().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_email_is_a_persistence_failure() {
        let store = setup_store();
        create(&store, "legacy", "a@x.com");
        let result = store.unit_of_work(&mut |session| {
            let mut identity = session.create_identity("alice")?;
            identity.email = Some("a@x.com".into());
            session.save_identity(&identity)?;
            Ok(())
        });
        assert!(matches!(result, Err(RecordError::Store(StoreError::Sqlite(_)))));
        assert_eq!(store.list_usernames().unwrap(), vec!["legacy"]);
    }

    #[test]
    fn test_role_mapping_requires_existing_role() {
        let store = setup_store();
        let result = store.unit_of_work(&mut |session| {
            let mut identity = session.create_identity("carol")?;
            identity
                .roles
                .insert(RoleGrant::new(RoleScope::Realm, "EXT_GHOST"));
            session.save_identity(&identity)?;
            Ok(())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_stale_cache_is_visible_through_storage_only() {
        let store = setup_store();
        let identity = create(&store, "dave", "d@x.com");
        assert!(store.get_identity("dave").unwrap().is_some());
        assert!(store.is_cached("dave"));

        store
            .database()
            .conn()
            .execute("DELETE FROM identities WHERE id = ?1", params![identity.id])
            .unwrap();

        store
            .unit_of_work(&mut |session| {
                assert!(session.find_by_username("dave")?.is_none());
                let cached = session.find_through_storage("dave")?.unwrap();
                session.evict_from_cache(&cached.id);
                Ok(())
            })
            .unwrap();
        assert!(!store.is_cached("dave"));
    }

    #[test]
    fn test_client_and_role_lookup() {
        let store = setup_store();
        store.register_client("portal").unwrap();
        store
            .unit_of_work(&mut |session| {
                assert!(session.client_exists("portal")?);
                assert!(!session.client_exists("other")?);
                let scope = RoleScope::Client("portal".into());
                assert!(!session.role_exists(&scope, "EXT_ADMIN")?);
                session.create_role(&scope, "EXT_ADMIN")?;
                assert!(session.role_exists(&scope, "EXT_ADMIN")?);
                assert!(!session.role_exists(&RoleScope::Realm, "EXT_ADMIN")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_remove_identity() {
        let store = setup_store();
        let identity = create(&store, "erin", "e@x.com");
        store
            .unit_of_work(&mut |session| {
                session.remove_identity(&identity.id)?;
                Ok(())
            })
            .unwrap();
        assert!(store.get_identity("erin").unwrap().is_none());
    }

    #[test]
    fn test_kv_state() {
        let store = setup_store();
        let db = store.database();
        assert!(db.get_state("last_sync_at").unwrap().is_none());
        db.set_state("last_sync_at", "a").unwrap();
        db.set_state("last_sync_at", "b").unwrap();
        assert_eq!(db.get_state("last_sync_at").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_audit_log() {
        let store = setup_store();
        let db = store.database();
        db.insert_audit_entry(&AuditEntry::success("sync_full", "1 imported users"))
            .unwrap();
        db.insert_audit_entry(&AuditEntry::failure("sync_full", "fetch failed"))
            .unwrap();
        let entries = db.list_audit_entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].success);
        assert_eq!(entries[1].details, "1 imported users");
    }
}
