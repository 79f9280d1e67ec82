//! Shared helpers for restfed integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use restfed_core::errors::{NotificationError, RecordError, StoreError};
use restfed_core::models::{LocalIdentity, RoleScope};
use restfed_core::notify::{ProvisionNotifier, ResetAction};
use restfed_core::store::{Database, IdentityStore, SqliteIdentityStore, StoreSession};
use restfed_core::{AppConfig, RestDirectoryClient, SyncEngine};

pub const DIRECTORY_PATH: &str = "/api/users";

// ===========================================================================
// Configuration
// ===========================================================================

/// Parse a config pointing at `server`, with prefix `ext` and `extra` TOML
/// appended.
pub fn config_for(server: &MockServer, extra: &str) -> AppConfig {
    let toml_str = format!(
        r#"
[remote]
url = "{}{}"
timeout_secs = 5

[mapping]
prefix = "ext"
uppercase = true

{}
"#,
        server.uri(),
        DIRECTORY_PATH,
        extra
    );
    toml::from_str(&toml_str).expect("test config is valid TOML")
}

// ===========================================================================
// Remote directory
// ===========================================================================

pub fn user(username: &str, email: &str, roles: &[&str]) -> Value {
    serde_json::json!({
        "firstName": username,
        "lastName": "Test",
        "userName": username,
        "email": email,
        "enabled": true,
        "roles": roles,
    })
}

/// Serve `users` as a single page of the full collection.
pub async fn serve_full(server: &MockServer, users: Vec<Value>) {
    serve_page(server, "full", 1, 1, users).await;
}

/// Serve one page of `{DIRECTORY_PATH}/{endpoint}`.
pub async fn serve_page(
    server: &MockServer,
    endpoint: &str,
    page: u32,
    total_pages: u32,
    users: Vec<Value>,
) {
    Mock::given(method("GET"))
        .and(path(format!("{}/{}", DIRECTORY_PATH, endpoint)))
        .and(header("X-Page", page.to_string().as_str()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(Value::Array(users))
                .insert_header("X-Page", page.to_string().as_str())
                .insert_header("X-Per-Page", "400")
                .insert_header("X-Total-Pages", total_pages.to_string().as_str()),
        )
        .mount(server)
        .await;
}

// ===========================================================================
// Engine over SQLite
// ===========================================================================

pub struct Harness {
    pub engine: SyncEngine,
    pub store: Arc<SqliteIdentityStore>,
    pub db: Arc<Database>,
}

pub fn sqlite_store() -> (Arc<SqliteIdentityStore>, Arc<Database>) {
    let db = Arc::new(Database::in_memory().expect("in-memory db"));
    db.initialize().expect("schema");
    (Arc::new(SqliteIdentityStore::new(db.clone())), db)
}

pub fn harness(config: AppConfig) -> Harness {
    let (store, db) = sqlite_store();
    harness_with_store(config, store, db)
}

pub fn harness_with_store(
    config: AppConfig,
    store: Arc<SqliteIdentityStore>,
    db: Arc<Database>,
) -> Harness {
    let client = Arc::new(RestDirectoryClient::new(&config.remote).expect("client"));
    let engine = SyncEngine::new(config, client, store.clone(), db.clone());
    Harness { engine, store, db }
}

/// Insert an identity directly, bypassing the engine.
pub fn seed_identity(
    store: &SqliteIdentityStore,
    username: &str,
    email: &str,
    federation_link: Option<&str>,
    first_name: &str,
) {
    store
        .unit_of_work(&mut |session| {
            let mut identity = session.create_identity(username)?;
            identity.email = Some(email.to_string());
            identity.first_name = Some(first_name.to_string());
            identity.enabled = true;
            identity.federation_link = federation_link.map(str::to_string);
            session.save_identity(&identity)?;
            Ok(())
        })
        .expect("seed identity");
}

// ===========================================================================
// Notifier
// ===========================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    pub calls: Mutex<Vec<(String, Vec<ResetAction>)>>,
}

#[async_trait]
impl ProvisionNotifier for RecordingNotifier {
    async fn notify(
        &self,
        identity: &LocalIdentity,
        actions: &[ResetAction],
    ) -> Result<(), NotificationError> {
        self.calls
            .lock()
            .unwrap()
            .push((identity.username.clone(), actions.to_vec()));
        Ok(())
    }
}

// ===========================================================================
// Non-transactional store
// ===========================================================================

/// A store whose writes are applied immediately and never rolled back, with
/// saves failing for chosen usernames.
#[derive(Default)]
pub struct AutoCommitStore {
    state: Mutex<AutoCommitState>,
    fail_saves_for: HashSet<String>,
}

#[derive(Default)]
struct AutoCommitState {
    identities: HashMap<String, LocalIdentity>,
    roles: HashSet<(RoleScope, String)>,
}

impl AutoCommitStore {
    pub fn failing_saves_for(usernames: &[&str]) -> Self {
        Self {
            fail_saves_for: usernames.iter().map(|u| u.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn contains(&self, username: &str) -> bool {
        self.state.lock().unwrap().identities.contains_key(username)
    }

    /// Insert an identity directly, bypassing failing saves.
    pub fn seed(&self, identity: LocalIdentity) {
        self.state
            .lock()
            .unwrap()
            .identities
            .insert(identity.username.clone(), identity);
    }

    pub fn get(&self, username: &str) -> Option<LocalIdentity> {
        self.state.lock().unwrap().identities.get(username).cloned()
    }
}

impl IdentityStore for AutoCommitStore {
    fn unit_of_work(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreSession) -> Result<(), RecordError>,
    ) -> Result<(), RecordError> {
        let mut state = self.state.lock().unwrap();
        let mut session = AutoCommitSession {
            state: &mut state,
            fail_saves_for: &self.fail_saves_for,
        };
        work(&mut session)
    }
}

struct AutoCommitSession<'a> {
    state: &'a mut AutoCommitState,
    fail_saves_for: &'a HashSet<String>,
}

impl StoreSession for AutoCommitSession<'_> {
    fn find_by_username(&mut self, username: &str) -> Result<Option<LocalIdentity>, StoreError> {
        Ok(self.state.identities.get(&username.to_lowercase()).cloned())
    }

    fn create_identity(&mut self, username: &str) -> Result<LocalIdentity, StoreError> {
        let identity = LocalIdentity::new(username);
        self.state
            .identities
            .insert(identity.username.clone(), identity.clone());
        Ok(identity)
    }

    fn save_identity(&mut self, identity: &LocalIdentity) -> Result<(), StoreError> {
        if self.fail_saves_for.contains(&identity.username) {
            return Err(StoreError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        self.state
            .identities
            .insert(identity.username.clone(), identity.clone());
        Ok(())
    }

    fn remove_identity(&mut self, id: &str) -> Result<(), StoreError> {
        self.state.identities.retain(|_, identity| identity.id != id);
        Ok(())
    }

    fn evict_from_cache(&mut self, _id: &str) {}

    fn client_exists(&mut self, _client_id: &str) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn role_exists(&mut self, scope: &RoleScope, name: &str) -> Result<bool, StoreError> {
        Ok(self.state.roles.contains(&(scope.clone(), name.to_string())))
    }

    fn create_role(&mut self, scope: &RoleScope, name: &str) -> Result<(), StoreError> {
        self.state.roles.insert((scope.clone(), name.to_string()));
        Ok(())
    }
}

// ===========================================================================
// Interleaved writer
// ===========================================================================

/// SQLite store where another writer claims a username right after the first
/// unit of work that fails.
pub struct InterleavedWriterStore {
    pub inner: Arc<SqliteIdentityStore>,
    claim: Mutex<Option<(String, String)>>,
}

impl InterleavedWriterStore {
    /// After the first failed unit of work, `username` is created with `email`.
    pub fn new(inner: Arc<SqliteIdentityStore>, username: &str, email: &str) -> Self {
        Self {
            inner,
            claim: Mutex::new(Some((username.to_string(), email.to_string()))),
        }
    }
}

impl IdentityStore for InterleavedWriterStore {
    fn unit_of_work(
        &self,
        work: &mut dyn FnMut(&mut dyn StoreSession) -> Result<(), RecordError>,
    ) -> Result<(), RecordError> {
        let outcome = self.inner.unit_of_work(work);
        if outcome.is_err() {
            if let Some((username, email)) = self.claim.lock().unwrap().take() {
                seed_identity(&self.inner, &username, &email, None, "Concurrent");
            }
        }
        outcome
    }
}
