//! One-way REST directory -> local identity store synchronization engine.
//!
//! The [`SyncEngine`] drives each sync run:
//!
//! 1. Evaluate the by-pass switch; a by-passed run touches nothing.
//! 2. Fetch every page of the remote collection (full or updated-since).
//! 3. Drop null and colliding records.
//! 4. Apply each remaining record, in username order, inside its own unit of
//!    work: create, update, evict or reject.
//! 5. Compensate failed creations, fire post-creation actions, record the run.
//!
//! A lock mechanism prevents concurrent sync runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::dedup::Deduplicator;
use crate::errors::{RecordError, StoreError, SyncError};
use crate::models::{AuditEntry, LocalIdentity, RemoteRecord, SyncMode, SyncResult};
use crate::notify::{ProvisionNotifier, ResetAction};
use crate::projector::IdentityProjector;
use crate::remote::{DirectoryPort, PageFetcher};
use crate::store::{Database, IdentityStore, StoreSession};

/// kv_state key holding the start time of the last completed run.
pub const LAST_SYNC_KEY: &str = "last_sync_at";

/// What a committed unit of work did with its record.
enum RecordOutcome {
    Created(LocalIdentity),
    Updated,
    /// Present only behind the store's cache; evicted, not recreated.
    Evicted,
    /// Exists locally but belongs to another source.
    NotLinked,
    Skipped,
}

/// The federation sync engine.
pub struct SyncEngine {
    config: AppConfig,
    fetcher: PageFetcher,
    store: Arc<dyn IdentityStore>,
    db: Arc<Database>,
    projector: IdentityProjector,
    notifier: Option<Arc<dyn ProvisionNotifier>>,
    reset_actions: Vec<ResetAction>,
    /// Atomic flag preventing concurrent sync runs.
    running: Arc<AtomicBool>,
    run_started_at: Mutex<Option<DateTime<Utc>>>,
}

impl SyncEngine {
    /// Create an engine over a directory port, an identity store and the
    /// bookkeeping database.
    pub fn new(
        config: AppConfig,
        directory: Arc<dyn DirectoryPort>,
        store: Arc<dyn IdentityStore>,
        db: Arc<Database>,
    ) -> Self {
        info!(source = %config.remote.source_name, "initializing sync engine");
        let projector = IdentityProjector::new(&config);
        let reset_actions = config.provisioning.reset_actions();
        Self {
            config,
            fetcher: PageFetcher::new(directory),
            store,
            db,
            projector,
            notifier: None,
            reset_actions,
            running: Arc::new(AtomicBool::new(false)),
            run_started_at: Mutex::new(None),
        }
    }

    /// Attach the notifier used for post-creation actions.
    pub fn with_notifier(mut self, notifier: Arc<dyn ProvisionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Check if a sync run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start time of the last recorded run.
    pub fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        let value = self.db.get_state(LAST_SYNC_KEY)?;
        Ok(value.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| warn!(value = %s, error = %e, "ignoring unparsable last sync time"))
                .ok()
        }))
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Reconcile the whole remote collection.
    pub async fn sync_full(&self) -> Result<SyncResult, SyncError> {
        self.run(SyncMode::Full).await
    }

    /// Reconcile the records changed since `since`.
    pub async fn sync_since(&self, since: DateTime<Utc>) -> Result<SyncResult, SyncError> {
        self.run(SyncMode::UpdatedSince(since)).await
    }

    /// Reconcile the records changed since the last run, or everything when no
    /// run was recorded yet.
    pub async fn sync_changed(&self) -> Result<SyncResult, SyncError> {
        match self.last_sync_at()? {
            Some(since) => self.sync_since(since).await,
            None => {
                info!("no previous sync recorded, running a full sync");
                self.sync_full().await
            }
        }
    }

    /// Execute one sync run.
    ///
    /// The sync lock is released via a drop guard so it is freed even if the
    /// run panics.
    async fn run(&self, mode: SyncMode) -> Result<SyncResult, SyncError> {
        if self.config.by_pass_active() {
            warn!(source = %self.config.remote.source_name, "by-pass federation");
            return Ok(SyncResult::empty());
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .lock_run_start()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            return Err(SyncError::AlreadyRunning { started_at });
        }
        let _guard = SyncLockGuard(self.running.clone());

        let started = Utc::now();
        *self
            .run_started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(started);

        info!(%mode, source = %self.config.remote.source_name, "sync run starting");
        let records = self.fetcher.fetch_all(&mode).await;
        if records.is_empty() {
            warn!(%mode, "no users received from the remote directory, nothing to apply");
        }
        let result = self.apply(records).await;
        info!(%mode, %result, "sync run finished");

        self.db.set_state(LAST_SYNC_KEY, &started.to_rfc3339())?;

        let action = match mode {
            SyncMode::Full => "sync_full",
            SyncMode::UpdatedSince(_) => "sync_changed",
        };
        let audit = if result.failed == 0 {
            AuditEntry::success(action, &result.to_string())
        } else {
            AuditEntry::failure(action, &result.to_string())
        };
        if let Err(e) = self.db.insert_audit_entry(&audit) {
            warn!(error = %e, "failed to write audit entry");
        }

        Ok(result)
    }

    fn lock_run_start(&self) -> Option<DateTime<Utc>> {
        *self
            .run_started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Record processing
    // -----------------------------------------------------------------------

    /// Apply a fetched record set to the local store.
    pub async fn apply(&self, records: Vec<Option<RemoteRecord>>) -> SyncResult {
        let mut result = SyncResult::default();
        let received = records.len();
        let clean = Deduplicator::clean(records, &mut result);
        info!(
            source = %self.config.remote.source_name,
            received,
            kept = clean.len(),
            "federation starting"
        );

        for remote in &clean {
            self.apply_record(remote, &mut result).await;
        }
        result
    }

    async fn apply_record(&self, remote: &RemoteRecord, result: &mut SyncResult) {
        let username = match remote.username() {
            Some(username) if remote.is_eligible() => username,
            _ => {
                warn!(
                    username = remote.user_name.as_deref().unwrap_or(""),
                    email = remote.email.as_deref().unwrap_or(""),
                    "missing attributes (username, email)"
                );
                result.increase_failed();
                return;
            }
        };

        let mut created_id = None;
        let mut outcome = RecordOutcome::Skipped;
        let attempt = self.store.unit_of_work(&mut |session| {
            created_id = None;
            outcome = self.process(session, remote, username, &mut created_id)?;
            Ok(())
        });

        match attempt {
            Ok(()) => match outcome {
                RecordOutcome::Created(identity) => {
                    result.increase_added();
                    self.notify_created(&identity).await;
                }
                RecordOutcome::Updated => {
                    debug!(username, "updated user from remote directory");
                    result.increase_updated();
                }
                RecordOutcome::NotLinked => {
                    warn!(
                        username,
                        source = %self.config.remote.source_name,
                        "user is not updated as it already exists locally but is not linked to this source"
                    );
                    result.increase_failed();
                }
                RecordOutcome::Evicted | RecordOutcome::Skipped => {}
            },
            Err(e @ RecordError::Store(_)) => {
                warn!(username, error = %e, "failed during import user from remote directory");
                result.increase_failed();
                if let Some(id) = created_id {
                    self.compensate(username, &id);
                }
            }
            Err(e) => {
                error!(username, error = %e, "failed during import user from remote directory");
                result.increase_failed();
            }
        }
    }

    /// Decide and perform the write for one record inside a unit of work.
    fn process(
        &self,
        session: &mut dyn StoreSession,
        remote: &RemoteRecord,
        username: &str,
        created_id: &mut Option<String>,
    ) -> Result<RecordOutcome, RecordError> {
        let allow_override = self.config.provisioning.uncheck_federation;

        match session.find_by_username(username)? {
            None if self.config.provisioning.not_create_users => {
                debug!(username, "not_create_users mode, skipping user");
                Ok(RecordOutcome::Skipped)
            }
            None => {
                if let Some(stored) = session.find_through_storage(username)? {
                    session.evict_from_cache(&stored.id);
                    debug!(username, "user exists in storage, evicted from cache");
                    return Ok(RecordOutcome::Evicted);
                }

                let mut identity = session.create_identity(username)?;
                *created_id = Some(identity.id.clone());
                debug!(username, "imported new user from remote directory");
                self.projector
                    .project(session, &mut identity, remote, true, allow_override)?;
                session.save_identity(&identity)?;
                Ok(RecordOutcome::Created(identity))
            }
            Some(mut identity) => {
                let owned = identity.is_linked_to(&self.config.remote.source_id) || allow_override;
                if !owned || identity.username != username.to_lowercase() {
                    return Ok(RecordOutcome::NotLinked);
                }
                self.projector
                    .project(session, &mut identity, remote, false, allow_override)?;
                session.save_identity(&identity)?;
                session.evict_from_cache(&identity.id);
                Ok(RecordOutcome::Updated)
            }
        }
    }

    /// Remove the identity a failed creation may have left behind.
    ///
    /// Targets the id created by the failed unit of work, never whatever
    /// currently holds `username`.
    fn compensate(&self, username: &str, id: &str) {
        let cleanup = self.store.unit_of_work(&mut |session| {
            session.evict_from_cache(id);
            match session.remove_identity(id) {
                Ok(()) => info!(username, id, "removed partially created user"),
                Err(StoreError::NotFound { .. }) => {
                    debug!(username, id, "failed creation left nothing behind")
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        });
        if let Err(e) = cleanup {
            error!(username, id, error = %e, "compensating removal failed");
        }
    }

    async fn notify_created(&self, identity: &LocalIdentity) {
        if self.reset_actions.is_empty() {
            return;
        }
        let Some(ref notifier) = self.notifier else {
            warn!(username = %identity.username, "reset actions configured but no notifier available");
            return;
        };
        if let Err(e) = notifier.notify(identity, &self.reset_actions).await {
            warn!(username = %identity.username, error = %e, "failed to send actions email");
        }
    }
}

/// Drop guard that resets the `running` flag to `false`.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FetchError;
    use crate::remote::PageEnvelope;
    use crate::store::SqliteIdentityStore;
    use async_trait::async_trait;
    use chrono::TimeZone;

    /// Serves a single page and records the requested modes.
    #[derive(Default)]
    struct RecordingDirectory {
        body: String,
        modes: Mutex<Vec<SyncMode>>,
    }

    #[async_trait]
    impl DirectoryPort for RecordingDirectory {
        async fn fetch_page(
            &self,
            mode: &SyncMode,
            _page: u32,
            _per_page: u32,
        ) -> Result<PageEnvelope, FetchError> {
            self.modes.lock().unwrap().push(*mode);
            Ok(PageEnvelope {
                body: self.body.clone(),
                ..Default::default()
            })
        }
    }

    fn engine(body: &str, extra: &str) -> (SyncEngine, Arc<RecordingDirectory>) {
        let toml = format!(
            "[remote]\nurl = \"https://directory.example.com\"\n[mapping]\nprefix = \"ext\"\n{extra}"
        );
        let config: AppConfig = toml::from_str(&toml).unwrap();
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let store = Arc::new(SqliteIdentityStore::new(db.clone()));
        let directory = Arc::new(RecordingDirectory {
            body: body.into(),
            ..Default::default()
        });
        (
            SyncEngine::new(config, directory.clone(), store, db),
            directory,
        )
    }

    #[tokio::test]
    async fn test_by_pass_skips_everything() {
        let (engine, directory) = engine("[]", "[provisioning]\nby_pass = \"true\"");
        let result = engine.sync_full().await.unwrap();
        assert!(result.ignored);
        assert!(directory.modes.lock().unwrap().is_empty());
        assert!(engine.last_sync_at().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unresolvable_by_pass_runs_normally() {
        let (engine, directory) = engine(
            "[]",
            "[provisioning]\nby_pass = \"${RESTFED_TEST_ENGINE_UNSET_BYPASS}\"",
        );
        let result = engine.sync_full().await.unwrap();
        assert!(!result.ignored);
        assert_eq!(directory.modes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_rejected() {
        let (engine, _) = engine("[]", "");
        engine.running.store(true, Ordering::SeqCst);
        assert!(matches!(
            engine.sync_full().await,
            Err(SyncError::AlreadyRunning { .. })
        ));
        engine.running.store(false, Ordering::SeqCst);
        engine.sync_full().await.unwrap();
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_sync_changed_uses_last_run_time() {
        let (engine, directory) = engine("[]", "");
        engine.sync_changed().await.unwrap();
        let first_run = engine.last_sync_at().unwrap().unwrap();

        engine.sync_changed().await.unwrap();
        let modes = directory.modes.lock().unwrap().clone();
        assert_eq!(modes[0], SyncMode::Full);
        assert_eq!(modes[1], SyncMode::UpdatedSince(first_run));
    }

    #[tokio::test]
    async fn test_sync_since_requests_updated_collection() {
        let (engine, directory) = engine("[]", "");
        let since = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap();
        engine.sync_since(since).await.unwrap();
        assert_eq!(
            directory.modes.lock().unwrap()[0],
            SyncMode::UpdatedSince(since)
        );
    }

    #[tokio::test]
    async fn test_missing_fields_count_as_failed() {
        let (engine, _) = engine(
            r#"[{"userName":"nomail","enabled":true},{"email":"noname@x.com","enabled":true}]"#,
            "",
        );
        let result = engine.sync_full().await.unwrap();
        assert_eq!(result.failed, 2);
        assert_eq!(result.added, 0);
    }

    #[tokio::test]
    async fn test_run_is_audited() {
        let (engine, _) = engine(r#"[{"userName":"alice","email":"a@x.com","enabled":true}]"#, "");
        engine.sync_full().await.unwrap();
        let entries = engine.db().list_audit_entries(5).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "sync_full");
        assert!(entries[0].details.starts_with("1 imported users"));
    }
}
