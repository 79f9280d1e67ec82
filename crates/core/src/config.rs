//! TOML-based configuration system for restfed.
//!
//! Plain values may carry `${KEY}` placeholders, resolved from the environment
//! by [`AppConfig::resolve_placeholders`]. Secrets (SMTP password, action token
//! key) are stored as `_env` fields naming an environment variable and resolved
//! by [`AppConfig::resolve_env_vars`]. The by-pass expression is kept raw and
//! resolved at the start of every sync run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::env_subst;
use crate::errors::ConfigError;
use crate::notify::actions::ResetAction;

/// Minimum length of the remote and public URLs.
pub const URL_MIN_LENGTH: usize = 10;
/// Minimum length of the role/attribute prefix.
pub const PREFIX_MIN_LENGTH: usize = 2;
/// Password hash algorithms accepted for synchronized credentials.
pub const SUPPORTED_HASH_ALGORITHMS: &[&str] = &["SHA256", "PBKDF2-SHA256"];

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / scheduling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Remote user directory settings.
    pub remote: RemoteConfig,

    /// Role and attribute name normalization.
    #[serde(default)]
    pub mapping: MappingConfig,

    /// Role synchronization.
    #[serde(default)]
    pub roles: RoleSyncConfig,

    /// Attribute synchronization.
    #[serde(default)]
    pub attributes: AttributeSyncConfig,

    /// Password credential synchronization.
    #[serde(default)]
    pub password: PasswordSyncConfig,

    /// Creation / ownership policy and post-creation actions.
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// SMTP settings for post-creation action emails.
    #[serde(default)]
    pub notifications: NotificationConfig,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between full syncs (0 disables the periodic full sync).
    #[serde(default = "default_full_sync_period")]
    pub full_sync_period_secs: u64,

    /// Seconds between changed-since syncs (0 disables them).
    #[serde(default)]
    pub changed_sync_period_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (the identity database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_full_sync_period() -> u64 {
    86_400
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/restfed")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            full_sync_period_secs: default_full_sync_period(),
            changed_sync_period_secs: 0,
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote directory
// ---------------------------------------------------------------------------

/// Remote user directory connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL; `/full` and `/updated/{from}` are appended.
    pub url: String,

    /// Identifier written into the federation link of imported identities.
    #[serde(default = "default_source_id")]
    pub source_id: String,

    /// Display name used in log lines.
    #[serde(default = "default_source_name")]
    pub source_name: String,

    /// Route requests through an HTTP(S) proxy.
    #[serde(default)]
    pub proxy_enabled: bool,

    /// Proxy URL. Falls back to `HTTPS_PROXY` / `HTTP_PROXY` when unset.
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_source_id() -> String {
    "rest-federation".into()
}
fn default_source_name() -> String {
    "Rest User Federation".into()
}
fn default_timeout() -> u64 {
    30
}

impl RemoteConfig {
    /// The proxy to use when `proxy_enabled` is set.
    pub fn effective_proxy(&self) -> Option<String> {
        self.proxy_url
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var("HTTPS_PROXY").ok().filter(|p| !p.is_empty()))
            .or_else(|| std::env::var("HTTP_PROXY").ok().filter(|p| !p.is_empty()))
    }
}

// ---------------------------------------------------------------------------
// Mapping, roles, attributes, password
// ---------------------------------------------------------------------------

/// Name normalization applied to synchronized role and attribute names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    /// Prefix owned by this source (joined with `_`).
    #[serde(default)]
    pub prefix: String,

    /// Upper-case normalized names.
    #[serde(default = "default_true")]
    pub uppercase: bool,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            uppercase: true,
        }
    }
}

/// Role synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Client whose scope receives the roles; realm scope when empty.
    #[serde(default)]
    pub client: Option<String>,
}

impl Default for RoleSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client: None,
        }
    }
}

/// Attribute synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSyncConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for AttributeSyncConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Password credential synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordSyncConfig {
    #[serde(default)]
    pub enabled: bool,

    /// One of [`SUPPORTED_HASH_ALGORITHMS`] (case-insensitive).
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,

    /// Hash iteration count recorded on the credential.
    #[serde(default = "default_hash_iterations")]
    pub hash_iterations: u32,
}

fn default_hash_algorithm() -> String {
    "SHA256".into()
}
fn default_hash_iterations() -> u32 {
    500_000
}

impl Default for PasswordSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hash_algorithm: default_hash_algorithm(),
            hash_iterations: default_hash_iterations(),
        }
    }
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// Ownership policy, creation policy and post-creation actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    /// Update identities even when they are not linked to this source.
    #[serde(default)]
    pub uncheck_federation: bool,

    /// Only update identities that already exist locally.
    #[serde(default)]
    pub not_create_users: bool,

    /// Comma separated actions, e.g. `VERIFY_EMAIL,welcome.ftl(UPDATE_PASSWORD)`.
    #[serde(default)]
    pub reset_actions: String,

    /// By-pass expression, e.g. `${DISABLE_FEDERATION}` or `true`.
    #[serde(default)]
    pub by_pass: Option<String>,

    /// Public base URL used to build action links.
    #[serde(default)]
    pub public_url: Option<String>,

    /// Validity of action links in seconds.
    #[serde(default = "default_token_lifespan")]
    pub action_token_lifespan_secs: u64,

    /// Environment variable holding the action token signing key.
    #[serde(default)]
    pub action_token_secret_env: Option<String>,

    /// Directory holding custom `.ftl` action templates.
    #[serde(default)]
    pub templates_dir: Option<PathBuf>,

    /// Resolved signing key.
    #[serde(skip)]
    pub action_token_secret: Option<String>,
}

fn default_token_lifespan() -> u64 {
    43_200
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            uncheck_federation: false,
            not_create_users: false,
            reset_actions: String::new(),
            by_pass: None,
            public_url: None,
            action_token_lifespan_secs: default_token_lifespan(),
            action_token_secret_env: None,
            templates_dir: None,
            action_token_secret: None,
        }
    }
}

impl ProvisioningConfig {
    /// Split the configured action list into trimmed, non-empty entries.
    pub fn reset_action_names(&self) -> Vec<String> {
        self.reset_actions
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Parsed post-creation actions; invalid entries are logged and dropped.
    pub fn reset_actions(&self) -> Vec<ResetAction> {
        self.reset_action_names()
            .iter()
            .filter_map(|name| match ResetAction::parse(name) {
                Some(action) => Some(action),
                None => {
                    warn!(action = %name, "ignoring unknown post-creation action");
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

/// SMTP configuration for action emails.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationConfig {
    /// SMTP server address (e.g. `smtp.example.com:587`).
    #[serde(default)]
    pub email_smtp: Option<String>,

    /// Sender email address.
    #[serde(default)]
    pub email_from: Option<String>,

    /// SMTP username.
    #[serde(default)]
    pub smtp_username: Option<String>,

    /// Environment variable holding the SMTP password.
    #[serde(default)]
    pub smtp_password_env: Option<String>,

    /// Resolved SMTP password.
    #[serde(skip)]
    pub smtp_password: Option<String>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve placeholders or environment variables.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Substitute `${KEY}` placeholders in plain string settings.
    pub fn resolve_placeholders(&mut self) -> Result<(), ConfigError> {
        self.remote.url = env_subst::resolve(&self.remote.url)?;
        if let Some(ref proxy) = self.remote.proxy_url {
            self.remote.proxy_url = Some(env_subst::resolve(proxy)?);
        }
        self.mapping.prefix = env_subst::resolve(&self.mapping.prefix)?;
        if let Some(ref client) = self.roles.client {
            self.roles.client = Some(env_subst::resolve(client)?);
        }
        self.password.hash_algorithm = env_subst::resolve(&self.password.hash_algorithm)?;
        if let Some(ref url) = self.provisioning.public_url {
            self.provisioning.public_url = Some(env_subst::resolve(url)?);
        }
        Ok(())
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// Missing variables log a warning but do not fail; callers decide what is
    /// required for their mode.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.notifications.smtp_password_env {
            self.notifications.smtp_password =
                resolve_optional_env(env_name, "notifications.smtp_password_env");
        }

        if let Some(ref env_name) = self.provisioning.action_token_secret_env {
            self.provisioning.action_token_secret =
                resolve_optional_env(env_name, "provisioning.action_token_secret_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate the settings the way the federation component expects them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref expr) = self.provisioning.by_pass {
            env_subst::resolve(expr).map_err(|_| ConfigError::InvalidValue {
                field: "provisioning.by_pass".into(),
                detail: format!("by pass parameter '{}' not exists", env_subst::bare_key(expr)),
            })?;
        }

        let unknown: Vec<String> = self
            .provisioning
            .reset_action_names()
            .into_iter()
            .filter(|a| ResetAction::parse(a).is_none())
            .collect();
        if !unknown.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "provisioning.reset_actions".into(),
                detail: format!("please check actions: {}", unknown.join(",")),
            });
        }

        if self.remote.url.len() < URL_MIN_LENGTH {
            return Err(ConfigError::InvalidValue {
                field: "remote.url".into(),
                detail: "please check the url".into(),
            });
        }

        if let Some(ref public_url) = self.provisioning.public_url {
            if public_url.len() < URL_MIN_LENGTH {
                return Err(ConfigError::InvalidValue {
                    field: "provisioning.public_url".into(),
                    detail: "please check the public url, ex: https://idm.example.com/auth".into(),
                });
            }
        }

        if self.roles.enabled || self.attributes.enabled {
            if self.mapping.prefix.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "mapping.prefix".into(),
                    detail: "please define prefix".into(),
                });
            }
            if self.mapping.prefix.len() < PREFIX_MIN_LENGTH {
                return Err(ConfigError::InvalidValue {
                    field: "mapping.prefix".into(),
                    detail: "please check prefix size".into(),
                });
            }
        }

        if self.remote.proxy_enabled && self.remote.effective_proxy().is_none() {
            return Err(ConfigError::InvalidValue {
                field: "remote.proxy_url".into(),
                detail: "proxy enabled but neither proxy_url nor HTTP(S)_PROXY is set".into(),
            });
        }

        if self.password.enabled {
            let algorithm = self.password.hash_algorithm.to_uppercase();
            if !SUPPORTED_HASH_ALGORITHMS.contains(&algorithm.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "password.hash_algorithm".into(),
                    detail: format!(
                        "not supported algorithm ({}), expected one of {}",
                        self.password.hash_algorithm,
                        SUPPORTED_HASH_ALGORITHMS.join(",")
                    ),
                });
            }
        }

        if self.daemon.full_sync_period_secs == 0 && self.daemon.changed_sync_period_secs == 0 {
            debug!("no periodic sync configured; only one-shot runs are possible");
        }

        // An active by-pass is a valid configuration; runs report `ignored`.
        Ok(())
    }

    /// Evaluate the by-pass expression now.
    ///
    /// An expression that does not resolve is logged and treated as inactive.
    pub fn by_pass_active(&self) -> bool {
        let Some(ref expr) = self.provisioning.by_pass else {
            return false;
        };
        match env_subst::resolve(expr) {
            Ok(value) => value.trim().eq_ignore_ascii_case("true"),
            Err(_) => {
                warn!(
                    parameter = %env_subst::bare_key(expr),
                    "by pass parameter not exists"
                );
                false
            }
        }
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_placeholders()?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
