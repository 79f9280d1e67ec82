//! Projection of a remote record onto a local identity.
//!
//! The projector owns every field-level rule: core profile fields, prefixed
//! role and attribute ownership, password credential upkeep, and the origin
//! guard that stops a remote record from taking over an unrelated identity.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, PasswordSyncConfig};
use crate::errors::{RecordError, StoreError};
use crate::models::{
    Credential, LocalIdentity, RemoteRecord, RoleGrant, RoleScope, PASSWORD_CREDENTIAL,
};
use crate::store::StoreSession;

/// Standard OpenID Connect claim names. They are never prefixed or case-folded.
pub const RESERVED_CLAIMS: &[&str] = &[
    "nonce",
    "auth_time",
    "session_state",
    "at_hash",
    "c_hash",
    "s_hash",
    "sid",
    "acr",
    "name",
    "given_name",
    "family_name",
    "middle_name",
    "nickname",
    "preferred_username",
    "profile",
    "picture",
    "website",
    "email",
    "email_verified",
    "gender",
    "birthdate",
    "zoneinfo",
    "locale",
    "phone_number",
    "phone_number_verified",
    "address",
    "updated_at",
    "claims_locales",
];

/// A role client id must be longer than this to be considered.
pub const ROLE_CLIENT_MIN_LENGTH: usize = 3;

// ---------------------------------------------------------------------------
// Name normalization
// ---------------------------------------------------------------------------

/// Maps remote role and attribute names into this source's namespace.
#[derive(Debug, Clone)]
pub struct NameNormalizer {
    prefix: String,
    uppercase: bool,
}

impl NameNormalizer {
    pub fn new(prefix: impl Into<String>, uppercase: bool) -> Self {
        Self {
            prefix: prefix.into(),
            uppercase,
        }
    }

    /// `prefix_name`, optionally upper-cased. Applying it twice is a no-op.
    pub fn normalize(&self, name: &str) -> String {
        if RESERVED_CLAIMS.contains(&name) {
            return name.to_string();
        }
        let joined = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.prefix, self.strip_marker(name))
        };
        if self.uppercase {
            joined.to_uppercase()
        } else {
            joined
        }
    }

    /// Whether a local name belongs to this source's namespace.
    ///
    /// With no prefix configured every name is owned.
    pub fn is_owned(&self, name: &str) -> bool {
        self.prefix.is_empty() || self.strip_marker(name).len() != name.len()
    }

    fn strip_marker<'a>(&self, name: &'a str) -> &'a str {
        let marker = format!("{}_", self.prefix);
        if !self.uppercase {
            return name.strip_prefix(marker.as_str()).unwrap_or(name);
        }
        // Upper-casing may change byte lengths, so match char by char.
        let wanted = marker.to_uppercase();
        let mut head = String::with_capacity(wanted.len());
        for (at, c) in name.char_indices() {
            if head == wanted {
                return &name[at..];
            }
            head.extend(c.to_uppercase());
            if !wanted.starts_with(head.as_str()) {
                return name;
            }
        }
        if head == wanted {
            &name[name.len()..]
        } else {
            name
        }
    }
}

// ---------------------------------------------------------------------------
// Projector
// ---------------------------------------------------------------------------

/// Writes remote fields onto a local identity inside a unit of work.
#[derive(Debug, Clone)]
pub struct IdentityProjector {
    source_id: String,
    normalizer: NameNormalizer,
    role_sync: bool,
    role_client: Option<String>,
    attribute_sync: bool,
    password: PasswordSyncConfig,
}

impl IdentityProjector {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            source_id: config.remote.source_id.clone(),
            normalizer: NameNormalizer::new(&config.mapping.prefix, config.mapping.uppercase),
            role_sync: config.roles.enabled,
            role_client: config.roles.client.clone(),
            attribute_sync: config.attributes.enabled,
            password: config.password.clone(),
        }
    }

    /// Merge `remote` into `local`.
    ///
    /// Outside of creation, and unless `allow_override` is set, the remote and
    /// local emails must match (case-insensitive); `local` is left untouched
    /// when they do not. The caller persists `local` afterwards.
    pub fn project(
        &self,
        session: &mut dyn StoreSession,
        local: &mut LocalIdentity,
        remote: &RemoteRecord,
        is_creation: bool,
        allow_override: bool,
    ) -> Result<(), RecordError> {
        let username = remote
            .username()
            .ok_or(RecordError::MissingRequiredField("username"))?;
        let email = remote
            .email()
            .ok_or(RecordError::MissingRequiredField("email"))?;

        let same_email = local
            .email
            .as_deref()
            .is_some_and(|local_email| local_email.to_lowercase() == email.to_lowercase());
        if !is_creation && !allow_override && !same_email {
            return Err(RecordError::OriginMismatch {
                remote: email.to_string(),
                local: local.email.clone().unwrap_or_default(),
            });
        }

        if is_creation {
            local.federation_link = Some(self.source_id.clone());
        }

        local.first_name = remote.first_name.clone();
        local.last_name = remote.last_name.clone();
        local.username = username.to_lowercase();
        local.email = Some(email.to_lowercase());
        local.enabled = remote.enabled;
        local.email_verified = remote.enabled;

        if self.role_sync {
            self.sync_roles(session, local, remote)?;
        }
        if self.attribute_sync {
            self.sync_attributes(local, remote);
        }
        if self.password.enabled {
            self.sync_password(local, remote);
        }
        Ok(())
    }

    /// Client scope when a usable client is configured and exists.
    fn role_scope(&self, session: &mut dyn StoreSession) -> Result<RoleScope, StoreError> {
        match self.role_client.as_deref() {
            Some(client) if client.len() > ROLE_CLIENT_MIN_LENGTH => {
                if session.client_exists(client)? {
                    Ok(RoleScope::Client(client.to_string()))
                } else {
                    warn!(client, "client doesn't exist, roles will be created as realm roles");
                    Ok(RoleScope::Realm)
                }
            }
            _ => Ok(RoleScope::Realm),
        }
    }

    fn sync_roles(
        &self,
        session: &mut dyn StoreSession,
        local: &mut LocalIdentity,
        remote: &RemoteRecord,
    ) -> Result<(), RecordError> {
        let Some(ref roles) = remote.roles else {
            return Ok(());
        };
        let scope = self.role_scope(session)?;

        local
            .roles
            .retain(|grant| grant.scope != scope || !self.normalizer.is_owned(&grant.name));

        for role in roles {
            let name = self.normalizer.normalize(role);
            if !session.role_exists(&scope, &name)? {
                session.create_role(&scope, &name)?;
                info!(role = %role, normalized = %name, %scope, "remote role created");
            }
            debug!(role = %name, username = %local.username, "remote role granted");
            local.roles.insert(RoleGrant::new(scope.clone(), name));
        }
        Ok(())
    }

    fn sync_attributes(&self, local: &mut LocalIdentity, remote: &RemoteRecord) {
        let Some(ref attributes) = remote.attributes else {
            return;
        };
        local
            .attributes
            .retain(|name, _| !self.normalizer.is_owned(name));

        for (name, values) in attributes {
            let normalized = self.normalizer.normalize(name);
            debug!(attribute = %name, normalized = %normalized, username = %local.username, "remote attribute applied");
            local.attributes.insert(normalized, values.clone());
        }
    }

    fn sync_password(&self, local: &mut LocalIdentity, remote: &RemoteRecord) {
        let Some(ref password) = remote.password else {
            warn!(username = %local.username, "missing password");
            return;
        };
        let algorithm = self.password.hash_algorithm.to_lowercase();
        let created_date = Utc::now().timestamp_millis();

        match local
            .credentials
            .iter_mut()
            .find(|c| c.credential_type == PASSWORD_CREDENTIAL)
        {
            Some(existing) => {
                existing.value = password.clone();
                existing.algorithm = algorithm;
                existing.hash_iterations = self.password.hash_iterations;
                existing.created_date = created_date;
            }
            None => local.credentials.push(Credential {
                id: uuid::Uuid::new_v4().to_string(),
                credential_type: PASSWORD_CREDENTIAL.to_string(),
                value: password.clone(),
                algorithm,
                hash_iterations: self.password.hash_iterations,
                created_date,
            }),
        }
    }
}
