//! Action emails sent via SMTP.
//!
//! Uses the `lettre` crate. Known actions get a built-in message; custom
//! templates are read from the configured templates directory.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, info, warn};

use super::actions::ResetAction;
use super::token::{action_link, ActionToken};
use super::ProvisionNotifier;
use crate::config::{NotificationConfig, ProvisioningConfig};
use crate::errors::NotificationError;
use crate::models::LocalIdentity;

const DEFAULT_SMTP_PORT: u16 = 587;
const KNOWN_ACTION_SUBJECT: &str = "Update Your Account";
const TEMPLATE_SUBJECT: &str = "Account notification";

/// Subject and body of one action email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub body: String,
}

/// Sends one email per configured post-creation action.
pub struct EmailActionNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    public_url: String,
    secret: Vec<u8>,
    lifespan_secs: u64,
    templates_dir: Option<PathBuf>,
}

impl EmailActionNotifier {
    /// Build a notifier; SMTP server, sender, public URL and signing key are
    /// required.
    pub fn new(
        notifications: &NotificationConfig,
        provisioning: &ProvisioningConfig,
    ) -> Result<Self, NotificationError> {
        let smtp_addr = notifications
            .email_smtp
            .as_deref()
            .ok_or_else(|| NotificationError::EmailError("notifications.email_smtp is not set".into()))?;
        let from: Mailbox = notifications
            .email_from
            .as_deref()
            .ok_or_else(|| NotificationError::EmailError("notifications.email_from is not set".into()))?
            .parse()
            .map_err(|e| NotificationError::EmailError(format!("invalid from address: {}", e)))?;
        let public_url = provisioning.public_url.clone().ok_or_else(|| {
            NotificationError::TokenError("provisioning.public_url is not set".into())
        })?;
        let secret = provisioning
            .action_token_secret
            .clone()
            .ok_or_else(|| NotificationError::TokenError("action token signing key is not set".into()))?;

        let credentials = match (
            notifications.smtp_username.as_deref(),
            notifications.smtp_password.as_deref(),
        ) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };
        let transport = build_transport(smtp_addr, credentials)?;

        info!(smtp = %smtp_addr, from = %from, "initializing action email notifier");
        Ok(Self {
            transport,
            from,
            public_url,
            secret: secret.into_bytes(),
            lifespan_secs: provisioning.action_token_lifespan_secs,
            templates_dir: provisioning.templates_dir.clone(),
        })
    }

    /// Render the email for one action, signing a fresh token.
    pub fn render(
        &self,
        identity: &LocalIdentity,
        action: &ResetAction,
        now: DateTime<Utc>,
    ) -> Result<RenderedEmail, NotificationError> {
        let required: Vec<String> = action
            .required_actions()
            .iter()
            .map(|a| a.as_str().to_string())
            .collect();
        let token = ActionToken::new(&identity.id, required.clone(), now, self.lifespan_secs);
        let link = action_link(&self.public_url, &token.serialize(&self.secret)?);
        let minutes = self.lifespan_secs / 60;

        match action {
            ResetAction::Known(_) => Ok(RenderedEmail {
                subject: KNOWN_ACTION_SUBJECT.to_string(),
                body: format!(
                    "Your administrator has just requested that you update your account by \
                     performing the following action(s): {}.\n\n\
                     Click on the link below to start this process.\n\n{}\n\n\
                     This link will expire within {} minutes.\n",
                    required.join(", "),
                    link,
                    minutes
                ),
            }),
            ResetAction::Template { template, .. } => {
                let raw = self.load_template(template)?;
                let filled = raw
                    .replace("${link}", &link)
                    .replace("${linkExpiration}", &minutes.to_string())
                    .replace("${username}", &identity.username);
                Ok(split_subject(&filled))
            }
        }
    }

    fn load_template(&self, template: &str) -> Result<String, NotificationError> {
        let dir = self
            .templates_dir
            .as_ref()
            .ok_or_else(|| NotificationError::TemplateError {
                template: template.to_string(),
                detail: "provisioning.templates_dir is not set".into(),
            })?;
        std::fs::read_to_string(dir.join(template)).map_err(|e| NotificationError::TemplateError {
            template: template.to_string(),
            detail: e.to_string(),
        })
    }

    async fn send(&self, to: Mailbox, email: RenderedEmail) -> Result<(), NotificationError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(email.body)
            .map_err(|e| NotificationError::EmailError(format!("failed to build email: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| NotificationError::EmailError(format!("SMTP send failed: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl ProvisionNotifier for EmailActionNotifier {
    async fn notify(
        &self,
        identity: &LocalIdentity,
        actions: &[ResetAction],
    ) -> Result<(), NotificationError> {
        let Some(ref email) = identity.email else {
            debug!(username = %identity.username, "identity has no email, skipping actions");
            return Ok(());
        };
        let to: Mailbox = email.parse().map_err(|e| {
            NotificationError::EmailError(format!("invalid recipient '{}': {}", email, e))
        })?;

        let mut errors = Vec::new();
        for action in actions {
            let sent = match self.render(identity, action, Utc::now()) {
                Ok(rendered) => self.send(to.clone(), rendered).await,
                Err(e) => Err(e),
            };
            match sent {
                Ok(()) => info!(to = %email, %action, "action email sent"),
                Err(e) => {
                    warn!(to = %email, %action, error = %e, "failed to send actions email");
                    errors.push(format!("{}: {}", action, e));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(NotificationError::EmailError(errors.join("; ")))
        }
    }
}

/// A first line of the form `Subject: ...` becomes the subject.
fn split_subject(text: &str) -> RenderedEmail {
    match text.split_once('\n') {
        Some((first, rest)) if first.starts_with("Subject:") => RenderedEmail {
            subject: first["Subject:".len()..].trim().to_string(),
            body: rest.trim_start_matches('\n').to_string(),
        },
        _ => RenderedEmail {
            subject: TEMPLATE_SUBJECT.to_string(),
            body: text.to_string(),
        },
    }
}

/// Build a STARTTLS transport for `host[:port]`.
fn build_transport(
    smtp_addr: &str,
    credentials: Option<(&str, &str)>,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotificationError> {
    let (host, port) = match smtp_addr.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().unwrap_or(DEFAULT_SMTP_PORT)),
        None => (smtp_addr, DEFAULT_SMTP_PORT),
    };

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
        .map_err(|e| NotificationError::EmailError(format!("SMTP connection error: {}", e)))?
        .port(port);
    if let Some((user, password)) = credentials {
        builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::actions::RequiredAction;

    fn notifier(templates_dir: Option<PathBuf>) -> EmailActionNotifier {
        let notifications = NotificationConfig {
            email_smtp: Some("smtp.example.com:2525".into()),
            email_from: Some("idm@example.com".into()),
            ..Default::default()
        };
        let provisioning = ProvisioningConfig {
            public_url: Some("https://idm.example.com/auth".into()),
            action_token_secret: Some("k3y".into()),
            action_token_lifespan_secs: 7200,
            templates_dir,
            ..Default::default()
        };
        EmailActionNotifier::new(&notifications, &provisioning).unwrap()
    }

    fn identity() -> LocalIdentity {
        let mut identity = LocalIdentity::new("alice");
        identity.email = Some("a@x.com".into());
        identity
    }

    #[tokio::test]
    async fn test_known_action_email_carries_signed_link() {
        let n = notifier(None);
        let now = Utc::now();
        let email = n
            .render(
                &identity(),
                &ResetAction::Known(RequiredAction::UpdatePassword),
                now,
            )
            .unwrap();
        assert_eq!(email.subject, KNOWN_ACTION_SUBJECT);
        assert!(email.body.contains("UPDATE_PASSWORD"));
        assert!(email.body.contains("within 120 minutes"));

        let key = email
            .body
            .split("action-token?key=")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .unwrap();
        let token = ActionToken::verify(key, b"k3y", now).unwrap();
        assert_eq!(token.required_actions, vec!["UPDATE_PASSWORD"]);
    }

    #[tokio::test]
    async fn test_custom_template_substitution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("welcome.ftl"),
            "Subject: Welcome ${username}\n\nSet your password: ${link} (valid ${linkExpiration} min)",
        )
        .unwrap();
        let n = notifier(Some(dir.path().to_path_buf()));
        let action = ResetAction::parse("welcome.ftl(UPDATE_PASSWORD)").unwrap();
        let email = n.render(&identity(), &action, Utc::now()).unwrap();
        assert_eq!(email.subject, "Welcome alice");
        assert!(email
            .body
            .starts_with("Set your password: https://idm.example.com/auth/login-actions/action-token?key="));
        assert!(email.body.ends_with("(valid 120 min)"));
    }

    #[tokio::test]
    async fn test_missing_template_is_an_error() {
        let n = notifier(None);
        let action = ResetAction::parse("welcome.ftl").unwrap();
        assert!(matches!(
            n.render(&identity(), &action, Utc::now()),
            Err(NotificationError::TemplateError { .. })
        ));
    }

    #[tokio::test]
    async fn test_identity_without_email_is_skipped() {
        let n = notifier(None);
        let identity = LocalIdentity::new("noemail");
        n.notify(&identity, &[ResetAction::Known(RequiredAction::VerifyEmail)])
            .await
            .expect("nothing to send");
    }

    #[test]
    fn test_requires_signing_key() {
        let notifications = NotificationConfig {
            email_smtp: Some("smtp.example.com".into()),
            email_from: Some("idm@example.com".into()),
            ..Default::default()
        };
        let provisioning = ProvisioningConfig {
            public_url: Some("https://idm.example.com/auth".into()),
            ..Default::default()
        };
        assert!(EmailActionNotifier::new(&notifications, &provisioning).is_err());
    }
}
