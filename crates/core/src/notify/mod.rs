//! Post-provisioning notification.
//!
//! Newly created identities can be sent action links (verify email, set a
//! password, custom templates). Delivery failures are reported to the caller,
//! which logs them; they never fail a sync run.

pub mod actions;
pub mod email;
pub mod token;

use async_trait::async_trait;

use crate::errors::NotificationError;
use crate::models::LocalIdentity;

pub use actions::{RequiredAction, ResetAction};
pub use email::EmailActionNotifier;
pub use token::ActionToken;

/// Fires post-creation actions for an identity.
#[async_trait]
pub trait ProvisionNotifier: Send + Sync {
    async fn notify(
        &self,
        identity: &LocalIdentity,
        actions: &[ResetAction],
    ) -> Result<(), NotificationError>;
}
