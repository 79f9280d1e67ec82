//! Removal of null and colliding records before orchestration.
//!
//! Records are filtered in fetch order, first on `email`, then on `username`.
//! A record survives only if its email was not taken by an earlier record and
//! its username was not taken by an earlier *surviving* record. A record
//! dropped on its email therefore does not reserve its username. Every
//! dropped record counts as one failure.

use std::collections::HashSet;

use tracing::warn;

use crate::models::{RemoteRecord, SyncResult};

/// Filters a fetched record set down to one record per identity key.
pub struct Deduplicator;

impl Deduplicator {
    /// Drop nulls and key collisions; the output is ordered by username.
    pub fn clean<I>(records: I, result: &mut SyncResult) -> Vec<RemoteRecord>
    where
        I: IntoIterator<Item = Option<RemoteRecord>>,
    {
        let mut seen_emails: HashSet<Option<String>> = HashSet::new();
        let mut seen_usernames: HashSet<Option<String>> = HashSet::new();
        let mut kept = Vec::new();

        for record in records.into_iter().flatten() {
            let first_email = seen_emails.insert(record.email.clone());
            let survives = first_email && seen_usernames.insert(record.user_name.clone());
            if survives {
                kept.push(record);
            } else {
                warn!(
                    username = record.user_name.as_deref().unwrap_or(""),
                    email = record.email.as_deref().unwrap_or(""),
                    "ignored user: duplicate email or username"
                );
                result.increase_failed();
            }
        }

        kept.sort_by(|a, b| a.user_name.cmp(&b.user_name));
        kept
    }
}
