//! Aggregation of every page of a directory collection into one record set.
//!
//! Pages are requested sequentially. Any failure stops the walk and the
//! records gathered so far are returned; a failure on the first page yields an
//! empty set. Callers must read an empty set as "nothing to apply", never as
//! "the directory is empty".

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{DirectoryPort, PageEnvelope};
use crate::errors::FetchError;
use crate::models::{RemoteRecord, SyncMode};

/// Fixed page size requested from the directory.
pub const PER_PAGE: u32 = 400;

/// Walks the pages of a directory collection.
#[derive(Clone)]
pub struct PageFetcher {
    port: Arc<dyn DirectoryPort>,
}

impl PageFetcher {
    pub fn new(port: Arc<dyn DirectoryPort>) -> Self {
        Self { port }
    }

    /// Fetch every page of the collection selected by `mode`.
    ///
    /// Entries are returned in first-seen order with exact duplicates removed.
    /// `None` entries stand for `null` elements in a page body.
    pub async fn fetch_all(&self, mode: &SyncMode) -> Vec<Option<RemoteRecord>> {
        let mut acc = RecordAccumulator::default();

        let (first, records) = match self.fetch_records(mode, 1).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, %mode, "received a non OK answer from the remote directory");
                return Vec::new();
            }
        };
        acc.extend(records);

        let total_pages = further_pages(&first);
        for page in 2..=total_pages {
            match self.fetch_records(mode, page).await {
                Ok((_, records)) => {
                    debug!(page, total_pages, added = records.len(), "processed page");
                    acc.extend(records);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        page,
                        total_pages,
                        kept = acc.len(),
                        "page request failed, keeping records fetched so far"
                    );
                    break;
                }
            }
        }

        info!(%mode, records = acc.len(), "remote directory fetch finished");
        acc.into_records()
    }

    async fn fetch_records(
        &self,
        mode: &SyncMode,
        page: u32,
    ) -> Result<(PageEnvelope, Vec<Option<RemoteRecord>>), FetchError> {
        let envelope = self.port.fetch_page(mode, page, PER_PAGE).await?;
        let records: Vec<Option<RemoteRecord>> = serde_json::from_str(&envelope.body)
            .map_err(|e| FetchError::MalformedBody {
                page,
                detail: e.to_string(),
            })?;
        Ok((envelope, records))
    }
}

/// Last page index to request, or 0 when the first page was the only one.
///
/// Unparsable paging headers mean "no further pages".
fn further_pages(envelope: &PageEnvelope) -> u32 {
    let (Some(page), Some(total)) = (envelope.page.as_deref(), envelope.total_pages.as_deref())
    else {
        return 0;
    };
    match (page.parse::<u32>(), total.parse::<u32>()) {
        (Ok(page), Ok(total)) if total > page => total,
        (Ok(_), Ok(_)) => 0,
        _ => {
            warn!(page, total, "paging header not well formed");
            0
        }
    }
}

/// Insertion-ordered set of fetched entries.
#[derive(Default)]
struct RecordAccumulator {
    seen: HashSet<Option<RemoteRecord>>,
    records: Vec<Option<RemoteRecord>>,
}

impl RecordAccumulator {
    fn extend(&mut self, records: Vec<Option<RemoteRecord>>) {
        for record in records {
            if self.seen.insert(record.clone()) {
                self.records.push(record);
            }
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn into_records(self) -> Vec<Option<RemoteRecord>> {
        self.records
    }
}
