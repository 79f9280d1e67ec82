//! Remote user directory access.
//!
//! The directory serves `GET {base}/full` and `GET {base}/updated/{from}`,
//! paginated through headers rather than the body:
//!
//! | Header          | Description                               |
//! |-----------------|-------------------------------------------|
//! | `X-Page`        | index of the current page (starting at 1) |
//! | `X-Per-Page`    | number of items per page                  |
//! | `X-Total-Pages` | total number of pages                     |
//!
//! [`DirectoryPort`] is the seam between the page aggregation logic in
//! [`fetcher::PageFetcher`] and the HTTP transport in
//! [`client::RestDirectoryClient`].

pub mod client;
pub mod fetcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::FetchError;
use crate::models::SyncMode;

pub use client::RestDirectoryClient;
pub use fetcher::PageFetcher;

/// Request / response header carrying the page index.
pub const HEADER_PAGE: &str = "X-Page";
/// Request / response header carrying the page size.
pub const HEADER_PER_PAGE: &str = "X-Per-Page";
/// Response header carrying the number of pages.
pub const HEADER_TOTAL_PAGES: &str = "X-Total-Pages";

/// Timestamp format of the `/updated/{from}` path segment (UTC).
pub const UPDATED_SINCE_FORMAT: &str = "%Y-%m-%dT%H:%MZ";

/// Format a timestamp for the `/updated/{from}` endpoint.
pub fn format_since(since: &DateTime<Utc>) -> String {
    since.format(UPDATED_SINCE_FORMAT).to_string()
}

/// One page as returned by the directory, before deserialization.
///
/// Paging metadata is kept as raw header text so the fetcher can tell a
/// malformed header apart from a missing one.
#[derive(Debug, Clone, Default)]
pub struct PageEnvelope {
    pub body: String,
    pub page: Option<String>,
    pub total_pages: Option<String>,
    pub per_page: Option<String>,
}

/// Page-bounded access to the remote directory.
#[async_trait]
pub trait DirectoryPort: Send + Sync {
    /// Fetch one page of the collection selected by `mode`.
    async fn fetch_page(
        &self,
        mode: &SyncMode,
        page: u32,
        per_page: u32,
    ) -> Result<PageEnvelope, FetchError>;
}
