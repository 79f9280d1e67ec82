//! reqwest-backed implementation of [`DirectoryPort`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use tracing::{debug, info, instrument};

use super::{format_since, DirectoryPort, PageEnvelope, HEADER_PAGE, HEADER_PER_PAGE, HEADER_TOTAL_PAGES};
use crate::config::RemoteConfig;
use crate::errors::FetchError;
use crate::models::SyncMode;

/// Asynchronous client for the remote user directory.
#[derive(Clone)]
pub struct RestDirectoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl RestDirectoryClient {
    /// Build a client from the remote section of the configuration.
    pub fn new(config: &RemoteConfig) -> Result<Self, FetchError> {
        let base_url = config.url.trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("restfed/0.1"));

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs));

        if config.proxy_enabled {
            if let Some(proxy) = config.effective_proxy() {
                info!(proxy = %proxy, "routing directory requests through proxy");
                builder = builder.proxy(reqwest::Proxy::all(&proxy)?);
            }
        } else {
            builder = builder.no_proxy();
        }

        let http = builder.build()?;
        info!(base_url = %base_url, "created RestDirectoryClient");
        Ok(Self { http, base_url })
    }

    /// Endpoint URL for a sync mode.
    pub fn endpoint(&self, mode: &SyncMode) -> String {
        match mode {
            SyncMode::Full => format!("{}/full", self.base_url),
            SyncMode::UpdatedSince(since) => {
                format!("{}/updated/{}", self.base_url, format_since(since))
            }
        }
    }
}

#[async_trait]
impl DirectoryPort for RestDirectoryClient {
    #[instrument(skip(self))]
    async fn fetch_page(
        &self,
        mode: &SyncMode,
        page: u32,
        per_page: u32,
    ) -> Result<PageEnvelope, FetchError> {
        let url = self.endpoint(mode);
        let resp = self
            .http
            .get(&url)
            .header(HEADER_PAGE, page.to_string())
            .header(HEADER_PER_PAGE, per_page.to_string())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                page,
            });
        }

        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        let page_header = header(HEADER_PAGE);
        let total_pages = header(HEADER_TOTAL_PAGES);
        let per_page_header = header(HEADER_PER_PAGE);

        let body = resp.text().await?;
        debug!(
            url = %url,
            page = ?page_header,
            total_pages = ?total_pages,
            bytes = body.len(),
            "fetched directory page"
        );

        Ok(PageEnvelope {
            body,
            page: page_header,
            total_pages,
            per_page: per_page_header,
        })
    }
}
