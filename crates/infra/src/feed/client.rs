//! HTTP client for the paginated review feed.

use std::time::Duration;

use appreview_core::AppId;
use tracing::{debug, instrument};

use super::page::{FeedDocument, Page};

/// Default first-page URL; `{app_id}` is substituted.
pub const DEFAULT_FEED_URL_TEMPLATE: &str =
    "https://itunes.apple.com/us/rss/customerreviews/id={app_id}/sortBy=mostRecent/json";

pub const DEFAULT_FEED_TIMEOUT: Duration = Duration::from_secs(10);

/// Feed access error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("no next page")]
    NoNextPage,
    #[error("request to {url} failed: {reason}")]
    Request { url: String, reason: String },
    #[error("feed returned status {status} for {url}")]
    Status { url: String, status: u16 },
    #[error("failed to decode feed page from {url}: {reason}")]
    Decode { url: String, reason: String },
    #[error("invalid feed client configuration: {0}")]
    Config(String),
}

/// Source of feed pages.
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    /// Newest page of reviews for an application.
    async fn first_page(&self, app_id: &AppId) -> Result<Page, FeedError>;

    /// Page following `page`. Fails with [`FeedError::NoNextPage`] when
    /// [`Page::has_next`] is false.
    async fn next_page(&self, page: &Page) -> Result<Page, FeedError>;
}

#[async_trait::async_trait]
impl<F: FeedSource + ?Sized> FeedSource for std::sync::Arc<F> {
    async fn first_page(&self, app_id: &AppId) -> Result<Page, FeedError> {
        (**self).first_page(app_id).await
    }

    async fn next_page(&self, page: &Page) -> Result<Page, FeedError> {
        (**self).next_page(page).await
    }
}

/// `reqwest`-backed feed client.
#[derive(Debug, Clone)]
pub struct HttpFeedClient {
    http: reqwest::Client,
    url_template: String,
}

impl HttpFeedClient {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let url_template = url_template.into();
        if !url_template.contains("{app_id}") {
            return Err(FeedError::Config(format!(
                "url template {url_template:?} has no {{app_id}} placeholder"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Config(e.to_string()))?;
        Ok(Self { http, url_template })
    }

    pub fn first_page_url(&self, app_id: &AppId) -> String {
        self.url_template.replace("{app_id}", app_id.as_str())
    }

    #[instrument(level = "debug", skip(self))]
    async fn get_page(&self, url: &str) -> Result<Page, FeedError> {
        let resp = self.http.get(url).send().await.map_err(|e| FeedError::Request {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if !resp.status().is_success() {
            return Err(FeedError::Status {
                url: url.to_string(),
                status: resp.status().as_u16(),
            });
        }

        let doc: FeedDocument = resp.json().await.map_err(|e| FeedError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        debug!(entries = doc.feed.entries.len(), has_next = doc.feed.has_next(), "feed page fetched");
        Ok(doc.feed)
    }
}

#[async_trait::async_trait]
impl FeedSource for HttpFeedClient {
    async fn first_page(&self, app_id: &AppId) -> Result<Page, FeedError> {
        self.get_page(&self.first_page_url(app_id)).await
    }

    async fn next_page(&self, page: &Page) -> Result<Page, FeedError> {
        let url = page.next_url().ok_or(FeedError::NoNextPage)?;
        self.get_page(&url).await
    }
}
