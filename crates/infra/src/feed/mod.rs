//! Review feed: wire types, HTTP client and the page-walking fetch engine.

pub mod client;
pub mod engine;
pub mod page;

pub use client::{DEFAULT_FEED_TIMEOUT, DEFAULT_FEED_URL_TEMPLATE, FeedError, FeedSource, HttpFeedClient};
pub use engine::{DEFAULT_MAX_PAGES, FetchEngine, FetchError};
pub use page::{FeedAuthor, FeedEntry, FeedLink, Label, Page};
