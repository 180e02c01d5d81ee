//! Persisted review shape and the feed label parsers that produce it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{AppId, ReviewId};

/// Exact timestamp layout used by the review feed (`2006-01-02T15:04:05-07:00`).
pub const FEED_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%:z";

/// A customer review as stored by the pipeline.
///
/// Immutable once persisted; `(app_id, id)` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub app_id: AppId,
    pub author: String,
    pub title: String,
    pub content: String,
    pub rating: i32,
    pub sent_at: DateTime<Utc>,
}

/// Parse a feed `updated` label. The offset is mandatory; `Z` is rejected.
pub fn parse_feed_time(label: &str) -> Result<DateTime<Utc>, DomainError> {
    DateTime::parse_from_str(label, FEED_TIME_FORMAT)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::invalid_timestamp(label, e.to_string()))
}

/// Parse a feed `im:rating` label.
pub fn parse_rating(label: &str) -> Result<i32, DomainError> {
    label
        .parse::<i32>()
        .map_err(|_| DomainError::InvalidRating(label.to_string()))
}
