//! Review persistence and the per-application watermark derived from it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use appreview_core::{AppId, Clock, Review, ReviewId, Watermark};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use crate::db::{from_millis, to_millis};

/// Review store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewStoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt review row: {0}")]
    Corrupt(String),
}

/// Review persistence.
///
/// Inserting an already-stored `(app_id, id)` is a no-op, so re-ingesting a
/// page never duplicates or rewrites reviews.
#[async_trait::async_trait]
pub trait ReviewStore: Send + Sync {
    /// Insert unless present. Returns whether a row was written.
    async fn upsert_review(&self, review: &Review) -> Result<bool, ReviewStoreError>;

    /// Review with the greatest `sent_at` for the application.
    async fn latest_review(&self, app_id: &AppId) -> Result<Option<Review>, ReviewStoreError>;

    /// Reviews with `sent_at > since`, newest first.
    async fn reviews_since(
        &self,
        app_id: &AppId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, ReviewStoreError>;
}

#[async_trait::async_trait]
impl<S: ReviewStore + ?Sized> ReviewStore for Arc<S> {
    async fn upsert_review(&self, review: &Review) -> Result<bool, ReviewStoreError> {
        (**self).upsert_review(review).await
    }

    async fn latest_review(&self, app_id: &AppId) -> Result<Option<Review>, ReviewStoreError> {
        (**self).latest_review(app_id).await
    }

    async fn reviews_since(
        &self,
        app_id: &AppId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, ReviewStoreError> {
        (**self).reviews_since(app_id, since).await
    }
}

/// Resolves the ingestion cutoff for an application.
pub struct Watermarks<S> {
    store: S,
    lookback: Duration,
    clock: Arc<dyn Clock>,
}

impl<S: ReviewStore> Watermarks<S> {
    /// `lookback` is how far back to go for an application with no reviews yet.
    pub fn new(store: S, lookback: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            lookback,
            clock,
        }
    }

    pub async fn resolve(&self, app_id: &AppId) -> Result<Watermark, ReviewStoreError> {
        let latest = self.store.latest_review(app_id).await?;
        Ok(Watermark::resolve(
            latest.map(|r| r.sent_at),
            self.clock.now(),
            self.lookback,
        ))
    }
}

/// SQLite-backed review store over the `reviews` table.
#[derive(Debug, Clone)]
pub struct SqliteReviewStore {
    pool: SqlitePool,
}

impl SqliteReviewStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ReviewStore for SqliteReviewStore {
    #[instrument(level = "debug", skip(self, review), fields(app_id = %review.app_id, review_id = %review.id), err)]
    async fn upsert_review(&self, review: &Review) -> Result<bool, ReviewStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO reviews (app_id, id, author, title, content, rating, sent_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (app_id, id) DO NOTHING
            "#,
        )
        .bind(review.app_id.as_str())
        .bind(review.id.as_str())
        .bind(&review.author)
        .bind(&review.title)
        .bind(&review.content)
        .bind(review.rating)
        .bind(to_millis(review.sent_at))
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_review", e))?
        .rows_affected();

        Ok(inserted > 0)
    }

    async fn latest_review(&self, app_id: &AppId) -> Result<Option<Review>, ReviewStoreError> {
        let row = sqlx::query(
            r#"
            SELECT app_id, id, author, title, content, rating, sent_at
            FROM reviews
            WHERE app_id = ?1
            ORDER BY sent_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(app_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_review", e))?;

        row.as_ref().map(review_from_row).transpose()
    }

    async fn reviews_since(
        &self,
        app_id: &AppId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, ReviewStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT app_id, id, author, title, content, rating, sent_at
            FROM reviews
            WHERE app_id = ?1 AND sent_at > ?2
            ORDER BY sent_at DESC, id DESC
            "#,
        )
        .bind(app_id.as_str())
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("reviews_since", e))?;

        rows.iter().map(review_from_row).collect()
    }
}

fn review_from_row(row: &SqliteRow) -> Result<Review, ReviewStoreError> {
    let decode = |e: sqlx::Error| ReviewStoreError::Corrupt(e.to_string());
    let invalid = |e: appreview_core::DomainError| ReviewStoreError::Corrupt(e.to_string());
    Ok(Review {
        id: ReviewId::new(row.try_get::<String, _>("id").map_err(decode)?).map_err(invalid)?,
        app_id: AppId::new(row.try_get::<String, _>("app_id").map_err(decode)?).map_err(invalid)?,
        author: row.try_get("author").map_err(decode)?,
        title: row.try_get("title").map_err(decode)?,
        content: row.try_get("content").map_err(decode)?,
        rating: row.try_get("rating").map_err(decode)?,
        sent_at: from_millis(row.try_get("sent_at").map_err(decode)?),
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ReviewStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            ReviewStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        _ => ReviewStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// In-memory review store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    reviews: RwLock<HashMap<AppId, HashMap<ReviewId, Review>>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored reviews for an application.
    pub fn count(&self, app_id: &AppId) -> usize {
        self.reviews
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(app_id)
            .map_or(0, HashMap::len)
    }

    fn newest_first(&self, app_id: &AppId) -> Vec<Review> {
        let reviews = self.reviews.read().unwrap_or_else(|e| e.into_inner());
        let mut result: Vec<Review> = reviews
            .get(app_id)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default();
        result.sort_by(|a, b| b.sent_at.cmp(&a.sent_at).then_with(|| b.id.cmp(&a.id)));
        result
    }
}

#[async_trait::async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn upsert_review(&self, review: &Review) -> Result<bool, ReviewStoreError> {
        let mut reviews = self.reviews.write().unwrap_or_else(|e| e.into_inner());
        let by_id = reviews.entry(review.app_id.clone()).or_default();
        if by_id.contains_key(&review.id) {
            return Ok(false);
        }
        by_id.insert(review.id.clone(), review.clone());
        Ok(true)
    }

    async fn latest_review(&self, app_id: &AppId) -> Result<Option<Review>, ReviewStoreError> {
        Ok(self.newest_first(app_id).into_iter().next())
    }

    async fn reviews_since(
        &self,
        app_id: &AppId,
        since: DateTime<Utc>,
    ) -> Result<Vec<Review>, ReviewStoreError> {
        Ok(self
            .newest_first(app_id)
            .into_iter()
            .filter(|r| r.sent_at > since)
            .collect())
    }
}
