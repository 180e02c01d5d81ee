//! Watermark-bounded traversal of the review feed.
//!
//! The feed has no cursor API, so the engine walks pages newest-first and
//! stops at the first entry at or before the cutoff. Entries are assumed to be
//! ordered by their `updated` timestamp; a newer entry that appears after a
//! stale one is not returned.

use appreview_core::AppId;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::client::{FeedError, FeedSource};
use super::page::FeedEntry;

/// The feed serves at most ten pages per application.
pub const DEFAULT_MAX_PAGES: usize = 10;

/// Fetch engine error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The first page carried no entries at all.
    #[error("no reviews found")]
    NoReviews,
    #[error(transparent)]
    Feed(#[from] FeedError),
}

pub struct FetchEngine<F> {
    source: F,
    max_pages: usize,
}

impl<F: FeedSource> FetchEngine<F> {
    pub fn new(source: F) -> Self {
        Self::with_max_pages(source, DEFAULT_MAX_PAGES)
    }

    pub fn with_max_pages(source: F, max_pages: usize) -> Self {
        Self {
            source,
            max_pages: max_pages.max(1),
        }
    }

    /// Entries strictly newer than `cutoff`, in feed order.
    #[instrument(skip(self, app_id, cutoff), fields(app_id = %app_id, cutoff = %cutoff))]
    pub async fn fetch_new_reviews(
        &self,
        app_id: &AppId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FeedEntry>, FetchError> {
        let mut page = self.source.first_page(app_id).await?;
        if page.entries.is_empty() {
            return Err(FetchError::NoReviews);
        }

        let mut fresh = Vec::new();
        let mut pages = 1;
        loop {
            for entry in &page.entries {
                match entry.updated_at() {
                    Ok(updated) if updated > cutoff => fresh.push(entry.clone()),
                    Ok(_) => {
                        debug!(pages, fresh = fresh.len(), "reached cutoff");
                        return Ok(fresh);
                    }
                    Err(e) => {
                        warn!(review_id = %entry.id.label, error = %e, "skipping entry with unparseable timestamp");
                    }
                }
            }

            if !page.has_next() {
                break;
            }
            if pages >= self.max_pages {
                warn!(pages, "page limit reached before cutoff");
                break;
            }
            page = self.source.next_page(&page).await?;
            pages += 1;
        }

        debug!(pages, fresh = fresh.len(), "feed exhausted");
        Ok(fresh)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use appreview_core::FEED_TIME_FORMAT;

    use super::*;
    use crate::feed::page::testing::entry;
    use crate::feed::page::{FeedLink, Page};

    /// Feed fake serving a fixed list of linked pages.
    ///
    /// Page `i` links to `mem://page/{i+1}/xml` when a following page exists.
    /// `fail_first` makes the next `first_page` calls fail.
    #[derive(Default)]
    pub struct ScriptedFeed {
        pages: Vec<Page>,
        pub fail_first: Mutex<Vec<FeedError>>,
        pub requests: AtomicUsize,
    }

    pub fn label(t: DateTime<Utc>) -> String {
        t.format(FEED_TIME_FORMAT).to_string()
    }

    impl ScriptedFeed {
        /// Build pages of `(review id, updated label)` pairs.
        pub fn new(pages: Vec<Vec<(String, String)>>) -> Self {
            let count = pages.len();
            let pages = pages
                .into_iter()
                .enumerate()
                .map(|(i, entries)| Page {
                    entries: entries.iter().map(|(id, updated)| entry(id, updated)).collect(),
                    links: if i + 1 < count {
                        vec![FeedLink::new("next", &format!("mem://page/{}/xml", i + 1))]
                    } else {
                        Vec::new()
                    },
                })
                .collect();
            Self {
                pages,
                ..Self::default()
            }
        }

        /// Pages of entries whose ids are their position in the feed.
        pub fn from_times(pages: Vec<Vec<DateTime<Utc>>>) -> Self {
            let mut n = 0;
            Self::new(
                pages
                    .into_iter()
                    .map(|times| {
                        times
                            .into_iter()
                            .map(|t| {
                                n += 1;
                                (n.to_string(), label(t))
                            })
                            .collect()
                    })
                    .collect(),
            )
        }

        pub fn failing_once(self, err: FeedError) -> Self {
            self.fail_first.lock().unwrap().push(err);
            self
        }

        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl FeedSource for ScriptedFeed {
        async fn first_page(&self, _app_id: &AppId) -> Result<Page, FeedError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.fail_first.lock().unwrap().pop() {
                return Err(err);
            }
            Ok(self.pages.first().cloned().unwrap_or_default())
        }

        async fn next_page(&self, page: &Page) -> Result<Page, FeedError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let url = page.next_url().ok_or(FeedError::NoNextPage)?;
            let index: usize = url
                .trim_start_matches("mem://page/")
                .trim_end_matches("/json")
                .parse()
                .map_err(|_| FeedError::NoNextPage)?;
            self.pages.get(index).cloned().ok_or(FeedError::Status { url, status: 404 })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedFeed, label};
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap()
    }

    fn mins(m: i64) -> DateTime<Utc> {
        base() + Duration::minutes(m)
    }

    fn ids(entries: &[FeedEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.id.label.as_str()).collect()
    }

    fn app() -> AppId {
        AppId::new("111").unwrap()
    }

    #[tokio::test]
    async fn stops_at_first_stale_entry() {
        let feed = ScriptedFeed::from_times(vec![vec![mins(30), mins(20), mins(10)], vec![mins(5)]]);
        let engine = FetchEngine::new(feed);

        let fresh = engine.fetch_new_reviews(&app(), mins(15)).await.unwrap();
        assert_eq!(ids(&fresh), vec!["1", "2"]);
        // Never looked past the first page
        assert_eq!(engine.source.requests(), 1);
    }

    #[tokio::test]
    async fn entry_at_cutoff_is_not_new() {
        let engine = FetchEngine::new(ScriptedFeed::from_times(vec![vec![mins(30), mins(20)]]));
        let fresh = engine.fetch_new_reviews(&app(), mins(20)).await.unwrap();
        assert_eq!(ids(&fresh), vec!["1"]);

        let fresh = engine.fetch_new_reviews(&app(), mins(30)).await.unwrap();
        assert!(fresh.is_empty());
    }

    #[tokio::test]
    async fn walks_pages_until_cutoff() {
        let feed = ScriptedFeed::from_times(vec![
            vec![mins(60), mins(50)],
            vec![mins(40), mins(30)],
            vec![mins(20), mins(10)],
        ]);
        let engine = FetchEngine::new(feed);

        let fresh = engine.fetch_new_reviews(&app(), mins(25)).await.unwrap();
        assert_eq!(ids(&fresh), vec!["1", "2", "3", "4"]);
        assert_eq!(engine.source.requests(), 3);
    }

    #[tokio::test]
    async fn everything_new_returns_the_whole_feed() {
        let feed = ScriptedFeed::from_times(vec![vec![mins(60), mins(50)], vec![mins(40)]]);
        let engine = FetchEngine::new(feed);
        let fresh = engine.fetch_new_reviews(&app(), mins(0)).await.unwrap();
        assert_eq!(fresh.len(), 3);
    }

    #[tokio::test]
    async fn page_limit_bounds_traversal() {
        let pages = (0..5).map(|p| vec![mins(100 - p * 10)]).collect();
        let engine = FetchEngine::with_max_pages(ScriptedFeed::from_times(pages), 3);

        let fresh = engine.fetch_new_reviews(&app(), mins(0)).await.unwrap();
        assert_eq!(ids(&fresh), vec!["1", "2", "3"]);
        assert_eq!(engine.source.requests(), 3);
    }

    #[tokio::test]
    async fn empty_first_page_is_no_reviews() {
        let engine = FetchEngine::new(ScriptedFeed::new(vec![vec![]]));
        assert_eq!(
            engine.fetch_new_reviews(&app(), mins(0)).await,
            Err(FetchError::NoReviews)
        );
    }

    #[tokio::test]
    async fn feed_errors_propagate() {
        let feed = ScriptedFeed::from_times(vec![vec![mins(10)]]).failing_once(FeedError::Status {
            url: "x".into(),
            status: 503,
        });
        let engine = FetchEngine::new(feed);
        assert!(matches!(
            engine.fetch_new_reviews(&app(), mins(0)).await,
            Err(FetchError::Feed(FeedError::Status { status: 503, .. }))
        ));
    }

    #[tokio::test]
    async fn unparseable_timestamps_are_skipped() {
        let feed = ScriptedFeed::new(vec![vec![
            ("a".into(), label(mins(30))),
            ("b".into(), "yesterday".into()),
            ("c".into(), label(mins(20))),
            ("d".into(), label(mins(5))),
        ]]);
        let engine = FetchEngine::new(feed);
        let fresh = engine.fetch_new_reviews(&app(), mins(10)).await.unwrap();
        assert_eq!(ids(&fresh), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn newer_entry_after_a_stale_one_is_missed() {
        // Out-of-order feed: "3" is newer than the cutoff but sits behind "2".
        let feed = ScriptedFeed::from_times(vec![vec![mins(30), mins(5), mins(25)]]);
        let engine = FetchEngine::new(feed);
        let fresh = engine.fetch_new_reviews(&app(), mins(10)).await.unwrap();
        assert_eq!(ids(&fresh), vec!["1"]);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: the result is exactly the longest feed-order prefix of
        /// entries newer than the cutoff, whatever the entry order.
        #[test]
        fn returns_the_fresh_prefix(
            pages in prop::collection::vec(prop::collection::vec(0i64..500, 1..6), 1..6),
            cutoff in 0i64..500,
        ) {
            let times: Vec<Vec<DateTime<Utc>>> = pages
                .iter()
                .map(|p| p.iter().map(|m| mins(*m)).collect())
                .collect();
            let expected: Vec<String> = times
                .iter()
                .flatten()
                .take_while(|t| **t > mins(cutoff))
                .enumerate()
                .map(|(i, _)| (i + 1).to_string())
                .collect();

            let engine = FetchEngine::with_max_pages(ScriptedFeed::from_times(times), 10);
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let fresh = rt.block_on(engine.fetch_new_reviews(&app(), mins(cutoff))).unwrap();

            prop_assert_eq!(ids(&fresh), expected.iter().map(String::as_str).collect::<Vec<_>>());
            prop_assert!(fresh.iter().all(|e| e.updated_at().unwrap() > mins(cutoff)));
        }
    }
}
