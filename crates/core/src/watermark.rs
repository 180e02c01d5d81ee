//! Per-application ingestion cutoff.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Cutoff below which reviews for an application are assumed ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    /// `sent_at` of the newest persisted review.
    Persisted(DateTime<Utc>),
    /// No review persisted yet: `now - lookback`.
    Default(DateTime<Utc>),
}

impl Watermark {
    /// Resolve the cutoff from the newest persisted `sent_at`, if any.
    pub fn resolve(latest: Option<DateTime<Utc>>, now: DateTime<Utc>, lookback: Duration) -> Self {
        match latest {
            Some(at) => Watermark::Persisted(at),
            None => {
                let lookback = chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::MAX);
                Watermark::Default(now.checked_sub_signed(lookback).unwrap_or(DateTime::<Utc>::MIN_UTC))
            }
        }
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        match self {
            Watermark::Persisted(at) | Watermark::Default(at) => *at,
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Watermark::Default(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn persisted_watermark_wins() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let latest = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let w = Watermark::resolve(Some(latest), now, Duration::from_secs(3600));
        assert_eq!(w, Watermark::Persisted(latest));
        assert_eq!(w.cutoff(), latest);
    }

    #[test]
    fn default_watermark_is_now_minus_lookback() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let w = Watermark::resolve(None, now, Duration::from_secs(48 * 3600));
        assert!(w.is_default());
        assert_eq!(w.cutoff(), Utc.with_ymd_and_hms(2024, 5, 8, 12, 0, 0).unwrap());
    }

    #[test]
    fn huge_lookback_saturates() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let w = Watermark::resolve(None, now, Duration::from_secs(u64::MAX));
        assert_eq!(w.cutoff(), DateTime::<Utc>::MIN_UTC);
    }

    proptest! {
        #[test]
        fn default_cutoff_never_exceeds_now(secs in 0i64..4_000_000_000, lookback in 0u64..10_000_000_000) {
            let now = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
            let w = Watermark::resolve(None, now, Duration::from_secs(lookback));
            prop_assert!(w.cutoff() <= now);
            prop_assert!(w.is_default());
        }
    }
}
