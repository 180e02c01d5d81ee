//! `appreview-core` — domain building blocks for the review pipeline.
//!
//! This crate contains **pure domain** primitives (no I/O): identifiers,
//! the persisted review shape, feed label parsing and the watermark rule.

pub mod app;
pub mod clock;
pub mod error;
pub mod id;
pub mod review;
pub mod watermark;

pub use app::App;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{AppId, ReviewId};
pub use review::{FEED_TIME_FORMAT, Review, parse_feed_time, parse_rating};
pub use watermark::Watermark;
