//! Infrastructure layer: SQLite persistence, the durable job queue, the
//! review feed client and the background workers that tie them together.

pub mod apps;
pub mod config;
pub mod db;
pub mod feed;
pub mod queue;
pub mod reviews;
pub mod workers;
