//! Monitored application record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::AppId;

/// An application the scheduler enumerates on every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub id: AppId,
    pub created_at: DateTime<Utc>,
}

impl App {
    pub fn new(id: AppId) -> Self {
        Self {
            id,
            created_at: Utc::now(),
        }
    }
}
