use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::operator::Operator;

/// Shared status server state
#[derive(Clone)]
pub struct OperatorState {
    pub operator: Arc<Operator>,
    pub started_at: DateTime<Utc>,
}

impl OperatorState {
    pub fn new(operator: Arc<Operator>) -> Self {
        Self {
            operator,
            started_at: Utc::now(),
        }
    }

    /// Seconds since the server state was created
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
