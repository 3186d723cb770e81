//! Heartbeat record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One liveness pulse, appended to the heartbeat log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatRecord {
    /// Emission time.
    pub timestamp: DateTime<Utc>,
    /// 1-based pulse number since daemon start.
    pub sequence: u64,
}
