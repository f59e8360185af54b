//! JSON summary printed after a soak run.

use serde::Serialize;

use qpool::{PoolConfig, PoolStats, TaskState};

#[derive(Debug, Serialize)]
pub struct SoakReport {
    pub config: PoolConfig,
    pub stats: PoolStats,
    pub state: TaskState,
    /// Whether the drain finished before the shutdown deadline.
    pub completed: bool,
    pub claims: u64,
    pub retired: u64,
    /// Resources allocated but never destroyed. Zero after a clean drain.
    pub leaked: i64,
    pub started_at: String,
    pub finished_at: String,
}
