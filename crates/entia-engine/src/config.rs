//! Scheduler configuration.

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Configuration for a [`Schedule`](crate::schedule::Schedule).
///
/// Deserializes with every field optional:
///
/// ```
/// use entia_engine::config::ScheduleConfig;
///
/// let config: ScheduleConfig = serde_json::from_str(r#"{ "workers": 3 }"#).unwrap();
/// assert_eq!(config.workers, 3);
/// assert_eq!(config.parallel_threshold, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Worker threads. The thread calling
    /// [`tick`](crate::schedule::Schedule::tick) blocks while they run a group.
    pub workers: usize,
    /// A group runs on the pool only if it has more actions than this.
    pub parallel_threshold: usize,
}

impl Default for ScheduleConfig {
    /// One worker per available core, at least one.
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            workers: cores.max(1),
            parallel_threshold: 1,
        }
    }
}

impl ScheduleConfig {
    /// Reject a pool without workers.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.workers == 0 {
            return Err(EngineError::InvalidConfig {
                field: "workers",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}
