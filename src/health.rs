use crate::DispatcherStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub queue_warning: usize,
    pub queue_critical: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            queue_warning: 100,
            queue_critical: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthLevel,
    pub pool: HealthLevel,
    pub queue: HealthLevel,
    pub stats: DispatcherStats,
    pub timestamp: DateTime<Utc>,
}

pub fn assess(stats: DispatcherStats, thresholds: &HealthThresholds) -> HealthReport {
    let pool = pool_health(&stats);
    let queue = queue_health(&stats, thresholds);
    let overall = if stats.shutting_down {
        HealthLevel::Critical
    } else {
        worst(&[pool, queue])
    };

    HealthReport {
        overall,
        pool,
        queue,
        stats,
        timestamp: Utc::now(),
    }
}

fn pool_health(stats: &DispatcherStats) -> HealthLevel {
    if stats.pool.live == 0 {
        error!("Context pool critical: no live rendering contexts");
        HealthLevel::Critical
    } else if stats.pool.live < stats.pool.capacity {
        warn!(
            "Context pool degraded: {} of {} contexts live",
            stats.pool.live, stats.pool.capacity
        );
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

fn queue_health(stats: &DispatcherStats, thresholds: &HealthThresholds) -> HealthLevel {
    let depth = stats.queue.depth;
    if depth > thresholds.queue_critical {
        error!("Admission queue critical: {} waiting", depth);
        HealthLevel::Critical
    } else if depth > thresholds.queue_warning {
        warn!("Admission queue warning: {} waiting", depth);
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

fn worst(levels: &[HealthLevel]) -> HealthLevel {
    if levels.contains(&HealthLevel::Critical) {
        HealthLevel::Critical
    } else if levels.contains(&HealthLevel::Warning) {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}
