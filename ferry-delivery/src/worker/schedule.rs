use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::Serialize;
use tokio::sync::Notify;

use crate::policy::RetryPolicy;

/// Execution timestamps shared between the worker and its observers.
/// Zero encodes "not yet".
#[derive(Debug, Default)]
pub(crate) struct Schedule {
    last_execution_at: AtomicU64,
    next_execution_at: AtomicU64,
}

impl Schedule {
    pub(crate) fn record_run(&self, started_at: u64, next_at: u64) {
        self.last_execution_at.store(started_at, Ordering::Release);
        self.next_execution_at.store(next_at, Ordering::Release);
    }

    pub(crate) fn set_next(&self, next_at: u64) {
        self.next_execution_at.store(next_at, Ordering::Release);
    }

    fn load(cell: &AtomicU64) -> Option<u64> {
        match cell.load(Ordering::Acquire) {
            0 => None,
            at => Some(at),
        }
    }
}

/// Scheduler configuration and state, as reported by stats.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub total_retries: u32,
    pub first_wait_minutes: u32,
    pub growth_factor: f64,
    pub initial_delay_seconds: u64,
    pub period_seconds: u64,
    pub last_execution_epoch_seconds: Option<u64>,
    pub next_execution_epoch_seconds: Option<u64>,
}

/// Cheap, cloneable view of a running worker for the management side:
/// read its schedule, or ask it to run a tick now.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub(crate) policy: RetryPolicy,
    pub(crate) initial_delay_secs: u64,
    pub(crate) period_secs: u64,
    pub(crate) schedule: Arc<Schedule>,
    pub(crate) nudge: Arc<Notify>,
}

impl WorkerHandle {
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wake the worker for an extra tick. Coalesces: many nudges before the
    /// worker looks produce one tick.
    pub fn process_now(&self) {
        self.nudge.notify_one();
    }

    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            total_retries: self.policy.total_retries,
            first_wait_minutes: self.policy.first_wait_minutes,
            growth_factor: self.policy.growth_factor,
            initial_delay_seconds: self.initial_delay_secs,
            period_seconds: self.period_secs,
            last_execution_epoch_seconds: Schedule::load(&self.schedule.last_execution_at),
            next_execution_epoch_seconds: Schedule::load(&self.schedule.next_execution_at),
        }
    }
}
