//! Backoff policy for relay jobs.
//!
//! A geometric progression: the wait after attempt `n` is
//! `first_wait_minutes * growth_factor^n` minutes, rounded to whole minutes.
//! With the defaults (1 minute, 1.2, 30 retries) the final attempt happens a
//! little over a day after the job was queued.

use std::time::Duration;

use ferry_queue::RelayJob;
use serde::{Deserialize, Serialize};

/// Pure policy inputs; holds no per-job state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which a job is exhausted and leaves the queue.
    ///
    /// Default: 30
    #[serde(default = "defaults::total_retries")]
    pub total_retries: u32,

    /// Wait after the first failed attempt, in minutes.
    ///
    /// Default: 1
    #[serde(default = "defaults::first_wait_minutes")]
    pub first_wait_minutes: u32,

    /// Multiplier applied per additional attempt.
    ///
    /// Default: 1.2
    #[serde(default = "defaults::growth_factor")]
    pub growth_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            total_retries: defaults::total_retries(),
            first_wait_minutes: defaults::first_wait_minutes(),
            growth_factor: defaults::growth_factor(),
        }
    }
}

impl RetryPolicy {
    /// Unrounded wait, in minutes, after `attempt_count` attempts.
    #[must_use]
    pub fn next_delay_minutes(&self, attempt_count: u32) -> f64 {
        let exponent = i32::try_from(attempt_count).unwrap_or(i32::MAX);
        f64::from(self.first_wait_minutes) * self.growth_factor.powi(exponent)
    }

    /// Wait after `attempt_count` attempts, rounded to whole minutes.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss,
        reason = "value is finite, non-negative and clamped below u64::MAX"
    )]
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        const MAX_MINUTES: f64 = (u64::MAX / 60) as f64;

        let minutes = self.next_delay_minutes(attempt_count).round();
        let minutes = if minutes.is_nan() {
            0.0
        } else {
            minutes.clamp(0.0, MAX_MINUTES)
        };

        Duration::from_secs((minutes as u64).saturating_mul(60))
    }

    /// Epoch second at which a job that last tried at `last_attempt_at` may
    /// try again.
    #[must_use]
    pub fn next_attempt_at(&self, attempt_count: u32, last_attempt_at: u64) -> u64 {
        last_attempt_at.saturating_add(self.next_delay(attempt_count).as_secs())
    }

    /// Never-attempted and operator-forced jobs are always eligible;
    /// otherwise the backoff wait must have elapsed.
    #[must_use]
    pub fn is_eligible(&self, job: &RelayJob, now: u64) -> bool {
        if job.attempt_count == 0 || job.forced {
            return true;
        }

        job.last_attempt_at
            .is_none_or(|last| now >= self.next_attempt_at(job.attempt_count, last))
    }

    #[must_use]
    pub const fn is_exhausted(&self, job: &RelayJob) -> bool {
        job.attempt_count >= self.total_retries
    }

    #[must_use]
    pub const fn remaining_attempts(&self, attempt_count: u32) -> u32 {
        self.total_retries.saturating_sub(attempt_count)
    }
}

mod defaults {
    pub const fn total_retries() -> u32 {
        30
    }

    pub const fn first_wait_minutes() -> u32 {
        1
    }

    pub const fn growth_factor() -> f64 {
        1.2
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use std::path::PathBuf;

    use ferry_queue::{Envelope, MessageBody};
    use pretty_assertions::assert_eq;

    use super::*;

    fn job(attempt_count: u32, last_attempt_at: Option<u64>) -> RelayJob {
        RelayJob {
            attempt_count,
            last_attempt_at,
            ..RelayJob::new(
                vec![Envelope::new(
                    "a@example.org",
                    vec!["b@example.com".into()],
                    MessageBody::Stored(PathBuf::from("/var/spool/ferry/queue/x.eml")),
                )],
                "esmtp",
                0,
            )
        }
    }

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.total_retries, 30);
        assert_eq!(policy.first_wait_minutes, 1);
        assert_eq!(policy.growth_factor, 1.2);
    }

    #[test]
    fn geometric_progression() {
        let policy = RetryPolicy {
            total_retries: 10,
            first_wait_minutes: 5,
            growth_factor: 2.0,
        };

        assert_eq!(policy.next_delay_minutes(0), 5.0);
        assert_eq!(policy.next_delay_minutes(1), 10.0);
        assert_eq!(policy.next_delay_minutes(2), 20.0);
        assert_eq!(policy.next_delay(2), Duration::from_secs(20 * 60));
    }

    #[test]
    fn default_delays_round_to_whole_minutes() {
        let policy = RetryPolicy::default();
        let minutes: Vec<u64> = (0..7).map(|n| policy.next_delay(n).as_secs() / 60).collect();
        assert_eq!(minutes, vec![1, 1, 1, 2, 2, 2, 3]);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = RetryPolicy {
            growth_factor: 10.0,
            ..RetryPolicy::default()
        };
        assert!(policy.next_delay(u32::MAX) >= Duration::from_secs(u64::MAX / 2));
        assert_eq!(policy.next_attempt_at(u32::MAX, 1_000), u64::MAX);
    }

    #[test]
    fn first_attempt_is_immediately_eligible() {
        let policy = RetryPolicy::default();
        assert!(policy.is_eligible(&job(0, None), 0));
    }

    #[test]
    fn waits_for_backoff_between_attempts() {
        let policy = RetryPolicy {
            total_retries: 10,
            first_wait_minutes: 5,
            growth_factor: 2.0,
        };
        let retried = job(1, Some(1_000));

        assert!(!policy.is_eligible(&retried, 1_000 + 599));
        assert!(policy.is_eligible(&retried, 1_000 + 600));
    }

    #[test]
    fn forced_jobs_skip_the_wait() {
        let policy = RetryPolicy::default();
        let mut forced = job(3, Some(1_000));
        assert!(!policy.is_eligible(&forced, 1_001));

        forced.forced = true;
        assert!(policy.is_eligible(&forced, 1_001));
    }

    #[test]
    fn exhaustion_boundary() {
        let policy = RetryPolicy {
            total_retries: 3,
            ..RetryPolicy::default()
        };
        assert!(!policy.is_exhausted(&job(2, Some(0))));
        assert!(policy.is_exhausted(&job(3, Some(0))));
        assert!(policy.is_exhausted(&job(4, Some(0))));
        assert_eq!(policy.remaining_attempts(2), 1);
        assert_eq!(policy.remaining_attempts(7), 0);
    }

    #[test]
    fn deserializes_with_defaults() {
        let policy: RetryPolicy = ron::from_str("(total_retries: 10)").unwrap();
        assert_eq!(policy.total_retries, 10);
        assert_eq!(policy.first_wait_minutes, 1);
    }
}
