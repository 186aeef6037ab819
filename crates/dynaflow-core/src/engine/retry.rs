//! Retry decision and backoff for failed task attempts.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dynaflow_types::config::EngineConfig;
use dynaflow_types::task::Task;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do with a task whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Release the lease and make the task claimable again at `min_start_at`.
    Retry {
        retry_count: u32,
        min_start_at: DateTime<Utc>,
    },
    /// Retry budget spent: record a terminal failure.
    Exhausted,
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff bounded by `max_delay`.
///
/// The n-th retry (1-based) waits `min(base_delay * 2^(n-1), max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            Duration::from_secs(config.retry_base_delay_secs),
            Duration::from_secs(config.retry_max_delay_secs),
        )
    }

    /// Decide the fate of `task` after a failed attempt at `now`.
    pub fn decide(&self, task: &Task, now: DateTime<Utc>) -> RetryDecision {
        if task.retry_count >= task.max_retry_count {
            return RetryDecision::Exhausted;
        }
        let retry_count = task.retry_count + 1;
        let delay = chrono::Duration::from_std(self.backoff(retry_count)).unwrap_or(chrono::Duration::MAX);
        RetryDecision::Retry {
            retry_count,
            min_start_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Delay before the given 1-based retry.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dynaflow_types::ids::{FlowId, TaskId, TaskTypeId};
    use uuid::Uuid;

    fn task(retry_count: u32, max_retry_count: u32) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId(1),
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            flow_id: FlowId(1),
            flow_subject_code: None,
            type_id: TaskTypeId(1),
            description: String::new(),
            dependency_task_id: None,
            max_retry_count,
            retry_count,
            is_parallel_run_allowed: true,
            requested_at: now,
            min_start_at: now,
            started_at: Some(now),
            completed_at: None,
            is_cancel_requested: false,
            is_canceled: false,
            is_started: true,
            is_completed: false,
            is_successful: false,
            is_resubmitted: false,
            processor_identifier: Some("p".into()),
            param1: None,
            param2: None,
            result_value: None,
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(100));
        assert_eq!(policy.backoff(1), Duration::from_secs(30));
        assert_eq!(policy.backoff(2), Duration::from_secs(60));
        assert_eq!(policy.backoff(3), Duration::from_secs(100));
        assert_eq!(policy.backoff(40), Duration::from_secs(100));
    }

    #[test]
    fn retries_until_budget_spent() {
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(3_600));
        let now = Utc::now();

        assert_eq!(
            policy.decide(&task(0, 2), now),
            RetryDecision::Retry {
                retry_count: 1,
                min_start_at: now + chrono::Duration::seconds(10),
            }
        );
        assert_eq!(
            policy.decide(&task(1, 2), now),
            RetryDecision::Retry {
                retry_count: 2,
                min_start_at: now + chrono::Duration::seconds(20),
            }
        );
        assert_eq!(policy.decide(&task(2, 2), now), RetryDecision::Exhausted);
    }

    #[test]
    fn zero_budget_fails_immediately() {
        assert_eq!(
            RetryPolicy::default().decide(&task(0, 0), Utc::now()),
            RetryDecision::Exhausted
        );
    }
}
