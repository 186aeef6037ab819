//! Engine configuration types.
//!
//! `EngineConfig` represents `dynaflow.toml` in the data directory. Every field
//! has a default so an empty or missing file yields a working processor.

use serde::{Deserialize, Serialize};

use crate::ids::OwnerId;

/// Tunables for a processor instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lease identity written into claimed tasks. Generated when absent.
    #[serde(default)]
    pub processor_identifier: Option<String>,

    /// Restrict polling to one owner. `None` serves every owner.
    #[serde(default)]
    pub owner_id: Option<OwnerId>,

    /// Delay between claim polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum candidates fetched per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Tasks executing concurrently in this processor.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// How often the processor fires due schedules.
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,

    /// How often a running task re-reads its flow for cancellation.
    #[serde(default = "default_cancel_watch_interval_ms")]
    pub cancel_watch_interval_ms: u64,

    /// First retry delay; doubles per retry.
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    /// Upper bound for the retry delay.
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,

    /// Re-read/re-apply attempts after version conflicts before giving up.
    #[serde(default = "default_conflict_retry_limit")]
    pub conflict_retry_limit: u32,

    /// Attempts for a store call failing with a transient error.
    #[serde(default = "default_store_retry_limit")]
    pub store_retry_limit: u32,

    #[serde(default = "default_store_retry_delay_ms")]
    pub store_retry_delay_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_schedule_interval_secs() -> u64 {
    60
}

fn default_cancel_watch_interval_ms() -> u64 {
    500
}

fn default_retry_base_delay_secs() -> u64 {
    30
}

fn default_retry_max_delay_secs() -> u64 {
    3_600
}

fn default_conflict_retry_limit() -> u32 {
    5
}

fn default_store_retry_limit() -> u32 {
    3
}

fn default_store_retry_delay_ms() -> u64 {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            processor_identifier: None,
            owner_id: None,
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            schedule_interval_secs: default_schedule_interval_secs(),
            cancel_watch_interval_ms: default_cancel_watch_interval_ms(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
            conflict_retry_limit: default_conflict_retry_limit(),
            store_retry_limit: default_store_retry_limit(),
            store_retry_delay_ms: default_store_retry_delay_ms(),
        }
    }
}
