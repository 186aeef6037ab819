//! Periodic flow schedules.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::ids::{FlowTypeId, OwnerId, ScheduleId};

/// Longest accepted schedule period, ten years.
pub const MAX_FREQUENCY_IN_HOURS: u32 = 24 * 366 * 10;

/// A schedule that spawns a flow of `flow_type_id` every `frequency_in_hours`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSchedule {
    pub id: ScheduleId,
    pub code: Uuid,
    pub last_change_code: Uuid,
    pub owner_id: OwnerId,
    pub flow_type_id: FlowTypeId,
    pub frequency_in_hours: u32,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    /// Passed through to each spawned flow.
    pub param1: Option<String>,
}

impl FlowSchedule {
    /// Active and `next_run_at` has been reached.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.next_run_at <= now
    }

    /// The next fire time after firing at `now`.
    ///
    /// Fails when the frequency is out of range or the result does not fit a
    /// timestamp.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ValidationError> {
        if !(1..=MAX_FREQUENCY_IN_HOURS).contains(&self.frequency_in_hours) {
            return Err(ValidationError::InvalidFrequency);
        }
        Duration::try_hours(i64::from(self.frequency_in_hours))
            .and_then(|period| now.checked_add_signed(period))
            .ok_or(ValidationError::InvalidFrequency)
    }
}

/// Insert payload for a new schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFlowSchedule {
    pub owner_id: OwnerId,
    pub flow_type_id: FlowTypeId,
    pub frequency_in_hours: u32,
    pub is_active: bool,
    pub next_run_at: DateTime<Utc>,
    pub param1: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(next_run_at: DateTime<Utc>) -> FlowSchedule {
        FlowSchedule {
            id: ScheduleId(1),
            code: Uuid::now_v7(),
            last_change_code: Uuid::now_v7(),
            owner_id: OwnerId(1),
            flow_type_id: FlowTypeId(1),
            frequency_in_hours: 6,
            is_active: true,
            last_run_at: None,
            next_run_at,
            param1: None,
        }
    }

    #[test]
    fn due_only_when_active_and_reached() {
        let now = Utc::now();
        let mut s = schedule(now - Duration::minutes(1));
        assert!(s.is_due(now));

        s.is_active = false;
        assert!(!s.is_due(now));

        let s = schedule(now + Duration::minutes(1));
        assert!(!s.is_due(now));
    }

    #[test]
    fn next_run_adds_frequency() {
        let now = Utc::now();
        let s = schedule(now);
        assert_eq!(s.next_run_after(now), Ok(now + Duration::hours(6)));
    }

    #[test]
    fn next_run_rejects_out_of_range_frequency() {
        let now = Utc::now();
        let mut s = schedule(now);
        s.frequency_in_hours = u32::MAX;
        assert_eq!(s.next_run_after(now), Err(ValidationError::InvalidFrequency));

        s.frequency_in_hours = 0;
        assert_eq!(s.next_run_after(now), Err(ValidationError::InvalidFrequency));

        s.frequency_in_hours = MAX_FREQUENCY_IN_HOURS;
        assert!(s.next_run_after(now).is_ok());
        assert_eq!(s.next_run_after(DateTime::<Utc>::MAX_UTC), Err(ValidationError::InvalidFrequency));
    }
}
