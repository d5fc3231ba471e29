use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Countdown phase derived from elapsed time
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum TrialPhase {
    Active,
    Warning,
    Expired,
}

/// One evaluation of the countdown
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct TrialReading {
    pub elapsed_ms: i64,
    pub remaining_ms: i64,
    pub phase: TrialPhase,
}

/// Map a stored start instant to elapsed/remaining time and phase.
///
/// Always recomputed from the absolute start, never decremented, so missed
/// ticks and suspended timers cannot drift the countdown. A start instant in
/// the future (clock rolled back) counts as zero elapsed.
pub fn evaluate(
    start_time: DateTime<Utc>,
    now: DateTime<Utc>,
    duration_ms: i64,
    warning_threshold_ms: i64,
) -> TrialReading {
    let elapsed_ms = (now - start_time).num_milliseconds().max(0);
    let remaining_ms = (duration_ms - elapsed_ms).max(0);

    let phase = if remaining_ms <= 0 {
        TrialPhase::Expired
    } else if remaining_ms <= warning_threshold_ms {
        TrialPhase::Warning
    } else {
        TrialPhase::Active
    };

    TrialReading {
        elapsed_ms,
        remaining_ms,
        phase,
    }
}

/// Wall-clock source, injectable for tests
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        if let Ok(mut now) = self.now.lock() {
            *now += Duration::milliseconds(ms);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
