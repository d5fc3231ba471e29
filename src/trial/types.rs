use crate::trial::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A started trial, keyed by the fingerprint it was created against
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct TrialRecord {
    pub fingerprint: Fingerprint,
    pub start_time: DateTime<Utc>,
    pub session_id: Uuid,
}

impl TrialRecord {
    /// Mint a fresh record starting at `start_time`
    pub fn new(fingerprint: Fingerprint, start_time: DateTime<Utc>) -> Self {
        Self {
            fingerprint,
            start_time,
            session_id: Uuid::new_v4(),
        }
    }
}

/// Why a trial is over. Informational only; gating never branches on it.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    PreviousSession,  // Tier-2 marker from an earlier local expiry
    TimeExpired,      // Countdown reached zero
    ServerBlocked,    // Authority reported the fingerprint as spent
}

impl std::fmt::Display for ExpiryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExpiryReason::PreviousSession => "previous_session",
            ExpiryReason::TimeExpired => "time_expired",
            ExpiryReason::ServerBlocked => "server_blocked",
        };
        f.write_str(s)
    }
}

/// Current trial lifecycle status
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TrialStatus {
    #[default]
    Uninitialized,
    NotStarted,                      // Off the gated surface, or authenticated
    Active { remaining_ms: i64 },
    Warning { remaining_ms: i64 },
    Expired { reason: ExpiryReason },
}

impl TrialStatus {
    pub fn is_expired(&self) -> bool {
        matches!(self, TrialStatus::Expired { .. })
    }

    /// Remaining time, only while the countdown runs
    pub fn remaining_ms(&self) -> Option<i64> {
        match self {
            TrialStatus::Active { remaining_ms } | TrialStatus::Warning { remaining_ms } => {
                Some(*remaining_ms)
            }
            _ => None,
        }
    }

    /// Check if gated features may be used
    pub fn can_use_features(&self) -> bool {
        matches!(
            self,
            TrialStatus::Active { .. } | TrialStatus::Warning { .. } | TrialStatus::NotStarted
        )
    }
}

/// Trial state for the presentation layer (simplified view)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrialInfo {
    pub status: TrialStatus,
    pub expired: bool,
    pub time_remaining_ms: Option<i64>,
    pub fingerprint: Fingerprint,
}

impl TrialInfo {
    pub fn new(status: TrialStatus, fingerprint: &Fingerprint) -> Self {
        TrialInfo {
            status,
            expired: status.is_expired(),
            time_remaining_ms: status.remaining_ms(),
            fingerprint: fingerprint.clone(),
        }
    }
}

/// One-shot notifications for the presentation layer
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrialEvent {
    WarningEntered { remaining_ms: i64 },
    Expired { reason: ExpiryReason },
}

/// Navigation signal from the presentation layer
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct RouteContext {
    pub gated: bool,
    pub authenticated: bool,
}

impl RouteContext {
    pub fn gated_guest() -> Self {
        Self { gated: true, authenticated: false }
    }

    pub fn needs_trial(&self) -> bool {
        self.gated && !self.authenticated
    }
}

/// Error types for trial operations
#[derive(thiserror::Error, Debug)]
pub enum TrialError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for TrialError {
    fn from(e: rusqlite::Error) -> Self {
        TrialError::Storage(e.to_string())
    }
}

impl From<std::io::Error> for TrialError {
    fn from(e: std::io::Error) -> Self {
        TrialError::Storage(e.to_string())
    }
}

impl Serialize for TrialError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp() -> Fingerprint {
        Fingerprint::from("abc123")
    }

    #[test]
    fn test_info_for_active_trial() {
        let info = TrialInfo::new(TrialStatus::Active { remaining_ms: 300_000 }, &fp());
        assert!(!info.expired);
        assert_eq!(info.time_remaining_ms, Some(300_000));
    }

    #[test]
    fn test_info_for_expired_trial() {
        let status = TrialStatus::Expired { reason: ExpiryReason::ServerBlocked };
        let info = TrialInfo::new(status, &fp());
        assert!(info.expired);
        assert_eq!(info.time_remaining_ms, None);
        assert!(!status.can_use_features());
    }

    #[test]
    fn test_status_serializes_with_phase_tag() {
        let json = serde_json::to_value(TrialStatus::Expired {
            reason: ExpiryReason::PreviousSession,
        })
        .unwrap();
        assert_eq!(json["phase"], "expired");
        assert_eq!(json["reason"], "previous_session");
    }

    #[test]
    fn test_route_context() {
        assert!(RouteContext::gated_guest().needs_trial());
        assert!(!RouteContext { gated: true, authenticated: true }.needs_trial());
        assert!(!RouteContext { gated: false, authenticated: false }.needs_trial());
    }

    #[test]
    fn test_error_serializes_as_message() {
        let json = serde_json::to_string(&TrialError::Network("timeout".into())).unwrap();
        assert_eq!(json, "\"Network error: timeout\"");
    }
}
