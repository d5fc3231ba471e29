use serde::Deserialize;
use std::path::PathBuf;

/// Trial authority service URL
pub const AUTHORITY_URL: &str = "http://127.0.0.1:8000";

/// Trial configuration
pub const TRIAL_DURATION_MS: i64 = 300_000;
pub const WARNING_THRESHOLD_MS: i64 = 60_000;

/// Timer cadence
pub const TICK_INTERVAL_MS: u64 = 1_000;
pub const RECONCILE_INTERVAL_MS: u64 = 30_000;

/// How long a tier-2 expiry marker keeps a fingerprint spent
pub const TIER2_LOOKBACK_MS: i64 = 86_400_000;

/// Authority request limits
pub const REQUEST_TIMEOUT_SECS: u64 = 10;
pub const USER_AGENT_MAX_CHARS: usize = 100;

/// Local storage locations
pub const STORAGE_DIR_NAME: &str = "trial-gate";
pub const TIER1_FILE: &str = "trial-session.json";
pub const TIER2_FILE: &str = "trial-blocklist.sqlite3";

/// API endpoints
pub mod endpoints {
    pub fn check_trial(base: &str) -> String {
        format!("{}/check_trial", base.trim_end_matches('/'))
    }

    pub fn start_trial(base: &str) -> String {
        format!("{}/start_trial", base.trim_end_matches('/'))
    }
}

/// Runtime configuration for the trial subsystem.
///
/// Defaults carry the contract constants above. Hosts can deserialize a
/// partial document (missing fields fall back to defaults) or layer
/// `TRIAL_GATE_*` environment variables on top via [`TrialConfig::from_env`].
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct TrialConfig {
    pub authority_url: String,
    pub trial_duration_ms: i64,
    pub warning_threshold_ms: i64,
    pub tick_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    pub tier2_lookback_ms: i64,
    pub request_timeout_secs: u64,
    pub tier1_path: PathBuf,
    pub tier2_path: PathBuf,
    pub user_agent: String,
}

impl Default for TrialConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(STORAGE_DIR_NAME);
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(STORAGE_DIR_NAME);

        Self {
            authority_url: AUTHORITY_URL.to_string(),
            trial_duration_ms: TRIAL_DURATION_MS,
            warning_threshold_ms: WARNING_THRESHOLD_MS,
            tick_interval_ms: TICK_INTERVAL_MS,
            reconcile_interval_ms: RECONCILE_INTERVAL_MS,
            tier2_lookback_ms: TIER2_LOOKBACK_MS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            tier1_path: cache_dir.join(TIER1_FILE),
            tier2_path: data_dir.join(TIER2_FILE),
            user_agent: default_user_agent(),
        }
    }
}

impl TrialConfig {
    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Keep both tiers under one directory (tests, portable installs).
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.tier1_path = dir.join(TIER1_FILE);
        self.tier2_path = dir.join(TIER2_FILE);
        self
    }

    pub fn with_authority_url(mut self, url: impl Into<String>) -> Self {
        self.authority_url = url.into();
        self
    }

    /// Only variables that are set, non-empty and parseable override.
    fn apply_env_overrides(&mut self) {
        if let Ok(s) = std::env::var("TRIAL_GATE_AUTHORITY_URL") {
            if !s.is_empty() {
                self.authority_url = s;
            }
        }
        if let Ok(s) = std::env::var("TRIAL_GATE_DATA_DIR") {
            if !s.is_empty() {
                let dir = PathBuf::from(s);
                self.tier1_path = dir.join(TIER1_FILE);
                self.tier2_path = dir.join(TIER2_FILE);
            }
        }
        if let Some(v) = env_parse::<i64>("TRIAL_GATE_DURATION_MS") {
            self.trial_duration_ms = v;
        }
        if let Some(v) = env_parse::<i64>("TRIAL_GATE_WARNING_MS") {
            self.warning_threshold_ms = v;
        }
        if let Some(v) = env_parse::<u64>("TRIAL_GATE_RECONCILE_MS") {
            self.reconcile_interval_ms = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn default_user_agent() -> String {
    format!(
        "{}/{} ({}; {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        get_platform(),
        std::env::consts::ARCH
    )
}

/// Get current platform string
pub fn get_platform() -> &'static str {
    #[cfg(target_os = "windows")]
    return "windows";

    #[cfg(target_os = "macos")]
    return "macos";

    #[cfg(target_os = "linux")]
    return "linux";

    #[cfg(target_os = "ios")]
    return "ios";

    #[cfg(target_os = "android")]
    return "android";

    #[cfg(not(any(
        target_os = "windows",
        target_os = "macos",
        target_os = "linux",
        target_os = "ios",
        target_os = "android"
    )))]
    return "unknown";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = TrialConfig::default();
        assert_eq!(config.trial_duration_ms, 300_000);
        assert_eq!(config.warning_threshold_ms, 60_000);
        assert_eq!(config.reconcile_interval_ms, 30_000);
        assert_eq!(config.tier2_lookback_ms, 86_400_000);
        assert!(config.tier1_path.ends_with(TIER1_FILE));
        assert!(config.tier2_path.ends_with(TIER2_FILE));
    }

    #[test]
    fn test_partial_document_falls_back_to_defaults() {
        let config: TrialConfig =
            serde_json::from_str(r#"{ "authority_url": "http://localhost:9000" }"#).unwrap();
        assert_eq!(config.authority_url, "http://localhost:9000");
        assert_eq!(config.trial_duration_ms, TRIAL_DURATION_MS);
    }

    #[test]
    fn test_endpoints_strip_trailing_slash() {
        assert_eq!(endpoints::check_trial("http://a/"), "http://a/check_trial");
        assert_eq!(endpoints::start_trial("http://a"), "http://a/start_trial");
    }

    #[test]
    fn test_with_data_dir_moves_both_tiers() {
        let config = TrialConfig::default().with_data_dir("/tmp/tg");
        assert_eq!(config.tier1_path, PathBuf::from("/tmp/tg").join(TIER1_FILE));
        assert_eq!(config.tier2_path, PathBuf::from("/tmp/tg").join(TIER2_FILE));
    }
}
