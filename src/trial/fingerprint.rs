use crate::trial::config::get_platform;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Short device identifier used as the key for all trial state
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Fingerprint(s.to_string())
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Fingerprint(s)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Display characteristics, known only to the host that owns the window
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct DisplaySignals {
    pub screen_width: u32,
    pub screen_height: u32,
    pub color_depth: u32,
    pub pixel_ratio: f64,
}

impl Default for DisplaySignals {
    fn default() -> Self {
        Self {
            screen_width: 0,
            screen_height: 0,
            color_depth: 24,
            pixel_ratio: 1.0,
        }
    }
}

/// Every input the fingerprint is derived from
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
pub struct DeviceSignals {
    pub display: DisplaySignals,
    pub timezone: String,
    pub language: String,
    pub platform: String,
    pub render_signature: String,
    pub hardware_concurrency: usize,
}

impl DeviceSignals {
    /// Fixed-order canonical form fed to the hash
    fn canonical(&self) -> String {
        format!(
            "{}x{}|{}|{}|{}|{}|{}|{}|{}",
            self.display.screen_width,
            self.display.screen_height,
            self.timezone,
            self.language,
            self.platform,
            self.render_signature,
            self.hardware_concurrency,
            self.display.color_depth,
            self.display.pixel_ratio,
        )
    }
}

/// Where device signals come from
pub trait SignalSource: Send + Sync {
    fn collect(&self) -> DeviceSignals;
}

impl SignalSource for DeviceSignals {
    fn collect(&self) -> DeviceSignals {
        self.clone()
    }
}

/// Probes the running machine. Display values must be handed in by the host.
#[derive(Clone, Debug, Default)]
pub struct SystemSignals {
    display: DisplaySignals,
}

impl SystemSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_display(mut self, display: DisplaySignals) -> Self {
        self.display = display;
        self
    }
}

impl SignalSource for SystemSignals {
    fn collect(&self) -> DeviceSignals {
        DeviceSignals {
            display: self.display.clone(),
            timezone: system_timezone(),
            language: system_language(),
            platform: format!("{}-{}", get_platform(), std::env::consts::ARCH),
            render_signature: machine_signature(),
            hardware_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

fn system_timezone() -> String {
    let zone = match iana_time_zone::get_timezone() {
        Ok(zone) => Some(zone),
        Err(e) => {
            debug!(error = %e, "no IANA zone name, using the UTC offset");
            None
        }
    };
    timezone_signal(std::env::var("TZ").ok(), zone, || {
        chrono::Local::now().offset().to_string()
    })
}

/// Zone names survive DST switches, so the offset is only a last resort
fn timezone_signal(
    tz_env: Option<String>,
    zone: Option<String>,
    offset: impl FnOnce() -> String,
) -> String {
    tz_env
        .filter(|tz| !tz.is_empty())
        .or(zone.filter(|zone| !zone.is_empty()))
        .unwrap_or_else(offset)
}

fn system_language() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|v| !v.is_empty())
        .unwrap_or_default()
}

/// Hashed machine identifier, stable across reinstalls of this crate's data
#[cfg(not(any(target_os = "ios", target_os = "android")))]
fn machine_signature() -> String {
    use machineid_rs::{Encryption, HWIDComponent, IdBuilder};

    match IdBuilder::new(Encryption::SHA256)
        .add_component(HWIDComponent::SystemID)
        .build("trial-gate")
    {
        Ok(id) => id,
        Err(e) => {
            debug!(error = %e, "machine id unavailable, omitting from fingerprint");
            String::new()
        }
    }
}

#[cfg(any(target_os = "ios", target_os = "android"))]
fn machine_signature() -> String {
    String::new()
}

/// Derives fingerprints from a signal source
pub struct FingerprintGenerator {
    source: Box<dyn SignalSource>,
}

impl FingerprintGenerator {
    pub fn new(source: impl SignalSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    /// Generator over the running machine
    pub fn system() -> Self {
        Self::new(SystemSignals::new())
    }

    pub fn generate(&self) -> Fingerprint {
        let fp = fingerprint_of(&self.source.collect());
        debug!(fingerprint = %fp, "generated device fingerprint");
        fp
    }
}

/// Deterministic reduction of a signal set to a fingerprint
pub fn fingerprint_of(signals: &DeviceSignals) -> Fingerprint {
    Fingerprint(to_base36(string_hash(&signals.canonical()).unsigned_abs()))
}

/// 32-bit shift-and-add hash over UTF-16 code units
fn string_hash(input: &str) -> i32 {
    input.encode_utf16().fold(0i32, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}

fn to_base36(mut n: u32) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
