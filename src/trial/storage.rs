use crate::trial::config::TrialConfig;
use crate::trial::fingerprint::Fingerprint;
use crate::trial::types::{TrialError, TrialRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Two-tier local persistence for trial state.
///
/// Every operation degrades instead of failing: a read that cannot be served
/// is reported as absent, a write that cannot be performed is dropped. The
/// authority tier still applies, so an unreadable store is never a fresh
/// trial by itself.
pub trait TrialStore: Send + Sync {
    /// Live record, only if it was created under this exact fingerprint
    fn read_tier1(&self, fp: &Fingerprint) -> Option<TrialRecord>;

    /// Idempotent upsert
    fn write_tier1(&self, record: &TrialRecord);

    fn clear_tier1(&self);

    /// True only for a marker younger than the lookback window
    fn read_tier2_blocked(&self, fp: &Fingerprint, now: DateTime<Utc>) -> bool;

    fn write_tier2_blocked(&self, fp: &Fingerprint, observed_at: DateTime<Utc>);
}

// ============================================================================
// Tier 1: session file
// ============================================================================

/// On-disk shape of the tier-1 entry
#[derive(Serialize, Deserialize, Debug)]
struct SessionEnvelope {
    fingerprint: Fingerprint,
    record: TrialRecord,
}

/// Low-durability JSON file, expected to live under a user-clearable cache dir
#[derive(Debug)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<Option<SessionEnvelope>, TrialError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| TrialError::Storage(format!("Failed to read trial session: {}", e)))?;

        let envelope: SessionEnvelope = serde_json::from_str(&contents)
            .map_err(|e| TrialError::Corrupt(format!("Failed to parse trial session: {}", e)))?;

        if envelope.fingerprint != envelope.record.fingerprint {
            return Err(TrialError::Corrupt(
                "session fingerprint does not match its record".to_string(),
            ));
        }

        Ok(Some(envelope))
    }

    fn save(&self, record: &TrialRecord) -> Result<(), TrialError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TrialError::Storage(format!("Failed to create session dir: {}", e)))?;
        }

        let envelope = SessionEnvelope {
            fingerprint: record.fingerprint.clone(),
            record: record.clone(),
        };
        let json = serde_json::to_string_pretty(&envelope)
            .map_err(|e| TrialError::Storage(format!("Failed to serialize trial session: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| TrialError::Storage(format!("Failed to write trial session: {}", e)))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| TrialError::Storage(format!("Failed to replace trial session: {}", e)))?;

        Ok(())
    }

    fn remove(&self) -> Result<(), TrialError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .map_err(|e| TrialError::Storage(format!("Failed to delete trial session: {}", e)))?;
        }
        Ok(())
    }

    pub fn read(&self, fp: &Fingerprint) -> Option<TrialRecord> {
        match self.load() {
            Ok(Some(envelope)) if &envelope.fingerprint == fp => Some(envelope.record),
            Ok(Some(envelope)) => {
                debug!(
                    stored = %envelope.fingerprint,
                    fingerprint = %fp,
                    "tier-1 record belongs to another fingerprint"
                );
                None
            }
            Ok(None) => None,
            Err(e @ TrialError::Corrupt(_)) => {
                warn!(error = %e, "discarding corrupt tier-1 record");
                if let Err(e) = self.remove() {
                    warn!(error = %e, "could not delete corrupt tier-1 record");
                }
                None
            }
            Err(e) => {
                warn!(error = %e, "tier-1 read failed, treating as absent");
                None
            }
        }
    }

    pub fn write(&self, record: &TrialRecord) {
        if let Err(e) = self.save(record) {
            warn!(error = %e, fingerprint = %record.fingerprint, "tier-1 write dropped");
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.remove() {
            warn!(error = %e, "tier-1 clear failed");
        }
    }
}

// ============================================================================
// Tier 2: expiry block list
// ============================================================================

/// Durable SQLite block list of fingerprints observed to expire locally.
///
/// The connection is opened lazily and re-attempted on the next operation
/// after a failure, so a briefly unavailable data dir only costs one read.
#[derive(Debug)]
pub struct BlockList {
    path: PathBuf,
    lookback_ms: i64,
    conn: Mutex<Option<Connection>>,
}

impl BlockList {
    pub fn new(path: impl Into<PathBuf>, lookback_ms: i64) -> Self {
        Self {
            path: path.into(),
            lookback_ms,
            conn: Mutex::new(None),
        }
    }

    fn open(path: &Path) -> Result<Connection, TrialError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| TrialError::Storage(format!("Failed to open block list: {}", e)))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS expired_trials (
                fingerprint TEXT PRIMARY KEY,
                timestamp_ms INTEGER NOT NULL,
                expired INTEGER NOT NULL CHECK (expired IN (0, 1))
            )",
            [],
        )?;
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, TrialError>,
    ) -> Result<T, TrialError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| TrialError::Storage(format!("block list lock poisoned: {}", e)))?;
        if guard.is_none() {
            *guard = Some(Self::open(&self.path)?);
        }
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(TrialError::Storage("block list unavailable".to_string())),
        }
    }

    fn lookup(&self, fp: &Fingerprint, now_ms: i64) -> Result<bool, TrialError> {
        let lookback_ms = self.lookback_ms;
        self.with_conn(|conn| {
            let row: Option<(i64, bool)> = conn
                .query_row(
                    "SELECT timestamp_ms, expired FROM expired_trials WHERE fingerprint = ?1",
                    params![fp.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((timestamp_ms, expired)) if now_ms - timestamp_ms > lookback_ms => {
                    debug!(fingerprint = %fp, expired, "pruning stale tier-2 marker");
                    conn.execute(
                        "DELETE FROM expired_trials WHERE fingerprint = ?1",
                        params![fp.as_str()],
                    )?;
                    Ok(false)
                }
                Some((_, expired)) => Ok(expired),
                None => Ok(false),
            }
        })
    }

    fn record(&self, fp: &Fingerprint, observed_ms: i64) -> Result<(), TrialError> {
        let lookback_ms = self.lookback_ms;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO expired_trials (fingerprint, timestamp_ms, expired)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                    timestamp_ms = MAX(timestamp_ms, excluded.timestamp_ms),
                    expired = 1",
                params![fp.as_str(), observed_ms],
            )?;
            conn.execute(
                "DELETE FROM expired_trials WHERE ?1 - timestamp_ms > ?2",
                params![observed_ms, lookback_ms],
            )?;
            Ok(())
        })
    }

    pub fn is_blocked(&self, fp: &Fingerprint, now: DateTime<Utc>) -> bool {
        match self.lookup(fp, now.timestamp_millis()) {
            Ok(blocked) => blocked,
            Err(e) => {
                warn!(error = %e, fingerprint = %fp, "tier-2 read failed, treating as absent");
                self.reset_conn();
                false
            }
        }
    }

    pub fn block(&self, fp: &Fingerprint, observed_at: DateTime<Utc>) {
        if let Err(e) = self.record(fp, observed_at.timestamp_millis()) {
            warn!(error = %e, fingerprint = %fp, "tier-2 write dropped");
            self.reset_conn();
        }
    }

    /// Force a reopen on the next operation
    fn reset_conn(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            *guard = None;
        }
    }
}

// ============================================================================
// Composite store
// ============================================================================

/// Session file for tier 1, SQLite block list for tier 2
#[derive(Debug)]
pub struct LocalTrialStore {
    tier1: SessionFile,
    tier2: BlockList,
}

impl LocalTrialStore {
    pub fn new(tier1: SessionFile, tier2: BlockList) -> Self {
        Self { tier1, tier2 }
    }

    pub fn from_config(config: &TrialConfig) -> Self {
        Self::new(
            SessionFile::new(&config.tier1_path),
            BlockList::new(&config.tier2_path, config.tier2_lookback_ms),
        )
    }
}

impl TrialStore for LocalTrialStore {
    fn read_tier1(&self, fp: &Fingerprint) -> Option<TrialRecord> {
        self.tier1.read(fp)
    }

    fn write_tier1(&self, record: &TrialRecord) {
        self.tier1.write(record)
    }

    fn clear_tier1(&self) {
        self.tier1.clear()
    }

    fn read_tier2_blocked(&self, fp: &Fingerprint, now: DateTime<Utc>) -> bool {
        self.tier2.is_blocked(fp, now)
    }

    fn write_tier2_blocked(&self, fp: &Fingerprint, observed_at: DateTime<Utc>) {
        self.tier2.block(fp, observed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trial::config::TIER2_LOOKBACK_MS;
    use chrono::Duration;
    use tempfile::tempdir;

    fn store(dir: &Path) -> LocalTrialStore {
        LocalTrialStore::from_config(&TrialConfig::default().with_data_dir(dir))
    }

    #[test]
    fn test_tier1_roundtrip_for_same_fingerprint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fp = Fingerprint::from("f1");
        let record = TrialRecord::new(fp.clone(), Utc::now());

        assert!(store.read_tier1(&fp).is_none());
        store.write_tier1(&record);
        assert_eq!(store.read_tier1(&fp), Some(record.clone()));

        // Idempotent
        store.write_tier1(&record);
        assert_eq!(store.read_tier1(&fp), Some(record));
    }

    #[test]
    fn test_tier1_ignores_other_fingerprint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.write_tier1(&TrialRecord::new(Fingerprint::from("f1"), Utc::now()));

        assert!(store.read_tier1(&Fingerprint::from("f2")).is_none());
        // Still there for its owner
        assert!(store.read_tier1(&Fingerprint::from("f1")).is_some());
    }

    #[test]
    fn test_corrupt_tier1_is_discarded() {
        let dir = tempdir().unwrap();
        let config = TrialConfig::default().with_data_dir(dir.path());
        let store = LocalTrialStore::from_config(&config);
        std::fs::write(&config.tier1_path, "{not json").unwrap();

        assert!(store.read_tier1(&Fingerprint::from("f1")).is_none());
        assert!(!config.tier1_path.exists());
    }

    #[test]
    fn test_mismatched_envelope_is_discarded() {
        let dir = tempdir().unwrap();
        let config = TrialConfig::default().with_data_dir(dir.path());
        let store = LocalTrialStore::from_config(&config);
        let record = TrialRecord::new(Fingerprint::from("f2"), Utc::now());
        let tampered = serde_json::json!({ "fingerprint": "f1", "record": record });
        std::fs::write(&config.tier1_path, tampered.to_string()).unwrap();

        assert!(store.read_tier1(&Fingerprint::from("f1")).is_none());
        assert!(!config.tier1_path.exists());
    }

    #[test]
    fn test_clear_tier1_keeps_tier2() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fp = Fingerprint::from("f1");
        let now = Utc::now();
        store.write_tier1(&TrialRecord::new(fp.clone(), now));
        store.write_tier2_blocked(&fp, now);

        store.clear_tier1();
        assert!(store.read_tier1(&fp).is_none());
        assert!(store.read_tier2_blocked(&fp, now));
    }

    #[test]
    fn test_tier2_block_within_window() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fp = Fingerprint::from("f1");
        let observed = Utc::now();

        assert!(!store.read_tier2_blocked(&fp, observed));
        store.write_tier2_blocked(&fp, observed);
        assert!(store.read_tier2_blocked(&fp, observed + Duration::hours(23)));
        assert!(store.read_tier2_blocked(
            &fp,
            observed + Duration::milliseconds(TIER2_LOOKBACK_MS)
        ));
        assert!(!store.read_tier2_blocked(&Fingerprint::from("f2"), observed));
    }

    #[test]
    fn test_tier2_stale_marker_is_pruned() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fp = Fingerprint::from("f1");
        let observed = Utc::now();
        store.write_tier2_blocked(&fp, observed);

        let later = observed + Duration::milliseconds(TIER2_LOOKBACK_MS + 1);
        assert!(!store.read_tier2_blocked(&fp, later));
        // Gone for good, even when asked about the original instant
        assert!(!store.read_tier2_blocked(&fp, observed));
    }

    #[test]
    fn test_tier2_survives_reopen() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::from("f1");
        let now = Utc::now();
        store(dir.path()).write_tier2_blocked(&fp, now);

        assert!(store(dir.path()).read_tier2_blocked(&fp, now));
    }

    #[test]
    fn test_tier2_keeps_latest_observation() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let fp = Fingerprint::from("f1");
        let first = Utc::now();
        let second = first + Duration::hours(20);
        store.write_tier2_blocked(&fp, second);
        store.write_tier2_blocked(&fp, first);

        // Window runs from the later observation
        assert!(store.read_tier2_blocked(&fp, second + Duration::hours(10)));
    }

    #[test]
    fn test_unwritable_storage_degrades_to_absent() {
        let dir = tempdir().unwrap();
        // Parent "directory" is a regular file, so nothing can be created below it
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let store = store(&blocker);
        let fp = Fingerprint::from("f1");
        let now = Utc::now();

        store.write_tier1(&TrialRecord::new(fp.clone(), now));
        store.write_tier2_blocked(&fp, now);
        assert!(store.read_tier1(&fp).is_none());
        assert!(!store.read_tier2_blocked(&fp, now));
    }
}
