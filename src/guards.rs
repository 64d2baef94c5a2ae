//! Guard persistence
//!
//! The guard set is small and long-lived: reusing the same entry relay
//! across circuits bounds how much of our traffic a sampling adversary
//! can observe. The set is persisted as JSON in the data directory and
//! survives restarts; entries expire after sixty days.
//!
//! File layout (`guard_state.json`): a JSON array of
//! `{fingerprint, identity_key, address, first_seen, last_confirmed,
//! confirmed}` with RFC3339 timestamps. Writes go to a temp file and are
//! renamed into place; stale temp files are cleaned up at startup.

use crate::error::{Result, TorError};
use crate::protocol::relay::Relay;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, SystemTime};

/// Maximum entries retained in the guard set.
pub const MAX_GUARDS: usize = 3;

/// Entries older than this are purged at load time.
pub const GUARD_EXPIRY: Duration = Duration::from_secs(60 * 24 * 60 * 60);

/// Guard state file name inside the data directory.
pub const GUARD_STATE_FILE: &str = "guard_state.json";

/// One persistent guard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardEntry {
    /// 40-hex identity fingerprint
    pub fingerprint: String,

    /// Ed25519 identity key, base64 (empty when the descriptor lacked one)
    pub identity_key: String,

    /// "ip:orport"
    pub address: String,

    /// RFC3339 time this guard entered the set
    pub first_seen: String,

    /// RFC3339 time of the last confirmed circuit through this guard
    pub last_confirmed: String,

    /// Whether a circuit has ever completed through this guard
    pub confirmed: bool,
}

impl GuardEntry {
    fn from_relay(relay: &Relay, now: SystemTime) -> Self {
        let stamp = humantime::format_rfc3339_seconds(now).to_string();
        Self {
            fingerprint: relay.fingerprint.clone(),
            identity_key: relay
                .identity_ed25519
                .map(|k| STANDARD.encode(k))
                .unwrap_or_default(),
            address: format!("{}:{}", relay.address, relay.or_port),
            first_seen: stamp.clone(),
            last_confirmed: stamp,
            confirmed: false,
        }
    }

    /// Newest of first-seen and last-confirmed, for expiry.
    fn freshness(&self) -> Option<SystemTime> {
        let first = humantime::parse_rfc3339(&self.first_seen).ok();
        let confirmed = humantime::parse_rfc3339(&self.last_confirmed).ok();
        match (first, confirmed) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        match self.freshness() {
            Some(t) => now
                .duration_since(t)
                .map(|age| age > GUARD_EXPIRY)
                .unwrap_or(false),
            // Unparseable timestamps mean a damaged file; drop the entry.
            None => true,
        }
    }
}

/// Component-owned persistent guard store.
pub struct GuardStore {
    path: PathBuf,
    inner: StdMutex<Vec<GuardEntry>>,
}

impl GuardStore {
    /// Load the guard set from `data_dir`, purging expired entries and
    /// leftover temp files.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| TorError::Storage(format!("create {}: {}", data_dir.display(), e)))?;

        remove_stale_temps(data_dir).await;

        let path = data_dir.join(GUARD_STATE_FILE);
        let mut entries: Vec<GuardEntry> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| TorError::Storage(format!("parse {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(TorError::Storage(format!(
                    "read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let now = SystemTime::now();
        let before = entries.len();
        entries.retain(|g| !g.is_expired(now));
        if entries.len() < before {
            log::info!("purged {} expired guard entries", before - entries.len());
        }
        entries.truncate(MAX_GUARDS);

        log::info!("loaded {} persistent guards", entries.len());
        Ok(Self {
            path,
            inner: StdMutex::new(entries),
        })
    }

    /// The guard to try first: confirmed guards in set order, then the
    /// rest.
    pub fn preferred(&self) -> Option<GuardEntry> {
        let entries = self.inner.lock().expect("guard lock poisoned");
        entries
            .iter()
            .find(|g| g.confirmed)
            .or_else(|| entries.first())
            .cloned()
    }

    /// All current entries, in preference order.
    pub fn entries(&self) -> Vec<GuardEntry> {
        self.inner.lock().expect("guard lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("guard lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that `relay` was used as a guard. Returns true when the set
    /// changed (the caller should save). At capacity, an unconfirmed
    /// entry is evicted before a confirmed one is touched.
    pub fn note_guard(&self, relay: &Relay) -> bool {
        let mut entries = self.inner.lock().expect("guard lock poisoned");
        if entries.iter().any(|g| g.fingerprint == relay.fingerprint) {
            return false;
        }

        if entries.len() >= MAX_GUARDS {
            // The oldest unconfirmed entry is the one displaced.
            if let Some(pos) = entries.iter().position(|g| !g.confirmed) {
                let evicted = entries.remove(pos);
                log::info!("evicting unconfirmed guard {}", evicted.fingerprint);
            } else {
                // All confirmed; keep the existing set.
                return false;
            }
        }

        entries.push(GuardEntry::from_relay(relay, SystemTime::now()));
        true
    }

    /// Mark a guard confirmed after a completed circuit. Returns true on
    /// the first confirmation (the caller persists on that transition).
    pub fn confirm(&self, fingerprint: &str) -> bool {
        let mut entries = self.inner.lock().expect("guard lock poisoned");
        if let Some(entry) = entries
            .iter_mut()
            .find(|g| g.fingerprint.eq_ignore_ascii_case(fingerprint))
        {
            entry.last_confirmed =
                humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
            if !entry.confirmed {
                entry.confirmed = true;
                return true;
            }
        }
        false
    }

    /// Persist the set: serialize a snapshot under the lock, then write
    /// to a temp file and atomically rename, both outside the lock.
    pub async fn save(&self) -> Result<()> {
        let snapshot = {
            let entries = self.inner.lock().expect("guard lock poisoned");
            serde_json::to_vec_pretty(&*entries)
                .map_err(|e| TorError::Storage(format!("serialize guards: {}", e)))?
        };

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &snapshot)
            .await
            .map_err(|e| TorError::Storage(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| TorError::Storage(format!("rename {}: {}", tmp.display(), e)))?;

        log::debug!("saved {} guards", self.len());
        Ok(())
    }
}

/// Remove temp files left behind by an interrupted save.
async fn remove_stale_temps(data_dir: &Path) {
    let Ok(mut dir) = tokio::fs::read_dir(data_dir).await else {
        return;
    };
    while let Ok(Some(entry)) = dir.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".tmp") {
            log::debug!("removing stale temp file {}", name);
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::relay::RelayFlags;

    fn relay(tag: u8) -> Relay {
        Relay {
            nickname: format!("guard{}", tag),
            fingerprint: hex::encode_upper([tag; 20]),
            address: "10.0.0.1".parse().unwrap(),
            or_port: 9001,
            dir_port: None,
            flags: RelayFlags::from_string("Guard Running Stable Valid"),
            published: 0,
            identity_ed25519: Some([tag; 32]),
            ntor_onion_key: Some([tag; 32]),
            bandwidth: 1000,
            exit_policy: None,
        }
    }

    #[tokio::test]
    async fn test_set_respects_max_guards() {
        let dir = tempfile::tempdir().unwrap();
        let store = GuardStore::load(dir.path()).await.unwrap();

        for tag in 1..=4 {
            store.note_guard(&relay(tag));
        }
        assert_eq!(store.len(), MAX_GUARDS);

        // The newest addition displaced the oldest unconfirmed entry.
        let entries = store.entries();
        assert!(entries
            .iter()
            .any(|g| g.fingerprint == relay(4).fingerprint));
        assert!(!entries
            .iter()
            .any(|g| g.fingerprint == relay(1).fingerprint));
    }

    #[tokio::test]
    async fn test_confirmed_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = GuardStore::load(dir.path()).await.unwrap();
            store.note_guard(&relay(1));
            store.note_guard(&relay(2));
            assert!(store.confirm(&relay(1).fingerprint));
            store.save().await.unwrap();
        }

        let store = GuardStore::load(dir.path()).await.unwrap();
        assert_eq!(store.len(), 2);
        let entries = store.entries();
        let first = entries
            .iter()
            .find(|g| g.fingerprint == relay(1).fingerprint)
            .unwrap();
        assert!(first.confirmed);
        assert_eq!(store.preferred().unwrap().fingerprint, first.fingerprint);
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = GuardStore::load(dir.path()).await.unwrap();
        store.note_guard(&relay(1));
        store.note_guard(&relay(2));
        store.save().await.unwrap();

        let path = dir.path().join(GUARD_STATE_FILE);
        let first = tokio::fs::read(&path).await.unwrap();

        // load -> save must reproduce the file byte for byte
        let reloaded = GuardStore::load(dir.path()).await.unwrap();
        reloaded.save().await.unwrap();
        let second = tokio::fs::read(&path).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_expired_entries_purged() {
        let dir = tempfile::tempdir().unwrap();
        let old = GuardEntry {
            fingerprint: hex::encode_upper([9u8; 20]),
            identity_key: String::new(),
            address: "10.0.0.9:9001".into(),
            first_seen: "2020-01-01T00:00:00Z".into(),
            last_confirmed: "2020-01-01T00:00:00Z".into(),
            confirmed: true,
        };
        let path = dir.path().join(GUARD_STATE_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(&vec![old]).unwrap())
            .await
            .unwrap();

        let store = GuardStore::load(dir.path()).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stale_temp_removed_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("guard_state.json.tmp");
        tokio::fs::write(&tmp, b"partial").await.unwrap();

        let _store = GuardStore::load(dir.path()).await.unwrap();
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn test_duplicate_note_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = GuardStore::load(dir.path()).await.unwrap();
        assert!(store.note_guard(&relay(1)));
        assert!(!store.note_guard(&relay(1)));
        assert_eq!(store.len(), 1);
    }
}
