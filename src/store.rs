//! Best-effort persistence of discovery results under the cache directory.
//!
//! Layout:
//!
//! ```text
//! cache/
//!   api_keys/<channel>_<keyhash>.json   per-key model snapshots
//!   mappings/<channel>_mapping.json     channel → key fingerprints
//!   pricing/<name>.json                 merged pricing
//!   health/<name>.json                  recent health / key results
//! ```
//!
//! Everything here is a hint: files carry a `schema_version`, readers
//! tolerate unknown fields and skip unreadable files, and deleting the whole
//! directory is always safe. Nothing on the request path blocks on disk —
//! only scheduler tasks write.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::catalog::ModelSnapshot;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedSnapshot {
    schema_version: u32,
    #[serde(flatten)]
    snapshot: ModelSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMapping {
    schema_version: u32,
    channel_id: String,
    key_fingerprints: Vec<String>,
}

pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, sub: &str) -> PathBuf {
        self.root.join(sub)
    }

    /// Write one per-key snapshot file.
    pub fn save_snapshot(&self, snapshot: &ModelSnapshot) -> anyhow::Result<PathBuf> {
        let dir = self.dir("api_keys");
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let path = dir.join(format!(
            "{}_{}.json",
            snapshot.channel_id, snapshot.key_fingerprint
        ));
        let wrapped = PersistedSnapshot { schema_version: SCHEMA_VERSION, snapshot: snapshot.clone() };
        let json = serde_json::to_string_pretty(&wrapped)?;
        fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Read every parsable snapshot back. Unreadable or unparsable files are
    /// skipped with a warning — stale cache must never block startup.
    pub fn load_snapshots(&self) -> Vec<ModelSnapshot> {
        let dir = self.dir("api_keys");
        let Ok(entries) = fs::read_dir(&dir) else { return Vec::new() };

        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<PersistedSnapshot>(&raw).ok())
            {
                Some(persisted) => snapshots.push(persisted.snapshot),
                None => {
                    tracing::warn!(path = %path.display(), "skipping unreadable snapshot file");
                }
            }
        }
        snapshots
    }

    pub fn save_mapping(&self, channel_id: &str, key_fingerprints: &[String]) -> anyhow::Result<()> {
        let dir = self.dir("mappings");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{channel_id}_mapping.json"));
        let mapping = PersistedMapping {
            schema_version: SCHEMA_VERSION,
            channel_id: channel_id.to_string(),
            key_fingerprints: key_fingerprints.to_vec(),
        };
        fs::write(&path, serde_json::to_string_pretty(&mapping)?)?;
        Ok(())
    }

    pub fn load_mapping(&self, channel_id: &str) -> Option<Vec<String>> {
        let path = self.dir("mappings").join(format!("{channel_id}_mapping.json"));
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str::<PersistedMapping>(&raw)
            .ok()
            .map(|m| m.key_fingerprints)
    }

    pub fn save_pricing(&self, name: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        self.save_named("pricing", name, value)
    }

    pub fn save_health(&self, name: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        self.save_named("health", name, value)
    }

    fn save_named(&self, sub: &str, name: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        let dir = self.dir(sub);
        fs::create_dir_all(&dir)?;
        let mut wrapped = serde_json::Map::new();
        wrapped.insert("schema_version".to_string(), serde_json::json!(SCHEMA_VERSION));
        wrapped.insert("data".to_string(), value.clone());
        let path = dir.join(format!("{name}.json"));
        fs::write(&path, serde_json::to_string_pretty(&serde_json::Value::Object(wrapped))?)?;
        Ok(())
    }

    /// Delete cache files whose mtime is older than `max_age`. Returns the
    /// number removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        let cutoff = SystemTime::now().checked_sub(max_age);
        let Some(cutoff) = cutoff else { return 0 };

        let mut removed = 0;
        for sub in ["api_keys", "mappings", "pricing", "health"] {
            removed += cleanup_dir(&self.dir(sub), cutoff);
        }
        if removed > 0 {
            tracing::info!(removed, "cache cleanup deleted stale snapshot files");
        }
        removed
    }
}

fn cleanup_dir(dir: &Path, cutoff: SystemTime) -> usize {
    let Ok(entries) = fs::read_dir(dir) else { return 0 };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);
        if stale && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{key_fingerprint, ModelInfo};
    use std::collections::HashMap;

    fn sample_snapshot() -> ModelSnapshot {
        let mut info = HashMap::new();
        info.insert("gpt-4o".to_string(), ModelInfo::inferred("gpt-4o"));
        ModelSnapshot::new("c1", &key_fingerprint("sk-test"), vec!["gpt-4o".into()])
            .with_info(info)
            .with_raw(serde_json::json!({ "object": "list" }))
    }

    // -----------------------------------------------------------------------
    // Snapshot round trip
    // -----------------------------------------------------------------------

    #[test]
    fn snapshot_saves_and_loads() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());

        let path = store.save_snapshot(&sample_snapshot()).unwrap();
        assert!(path.file_name().unwrap().to_str().unwrap().starts_with("c1_"));

        let loaded = store.load_snapshots();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].channel_id, "c1");
        assert_eq!(loaded[0].models, vec!["gpt-4o"]);
        assert!(loaded[0].info.contains_key("gpt-4o"));
    }

    #[test]
    fn file_name_contains_fingerprint_not_secret() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let path = store.save_snapshot(&sample_snapshot()).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(!name.contains("sk-test"));
        assert!(name.contains(&key_fingerprint("sk-test")));
    }

    #[test]
    fn persisted_files_carry_schema_version() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let path = store.save_snapshot(&sample_snapshot()).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(raw["schema_version"], SCHEMA_VERSION);
    }

    #[test]
    fn unknown_fields_are_tolerated_on_read() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let path = store.save_snapshot(&sample_snapshot()).unwrap();

        // A future writer added a field this reader has never heard of.
        let mut raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        raw["field_from_the_future"] = serde_json::json!({ "nested": true });
        fs::write(&path, raw.to_string()).unwrap();

        assert_eq!(store.load_snapshots().len(), 1);
    }

    #[test]
    fn corrupt_files_are_skipped() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save_snapshot(&sample_snapshot()).unwrap();
        fs::write(dir.path().join("api_keys/garbage.json"), "{not json").unwrap();

        assert_eq!(store.load_snapshots().len(), 1);
    }

    #[test]
    fn load_from_missing_directory_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("never-created"));
        assert!(store.load_snapshots().is_empty());
    }

    // -----------------------------------------------------------------------
    // Mappings and named payloads
    // -----------------------------------------------------------------------

    #[test]
    fn mapping_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        store
            .save_mapping("c1", &["aaaa0000".to_string(), "bbbb1111".to_string()])
            .unwrap();
        assert_eq!(
            store.load_mapping("c1").unwrap(),
            vec!["aaaa0000".to_string(), "bbbb1111".to_string()]
        );
        assert!(store.load_mapping("other").is_none());
    }

    #[test]
    fn pricing_and_health_files_are_versioned() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save_pricing("openrouter", &serde_json::json!({ "m": 1 })).unwrap();
        store.save_health("probe", &serde_json::json!([])).unwrap();

        let pricing: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(dir.path().join("pricing/openrouter.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(pricing["schema_version"], SCHEMA_VERSION);
        assert_eq!(pricing["data"]["m"], 1);
    }

    // -----------------------------------------------------------------------
    // Cleanup
    // -----------------------------------------------------------------------

    #[test]
    fn cleanup_removes_only_stale_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        store.save_snapshot(&sample_snapshot()).unwrap();

        // Fresh files survive a 7-day horizon.
        assert_eq!(store.cleanup_older_than(Duration::from_secs(7 * 24 * 3600)), 0);
        assert_eq!(store.load_snapshots().len(), 1);

        // A zero horizon treats everything as stale.
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.cleanup_older_than(Duration::ZERO), 1);
        assert!(store.load_snapshots().is_empty());
    }
}
