// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dedup cache snapshot files.
//!
//! A snapshot is a JSON object mapping each dedup key to the RFC 3339 time
//! it was last processed:
//!
//! ```json
//! {"web1.example.net": "2026-01-14T09:12:44.118Z", "web2.example.net": "2026-01-14T09:13:02.5Z"}
//! ```
//!
//! Offsets other than `Z` are accepted on load and normalised to UTC.
//!
//! # Atomic Writes
//!
//! Writes go to a temp file in the target directory which is then renamed
//! over the snapshot, so a crash mid-write leaves the previous snapshot
//! intact. The blocking file work runs on the blocking thread pool.

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Dedup key → last-processed time.
pub type Entries = BTreeMap<String, DateTime<Utc>>;

/// Read a snapshot. A missing file yields `Ok(None)`.
pub async fn load(path: &Path) -> Result<Option<Entries>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ReplicationError::snapshot(path, e)),
    };

    let entries: Entries =
        serde_json::from_slice(&data).map_err(|e| ReplicationError::snapshot(path, e))?;

    debug!(path = %path.display(), bytes = data.len(), entries = entries.len(), "Read dedup snapshot");
    Ok(Some(entries))
}

/// Atomically replace the snapshot at `path` with `entries`.
///
/// Returns the number of bytes written.
pub async fn save(path: &Path, entries: &Entries) -> Result<usize> {
    let content = serde_json::to_vec(entries)?;
    let path: PathBuf = path.to_path_buf();

    let written = content.len();
    tokio::task::spawn_blocking(move || write_atomic(&path, &content))
        .await
        .map_err(|e| ReplicationError::Internal(format!("snapshot writer panicked: {}", e)))??;

    Ok(written)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix("memcache")
        .tempfile_in(dir)
        .map_err(|e| ReplicationError::snapshot(path, format!("could not create temp file: {}", e)))?;

    tmp.write_all(content)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| ReplicationError::snapshot(path, format!("could not write temp file: {}", e)))?;

    tmp.persist(path)
        .map_err(|e| ReplicationError::snapshot(path, format!("could not rename temp file: {}", e.error)))?;

    Ok(())
}

/// Drop entries last processed before `cutoff`.
///
/// Returns how many were removed.
pub fn retain_newer(entries: &mut Entries, cutoff: DateTime<Utc>) -> usize {
    let before = entries.len();
    entries.retain(|_, at| *at >= cutoff);
    before - entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let loaded = load(&dir.path().join("absent.json")).await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("link.json");

        let now = Utc::now();
        let mut entries = Entries::new();
        entries.insert("web1".to_string(), now);
        entries.insert("web2".to_string(), now - ChronoDuration::minutes(5));

        let written = save(&path, &entries).await.unwrap();
        assert!(written > 0);

        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, entries);
    }

    #[tokio::test]
    async fn test_save_replaces_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("link.json");

        let mut entries = Entries::new();
        entries.insert("old".to_string(), Utc::now());
        save(&path, &entries).await.unwrap();

        let mut replacement = Entries::new();
        replacement.insert("new".to_string(), Utc::now());
        save(&path, &replacement).await.unwrap();

        let loaded = load(&path).await.unwrap().unwrap();
        assert!(loaded.contains_key("new"));
        assert!(!loaded.contains_key("old"));

        // Only the snapshot remains; the temp file was renamed away.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_load_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("link.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = load(&path).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Snapshot { .. }));
    }

    #[tokio::test]
    async fn test_load_accepts_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("link.json");
        std::fs::write(&path, br#"{"web1": "2026-01-14T11:00:00.5+02:00"}"#).unwrap();

        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(loaded["web1"].to_rfc3339(), "2026-01-14T09:00:00.500+00:00");
    }

    #[tokio::test]
    async fn test_save_into_missing_dir_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope").join("link.json");
        let err = save(&path, &Entries::new()).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Snapshot { .. }));
    }

    #[test]
    fn test_retain_newer() {
        let now = Utc::now();
        let mut entries = Entries::new();
        entries.insert("fresh".to_string(), now);
        entries.insert("stale".to_string(), now - ChronoDuration::hours(4));

        let removed = retain_newer(&mut entries, now - ChronoDuration::hours(3));
        assert_eq!(removed, 1);
        assert!(entries.contains_key("fresh"));
    }
}
