//! On-disk restore reconciliation
//!
//! On profile open the catalog is brought back in line with whatever is
//! actually on disk: finished files, resumable partials, or nothing.
//! `Ignored` entries are protected by snapshotting their names before the
//! scan and re-applying them after, so disk-first logic can never flip
//! them to Completed.

use std::path::Path;
use tracing::{info, warn};

use crate::catalog::models::{Media, MediaStatus};
use crate::catalog::store::ProfileStore;
use crate::utils::hash::verify_cdn_hash;

/// Counts reported after a restore pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub total: usize,
    pub completed: usize,
    pub paused: usize,
    pub missing: usize,
    pub incomplete: usize,
    pub ignored: usize,
}

/// Reconciles catalog entries with the files under a profile directory.
pub struct RestoreScanner {
    /// When set, finished files are SHA-256-verified against the digest
    /// embedded in their CDN path; mismatches become `Incomplete`.
    strict: bool,
}

impl RestoreScanner {
    pub fn new() -> Self {
        Self { strict: false }
    }

    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Run the scan against `store`, with files rooted at `profile_dir`.
    pub async fn run(&self, store: &ProfileStore, profile_dir: &Path) -> RestoreSummary {
        let ignored_before: Vec<String> = store.with_catalog(|c| c.ignored_names()).await;

        let medias: Vec<Media> = store.with_catalog(|c| c.medias.clone()).await;
        let mut summary = RestoreSummary {
            total: medias.len(),
            ..Default::default()
        };

        for media in &medias {
            if media.name.is_empty() {
                warn!("catalog entry without a name, skipping");
                continue;
            }

            let final_path = media.final_path(profile_dir);
            let tmp_path = final_path.with_extension(tmp_extension(&final_path));

            let update = if tmp_path.exists() && !final_path.exists() {
                summary.paused += 1;
                self.from_partial(&tmp_path)
            } else if final_path.exists() {
                let outcome = self.from_final(media, &final_path).await;
                match outcome.status {
                    MediaStatus::Completed => summary.completed += 1,
                    MediaStatus::Incomplete => summary.incomplete += 1,
                    _ => summary.missing += 1,
                }
                outcome
            } else {
                summary.missing += 1;
                DiskState {
                    status: MediaStatus::Missing,
                    local_size: 0,
                    size_http: None,
                    percent: Some(0),
                    hash_check: String::new(),
                }
            };

            let _ = store
                .update_media(&media.name, |m| {
                    m.status = update.status;
                    m.local_size = update.local_size;
                    if let Some(size_http) = update.size_http {
                        if size_http > m.size_http {
                            m.size_http = size_http;
                        }
                    }
                    m.percent = match update.percent {
                        Some(p) => p,
                        None => Media::percent_of(update.local_size, m.size_http),
                    };
                    m.hash_check = update.hash_check.clone();
                    m.speed = None;
                })
                .await;
        }

        // Anything still mid-flight from a previous run resumes as Paused.
        store.normalize_transient().await;

        // Re-apply stickiness last: an Ignored entry stays Ignored no
        // matter what the disk said.
        store
            .with_catalog(|catalog| {
                for name in &ignored_before {
                    if let Some(m) = catalog.get_mut(name) {
                        m.status = MediaStatus::Ignored;
                        m.local_size = 0;
                        m.percent = 0;
                        m.speed = None;
                        m.error.clear();
                    }
                }
            })
            .await;
        summary.ignored = ignored_before.len();

        info!(
            total = summary.total,
            completed = summary.completed,
            paused = summary.paused,
            missing = summary.missing,
            incomplete = summary.incomplete,
            ignored = summary.ignored,
            "restore scan finished"
        );

        summary
    }

    fn from_partial(&self, tmp_path: &Path) -> DiskState {
        let size = std::fs::metadata(tmp_path).map(|m| m.len()).unwrap_or(0);
        DiskState {
            status: MediaStatus::Paused,
            local_size: size,
            size_http: None,
            percent: None,
            hash_check: String::new(),
        }
    }

    async fn from_final(&self, media: &Media, final_path: &Path) -> DiskState {
        let size = std::fs::metadata(final_path).map(|m| m.len()).unwrap_or(0);

        if size == 0 {
            return DiskState {
                status: MediaStatus::Missing,
                local_size: 0,
                size_http: None,
                percent: Some(0),
                hash_check: String::new(),
            };
        }

        if self.strict {
            match verify_cdn_hash(final_path, &media.cdn_path).await {
                Ok(Ok(())) => {}
                Ok(Err(actual)) => {
                    warn!(name = %media.name, "hash mismatch on restore");
                    return DiskState {
                        status: MediaStatus::Incomplete,
                        local_size: size,
                        size_http: None,
                        percent: Some(0),
                        hash_check: actual,
                    };
                }
                Err(e) => {
                    warn!(name = %media.name, error = %e, "hash verification failed on restore");
                    return DiskState {
                        status: MediaStatus::Incomplete,
                        local_size: size,
                        size_http: None,
                        percent: Some(0),
                        hash_check: String::new(),
                    };
                }
            }
        }

        DiskState {
            status: MediaStatus::Completed,
            local_size: size,
            size_http: Some(size),
            percent: Some(100),
            hash_check: String::new(),
        }
    }
}

impl Default for RestoreScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// What the disk said about one media.
struct DiskState {
    status: MediaStatus,
    local_size: u64,
    size_http: Option<u64>,
    /// `None` means recompute from `local_size / size_http`
    percent: Option<u8>,
    hash_check: String,
}

/// `.tmp` sibling extension preserving the original extension
/// (`foo.mp4` -> `foo.mp4.tmp`).
fn tmp_extension(final_path: &Path) -> String {
    match final_path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.tmp", ext),
        None => "tmp".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::ProfileKey;
    use crate::events::EventBus;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn store_with(medias: Vec<Media>) -> (Arc<ProfileStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = ProfileStore::open(
            temp_dir.path(),
            ProfileKey::new("onlyfans", "valentina"),
            EventBus::new(),
        )
        .await
        .unwrap();
        for media in medias {
            store.upsert(media).await;
        }
        (store, temp_dir)
    }

    fn profile_dir(temp_dir: &TempDir) -> std::path::PathBuf {
        temp_dir.path().join("downloads").join("onlyfans").join("valentina")
    }

    #[tokio::test]
    async fn test_final_file_becomes_completed() {
        let media = Media::new("1", "a.mp4", "/data/x/a.mp4");
        let (store, temp_dir) = store_with(vec![media]).await;

        let dir = profile_dir(&temp_dir);
        std::fs::create_dir_all(dir.join("v")).unwrap();
        std::fs::write(dir.join("v").join("a.mp4"), vec![0u8; 2048]).unwrap();

        let summary = RestoreScanner::new().run(&store, &dir).await;
        assert_eq!(summary.completed, 1);

        let snapshot = store.snapshot().await;
        let m = snapshot.get("a.mp4").unwrap();
        assert_eq!(m.status, MediaStatus::Completed);
        assert_eq!(m.local_size, 2048);
        assert_eq!(m.percent, 100);
    }

    #[tokio::test]
    async fn test_partial_becomes_paused_with_recomputed_percent() {
        let mut media = Media::new("1", "a.mp4", "/data/x/a.mp4");
        media.size_http = 4096;
        let (store, temp_dir) = store_with(vec![media]).await;

        let dir = profile_dir(&temp_dir);
        std::fs::create_dir_all(dir.join("v")).unwrap();
        std::fs::write(dir.join("v").join("a.mp4.tmp"), vec![0u8; 1024]).unwrap();

        let summary = RestoreScanner::new().run(&store, &dir).await;
        assert_eq!(summary.paused, 1);

        let snapshot = store.snapshot().await;
        let m = snapshot.get("a.mp4").unwrap();
        assert_eq!(m.status, MediaStatus::Paused);
        assert_eq!(m.local_size, 1024);
        assert_eq!(m.percent, 25);
    }

    #[tokio::test]
    async fn test_nothing_on_disk_becomes_missing() {
        let mut media = Media::new("1", "a.mp4", "/data/x/a.mp4");
        media.status = MediaStatus::Completed;
        media.local_size = 999;
        media.percent = 100;
        let (store, temp_dir) = store_with(vec![media]).await;

        let dir = profile_dir(&temp_dir);
        std::fs::create_dir_all(&dir).unwrap();

        RestoreScanner::new().run(&store, &dir).await;

        let snapshot = store.snapshot().await;
        let m = snapshot.get("a.mp4").unwrap();
        assert_eq!(m.status, MediaStatus::Missing);
        assert_eq!(m.local_size, 0);
        assert_eq!(m.percent, 0);
    }

    #[tokio::test]
    async fn test_ignored_survives_restore_cycles() {
        let mut media = Media::new("1", "a.mp4", "/data/x/a.mp4");
        media.status = MediaStatus::Ignored;
        let (store, temp_dir) = store_with(vec![media]).await;

        let dir = profile_dir(&temp_dir);
        // even with a finished file on disk the entry stays Ignored
        std::fs::create_dir_all(dir.join("v")).unwrap();
        std::fs::write(dir.join("v").join("a.mp4"), vec![0u8; 100]).unwrap();

        for _ in 0..3 {
            RestoreScanner::new().run(&store, &dir).await;
            let snapshot = store.snapshot().await;
            let m = snapshot.get("a.mp4").unwrap();
            assert_eq!(m.status, MediaStatus::Ignored);
            assert_eq!(m.local_size, 0);
            assert_eq!(m.percent, 0);
        }
    }

    #[tokio::test]
    async fn test_transient_statuses_normalize_to_paused() {
        let mut downloading = Media::new("1", "a.mp4", "/data/x/a.mp4");
        downloading.status = MediaStatus::Downloading;
        let mut retrying = Media::new("2", "b.jpg", "/data/x/b.jpg");
        retrying.status = MediaStatus::Retrying;
        let (store, temp_dir) = store_with(vec![downloading, retrying]).await;

        let dir = profile_dir(&temp_dir);
        std::fs::create_dir_all(dir.join("v")).unwrap();
        std::fs::create_dir_all(dir.join("p")).unwrap();
        std::fs::write(dir.join("v").join("a.mp4.tmp"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.join("p").join("b.jpg.tmp"), vec![0u8; 10]).unwrap();

        RestoreScanner::new().run(&store, &dir).await;

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.get("a.mp4").unwrap().status, MediaStatus::Paused);
        assert_eq!(snapshot.get("b.jpg").unwrap().status, MediaStatus::Paused);
    }

    #[tokio::test]
    async fn test_strict_mode_flags_hash_mismatch() {
        // file content "hello" does not hash to "deadbeef"
        let media = Media::new("1", "deadbeef.mp4", "/data/x/deadbeef.mp4");
        let (store, temp_dir) = store_with(vec![media]).await;

        let dir = profile_dir(&temp_dir);
        std::fs::create_dir_all(dir.join("v")).unwrap();
        std::fs::write(dir.join("v").join("deadbeef.mp4"), b"hello").unwrap();

        let summary = RestoreScanner::strict().run(&store, &dir).await;
        assert_eq!(summary.incomplete, 1);

        let snapshot = store.snapshot().await;
        let m = snapshot.get("deadbeef.mp4").unwrap();
        assert_eq!(m.status, MediaStatus::Incomplete);
        assert!(m.hash_check.starts_with("2cf24dba"));
    }

    #[tokio::test]
    async fn test_empty_final_file_is_missing() {
        let media = Media::new("1", "a.mp4", "/data/x/a.mp4");
        let (store, temp_dir) = store_with(vec![media]).await;

        let dir = profile_dir(&temp_dir);
        std::fs::create_dir_all(dir.join("v")).unwrap();
        std::fs::write(dir.join("v").join("a.mp4"), b"").unwrap();

        let summary = RestoreScanner::new().run(&store, &dir).await;
        assert_eq!(summary.missing, 1);
        assert_eq!(
            store.snapshot().await.get("a.mp4").unwrap().status,
            MediaStatus::Missing
        );
    }
}
