//! Profile lifecycle management
//!
//! Everything that touches profiles as a whole: discovery from the data
//! directory, creation from a profile URL, refreshing against the API,
//! relocating or importing download trees, and deletion.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::client::ApiError;
use crate::api::pager::{PostFetcher, PostPager};
use crate::catalog::models::{Catalog, Media, MediaStatus, MediaType, ProfileKey};
use crate::catalog::store::{catalog_path, CatalogError, ProfileStore};
use crate::events::{Event, EventBus, UpdateReason, TOPIC_PROFILE_UPDATE};
use crate::utils::fs::dir_size;
use crate::utils::hash::sha256_file_async;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Not a profile URL: {0}")]
    InvalidUrl(String),

    #[error("Profile not found: {0}")]
    NotFound(String),
}

/// One row of `list()`.
#[derive(Debug, Clone)]
pub struct ProfileSummary {
    pub key: ProfileKey,
    pub media_count: usize,
    pub completed: usize,
    pub last_update: DateTime<Utc>,
    pub download_path: PathBuf,
}

/// Outcome of a `refresh()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshReport {
    pub new_media: usize,
    pub total_media: usize,
    /// Set when pagination terminated early and the catalog is partial
    pub partial: bool,
}

/// Manages profile files, paths, API ingestion and imports.
pub struct ProfileManager<F: PostFetcher> {
    data_dir: PathBuf,
    default_download_dir: PathBuf,
    profile_dirs: HashMap<String, PathBuf>,
    fetcher: Arc<F>,
    events: EventBus,
}

impl<F: PostFetcher> ProfileManager<F> {
    pub fn new(
        data_dir: PathBuf,
        default_download_dir: PathBuf,
        profile_dirs: HashMap<String, PathBuf>,
        fetcher: Arc<F>,
        events: EventBus,
    ) -> Result<Self, ProfileError> {
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(&default_download_dir)?;

        Ok(Self {
            data_dir,
            default_download_dir,
            profile_dirs,
            fetcher,
            events,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Per-profile custom base dirs, for persisting back into settings.
    pub fn profile_dirs(&self) -> &HashMap<String, PathBuf> {
        &self.profile_dirs
    }

    /// Base directory for a profile, honoring its custom dir.
    fn profile_base_dir(&self, key: &ProfileKey) -> PathBuf {
        self.profile_dirs
            .get(&key.to_string())
            .cloned()
            .unwrap_or_else(|| self.default_download_dir.clone())
    }

    /// Full path files for this profile land under: `<base>/<service>/<username>`.
    pub fn profile_download_path(&self, key: &ProfileKey) -> PathBuf {
        self.profile_base_dir(key)
            .join(&key.service)
            .join(&key.username)
    }

    /// Enumerate profiles by walking `data/<service>/*.json`.
    pub async fn list(&self) -> Result<Vec<ProfileSummary>, ProfileError> {
        let mut summaries = Vec::new();

        let services = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(summaries),
        };

        for service_entry in services.flatten() {
            if !service_entry.path().is_dir() {
                continue;
            }
            let service = service_entry.file_name().to_string_lossy().to_string();

            for file_entry in std::fs::read_dir(service_entry.path())?.flatten() {
                let path = file_entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("json") {
                    continue;
                }
                let username = match path.file_stem().and_then(|s| s.to_str()) {
                    Some(stem) => stem.to_string(),
                    None => continue,
                };

                let key = ProfileKey::new(service.clone(), username);
                match ProfileStore::load(&path).await {
                    Ok(Some(catalog)) => summaries.push(ProfileSummary {
                        media_count: catalog.medias.len(),
                        completed: catalog.count_status(MediaStatus::Completed),
                        last_update: catalog.last_update,
                        download_path: self.profile_download_path(&key),
                        key,
                    }),
                    Ok(None) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "unreadable catalog"),
                }
            }
        }

        summaries.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        Ok(summaries)
    }

    /// Create a profile from its page URL and ingest its full catalog.
    pub async fn add(&self, url: &str) -> Result<(ProfileKey, usize), ProfileError> {
        let key = ProfileKey::from_url(url)
            .ok_or_else(|| ProfileError::InvalidUrl(url.to_string()))?;

        let store = self.open_store(&key).await?;
        let mut pager = PostPager::new(self.fetcher.clone(), &key.service, &key.username);
        let (medias, error) = pager.fetch_all().await;

        let added = store
            .with_catalog(|catalog| {
                let mut added = 0;
                for media in medias {
                    if catalog.insert_new(media) {
                        added += 1;
                    }
                }
                catalog.touch();
                added
            })
            .await;
        store.save().await?;

        if let Some(e) = error {
            warn!(profile = %key, error = %e, "catalog ingested partially");
        }
        info!(profile = %key, added, "profile added");

        self.events.publish(
            TOPIC_PROFILE_UPDATE,
            &Event::ProfileUpdate {
                reason: UpdateReason::ProfileAdded,
                no_sort: None,
                profile_key: Some(key.to_string()),
            },
        );

        Ok((key, added))
    }

    /// Page the API from `last_update` and insert new media only.
    /// Idempotent against an unchanged remote.
    pub async fn refresh(&self, key: &ProfileKey) -> Result<RefreshReport, ProfileError> {
        let store = self.open_store(key).await?;
        let cutoff = store.with_catalog(|c| c.last_update).await;

        let mut pager = PostPager::new(self.fetcher.clone(), &key.service, &key.username);
        let mut new_medias: Vec<Media> = Vec::new();
        let mut partial = false;

        loop {
            match pager.next_page().await {
                Ok(Some(medias)) => {
                    new_medias.extend(medias);
                    // pages run newest-first; once past the previous
                    // refresh point there is nothing new further down
                    if pager
                        .last_timestamp_utc()
                        .is_some_and(|oldest| oldest < cutoff)
                    {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(profile = %key, error = %e, "refresh pagination terminated early");
                    partial = true;
                    break;
                }
            }
        }

        let (added, total) = store
            .with_catalog(|catalog| {
                let mut added = 0;
                for media in new_medias {
                    if catalog.insert_new(media) {
                        added += 1;
                    }
                }
                catalog.touch();
                (added, catalog.medias.len())
            })
            .await;
        store.save().await?;

        info!(profile = %key, added, total, "refresh done");
        self.events.publish(
            TOPIC_PROFILE_UPDATE,
            &Event::ProfileUpdate {
                reason: UpdateReason::ManualRefresh,
                no_sort: None,
                profile_key: Some(key.to_string()),
            },
        );

        Ok(RefreshReport {
            new_media: added,
            total_media: total,
            partial,
        })
    }

    /// Relocate a profile's files to a new base directory, preserving the
    /// internal `v/p/o` tree. Progress is observable by polling
    /// [`dir_size`] on the destination against a snapshot of the source.
    pub async fn move_profile(
        &mut self,
        key: &ProfileKey,
        new_base: &Path,
    ) -> Result<(), ProfileError> {
        let src = self.profile_download_path(key);
        let dst = new_base.join(&key.service).join(&key.username);
        std::fs::create_dir_all(&dst)?;

        let total = dir_size(&src);
        info!(profile = %key, from = %src.display(), to = %dst.display(), total, "moving profile");

        if src.exists() {
            let files = collect_files(&src)?;
            for (absolute, relative) in files {
                let target = dst.join(&relative);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                move_file(&absolute, &target)?;
            }
            prune_empty_dirs(&src);
        }

        self.profile_dirs
            .insert(key.to_string(), new_base.to_path_buf());

        // keep the catalog's custom_dir in line with the new location
        let store = self.open_store(key).await?;
        let download_path = self.profile_download_path(key);
        store
            .with_catalog(|catalog| catalog.custom_dir = Some(download_path))
            .await;
        store.save().await?;

        self.events.publish(
            TOPIC_PROFILE_UPDATE,
            &Event::ProfileUpdate {
                reason: UpdateReason::DirChanged,
                no_sort: None,
                profile_key: Some(key.to_string()),
            },
        );
        Ok(())
    }

    /// Adopt an already-downloaded directory: fetch the full catalog,
    /// reorganize stray files into `v/p/o`, then SHA-match local files to
    /// catalog entries and rename them to their canonical names.
    pub async fn import_existing(
        &mut self,
        selected_dir: &Path,
        url: &str,
    ) -> Result<ProfileKey, ProfileError> {
        let key = ProfileKey::from_url(url)
            .ok_or_else(|| ProfileError::InvalidUrl(url.to_string()))?;
        info!(profile = %key, dir = %selected_dir.display(), "importing existing directory");

        let mut pager = PostPager::new(self.fetcher.clone(), &key.service, &key.username);
        let (mut medias, error) = pager.fetch_all().await;
        if let Some(e) = error {
            warn!(profile = %key, error = %e, "import catalog is partial");
        }

        let cleaned_path = clean_profile_folder(selected_dir, &key)?;

        let mut matched = 0usize;
        for file_path in collect_media_files(&cleaned_path) {
            let sha = match sha256_file_async(&file_path).await {
                Ok(sha) => sha,
                Err(e) => {
                    warn!(file = %file_path.display(), error = %e, "hash failed, skipping");
                    continue;
                }
            };

            let media = medias.iter_mut().find(|m| m.url.contains(&sha));
            let Some(media) = media else {
                warn!(file = %file_path.display(), "no catalog match for local file");
                continue;
            };

            let size = std::fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
            media.status = MediaStatus::Completed;
            media.local_size = size;
            media.size_http = media.size_http.max(size);
            media.percent = 100;
            media.error.clear();
            matched += 1;

            let actual_name = file_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default();
            if actual_name != media.name {
                let canonical = file_path.with_file_name(&media.name);
                if let Err(e) = std::fs::rename(&file_path, &canonical) {
                    warn!(from = actual_name, to = %media.name, error = %e, "rename failed");
                }
            }

            let mut tmp = file_path.clone().into_os_string();
            tmp.push(".tmp");
            let _ = std::fs::remove_file(PathBuf::from(tmp));
        }

        self.profile_dirs
            .insert(key.to_string(), selected_dir.to_path_buf());

        let store = self.open_store(&key).await?;
        store
            .with_catalog(|catalog| {
                for media in medias {
                    catalog.upsert(media);
                }
                catalog.custom_dir = Some(cleaned_path.clone());
                catalog.touch();
            })
            .await;
        store.save().await?;

        info!(profile = %key, matched, "import finished");
        self.events.publish(
            TOPIC_PROFILE_UPDATE,
            &Event::ProfileUpdate {
                reason: UpdateReason::ImportDone,
                no_sort: None,
                profile_key: Some(key.to_string()),
            },
        );
        Ok(key)
    }

    /// Remove the catalog file and the whole download tree.
    pub async fn delete(&mut self, key: &ProfileKey) -> Result<(), ProfileError> {
        let json_path = catalog_path(&self.data_dir, key);
        let download_path = self.profile_download_path(key);

        if !json_path.exists() && !download_path.exists() {
            return Err(ProfileError::NotFound(key.to_string()));
        }

        if json_path.exists() {
            std::fs::remove_file(&json_path)?;
        }
        if download_path.exists() {
            std::fs::remove_dir_all(&download_path)?;
        }
        self.profile_dirs.remove(&key.to_string());

        info!(profile = %key, "profile deleted");
        Ok(())
    }

    async fn open_store(&self, key: &ProfileKey) -> Result<Arc<ProfileStore>, ProfileError> {
        Ok(ProfileStore::open(&self.data_dir, key.clone(), self.events.clone()).await?)
    }
}

/// `(videos_bytes, images_bytes)` for a profile's download tree.
pub fn compute_folder_sizes(download_path: &Path) -> (u64, u64) {
    (
        dir_size(&download_path.join(crate::constants::storage::VIDEO_SUBDIR)),
        dir_size(&download_path.join(crate::constants::storage::IMAGE_SUBDIR)),
    )
}

/// All `(absolute, relative)` file pairs under `root`, recursively.
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, PathBuf)>, std::io::Error> {
    fn walk(
        root: &Path,
        current: &Path,
        out: &mut Vec<(PathBuf, PathBuf)>,
    ) -> Result<(), std::io::Error> {
        for entry in std::fs::read_dir(current)?.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push((path.clone(), relative.to_path_buf()));
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    if root.exists() {
        walk(root, root, &mut out)?;
    }
    Ok(out)
}

/// Move with a copy+delete fallback for cross-device destinations.
fn move_file(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dst)?;
            std::fs::remove_file(src)
        }
    }
}

/// Drop now-empty directories bottom-up; races and failures are ignored.
fn prune_empty_dirs(root: &Path) {
    fn walk(dir: &Path) {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    walk(&entry.path());
                }
            }
        }
        let _ = std::fs::remove_dir(dir);
    }
    walk(root);
}

/// Normalize an imported directory into `<dir>/<service>/<username>/{v,p,o}`:
/// hidden files are deleted, every other file is routed by extension, and
/// directories left empty are pruned.
fn clean_profile_folder(dir: &Path, key: &ProfileKey) -> Result<PathBuf, std::io::Error> {
    let cleaned = dir.join(&key.service).join(&key.username);
    let video_dir = cleaned.join(crate::constants::storage::VIDEO_SUBDIR);
    let image_dir = cleaned.join(crate::constants::storage::IMAGE_SUBDIR);
    let other_dir = cleaned.join(crate::constants::storage::OTHER_SUBDIR);
    for sub in [&video_dir, &image_dir, &other_dir] {
        std::fs::create_dir_all(sub)?;
    }

    for (absolute, _relative) in collect_files(dir)? {
        let name = absolute
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        if name.starts_with('.') {
            let _ = std::fs::remove_file(&absolute);
            continue;
        }

        // already routed
        if absolute.starts_with(&video_dir)
            || absolute.starts_with(&image_dir)
            || absolute.starts_with(&other_dir)
        {
            continue;
        }

        let dest_dir = match MediaType::from_name(&name) {
            MediaType::Video => &video_dir,
            MediaType::Image => &image_dir,
            MediaType::Other => &other_dir,
        };
        if let Err(e) = move_file(&absolute, &dest_dir.join(&name)) {
            warn!(file = %name, error = %e, "could not route file during import");
        }
    }

    // prune whatever the routing emptied, but keep the canonical tree
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && !cleaned.starts_with(&path) {
                prune_empty_dirs(&path);
            }
        }
    }

    Ok(cleaned)
}

/// Media files sitting in a cleaned profile tree.
fn collect_media_files(cleaned_path: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for sub in [
        crate::constants::storage::VIDEO_SUBDIR,
        crate::constants::storage::IMAGE_SUBDIR,
        crate::constants::storage::OTHER_SUBDIR,
    ] {
        let dir = cleaned_path.join(sub);
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let is_tmp = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == "tmp");
                if path.is_file() && !is_tmp {
                    files.push(path);
                }
            }
        }
    }
    files
}

/// Catalogs know where their files belong; expose it for sessions.
pub fn catalog_download_path(catalog: &Catalog, fallback: &Path) -> PathBuf {
    catalog
        .custom_dir
        .clone()
        .unwrap_or_else(|| fallback.to_path_buf())
}
