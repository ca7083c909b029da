//! Single-writer catalog persistence
//!
//! All in-memory mutation of a profile's media list funnels through
//! [`ProfileStore`] so the single-writer invariant on the JSON file holds.
//! External readers only ever receive snapshots; the internal mutex is
//! never held across network I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::catalog::models::{Catalog, Media, MediaStatus, ProfileKey, TransitionError};
use crate::events::{topic_update, Event, EventBus};
use crate::utils::fs::atomic_write;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown media: {0}")]
    UnknownMedia(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Catalog file path for a profile under `data_dir`.
pub fn catalog_path(data_dir: &Path, key: &ProfileKey) -> PathBuf {
    data_dir
        .join(&key.service)
        .join(format!("{}.json", key.username))
}

/// Owner of one profile's in-memory catalog and its JSON file.
pub struct ProfileStore {
    key: ProfileKey,
    path: PathBuf,
    inner: Mutex<Catalog>,
    events: EventBus,
}

impl ProfileStore {
    /// Load the catalog for `key`, or start an empty one when the file is
    /// missing. Corrupt JSON degrades to an empty catalog with a warning
    /// rather than an error.
    pub async fn open(
        data_dir: &Path,
        key: ProfileKey,
        events: EventBus,
    ) -> Result<Arc<Self>, CatalogError> {
        let path = catalog_path(data_dir, &key);
        let catalog = match Self::load(&path).await? {
            Some(catalog) => catalog,
            None => Catalog::new(key.username.clone()),
        };

        Ok(Arc::new(Self {
            key,
            path,
            inner: Mutex::new(catalog),
            events,
        }))
    }

    /// Read a catalog file. `Ok(None)` when it does not exist; an empty
    /// catalog when it exists but cannot be parsed.
    pub async fn load(path: &Path) -> Result<Option<Catalog>, CatalogError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(path).await?;
        match serde_json::from_str::<Catalog>(&content) {
            Ok(catalog) => Ok(Some(catalog)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt catalog, starting empty");
                let name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default();
                Ok(Some(Catalog::new(name)))
            }
        }
    }

    pub fn key(&self) -> &ProfileKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Clone of the current catalog for readers.
    pub async fn snapshot(&self) -> Catalog {
        self.inner.lock().await.clone()
    }

    /// Persist the current catalog: serialize, write a sibling temp file,
    /// fsync, rename over the target.
    pub async fn save(&self) -> Result<(), CatalogError> {
        let json = {
            let catalog = self.inner.lock().await;
            serde_json::to_string_pretty(&*catalog)?
        };
        atomic_write(&self.path, json.as_bytes()).await?;
        debug!(profile = %self.key, "catalog saved");
        Ok(())
    }

    /// Insert or update one media by name, then notify observers.
    pub async fn upsert(&self, media: Media) {
        {
            let mut catalog = self.inner.lock().await;
            catalog.upsert(media);
            catalog.touch();
        }
        self.notify_changed().await;
    }

    /// Run a closure against the whole catalog under the writer lock.
    pub async fn with_catalog<R>(&self, f: impl FnOnce(&mut Catalog) -> R) -> R {
        let mut catalog = self.inner.lock().await;
        f(&mut catalog)
    }

    /// Mutate one media under the writer lock.
    pub async fn update_media<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Media) -> R,
    ) -> Result<R, CatalogError> {
        let mut catalog = self.inner.lock().await;
        let media = catalog
            .get_mut(name)
            .ok_or_else(|| CatalogError::UnknownMedia(name.to_string()))?;
        Ok(f(media))
    }

    /// Transition a media's status through the state machine, clearing or
    /// setting its error string.
    pub async fn set_status(
        &self,
        name: &str,
        to: MediaStatus,
        error: Option<String>,
    ) -> Result<(), CatalogError> {
        let result = self
            .update_media(name, |media| {
                media.set_status(to)?;
                if let Some(msg) = error {
                    media.error = msg;
                }
                Ok::<(), TransitionError>(())
            })
            .await?;
        result?;
        Ok(())
    }

    /// Record transfer progress for one media and publish it.
    pub async fn record_progress(&self, name: &str, local_size: u64, total: u64, speed: String) {
        let media = {
            let mut catalog = self.inner.lock().await;
            match catalog.get_mut(name) {
                Some(media) => {
                    media.record_progress(local_size, total, Some(speed));
                    media.clone()
                }
                None => return,
            }
        };

        self.events.publish(
            &topic_update(&self.key.to_string()),
            &Event::MediaProgress {
                profile_key: self.key.to_string(),
                media,
            },
        );
    }

    /// Publish a full-catalog snapshot to this profile's topic.
    pub async fn notify_changed(&self) {
        let snapshot = Arc::new(self.snapshot().await);
        self.events.publish(
            &topic_update(&self.key.to_string()),
            &Event::CatalogChanged {
                profile_key: self.key.to_string(),
                catalog: snapshot,
            },
        );
    }

    /// Normalize every transient status to `Paused`; returns how many
    /// entries changed. Used at boot and shutdown.
    pub async fn normalize_transient(&self) -> usize {
        let mut catalog = self.inner.lock().await;
        let mut changed = 0;
        for media in &mut catalog.medias {
            if media.status.is_transient() {
                media.status = MediaStatus::Paused;
                media.speed = None;
                media.error.clear();
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(profile = %self.key, changed, "normalized transient statuses to Paused");
        }
        changed
    }
}
