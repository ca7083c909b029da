//! Engine wiring and the per-profile session lifecycle
//!
//! [`DownloadEngine`] builds the shared pieces once — HTTP clients, the
//! process-wide semaphore, the event bus — so callers and tests construct
//! it explicitly instead of reaching for globals. [`ProfileSession`] runs
//! the boot pipeline for one profile: restore, then services; observers
//! attach only after boot has settled, so they never see half-restored
//! state.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

use crate::api::client::{ApiClient, SessionCookies};
use crate::catalog::models::{MediaStatus, ProfileKey};
use crate::catalog::restore::{RestoreScanner, RestoreSummary};
use crate::catalog::store::ProfileStore;
use crate::config::Config;
use crate::constants::storage;
use crate::download::controller::{ControllerHandle, ControllerStats, DownloadController};
use crate::download::downloader::{HttpDownloader, MediaFetcher};
use crate::download::supervisor::RetrySupervisor;
use crate::events::{Event, EventBus, UpdateReason, TOPIC_PROFILE_UPDATE};
use crate::profile::manager::ProfileManager;

/// Explicitly constructed shared state; tests build one with small caps.
pub struct DownloadEngine {
    pub config: Config,
    pub events: EventBus,
    pub api: Arc<ApiClient>,
    pub downloader: Arc<HttpDownloader>,
    pub global_slots: Arc<Semaphore>,
    pub data_dir: PathBuf,
}

impl DownloadEngine {
    pub fn new(config: Config) -> Result<Self> {
        let cookies = SessionCookies {
            session: config.session_cookie.clone(),
            extra: config
                .extra_cookies
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        let global_max = config.effective_global_max();
        Ok(Self {
            api: Arc::new(ApiClient::new(cookies)?),
            downloader: Arc::new(HttpDownloader::new()?),
            global_slots: Arc::new(Semaphore::new(global_max)),
            events: EventBus::new(),
            data_dir: PathBuf::from(storage::DATA_DIR),
            config,
        })
    }

    /// A profile manager wired to this engine's client and bus.
    pub fn profile_manager(&self) -> Result<ProfileManager<ApiClient>> {
        Ok(ProfileManager::new(
            self.data_dir.clone(),
            self.config.download_dir_path(),
            self.config.profile_dirs.clone(),
            self.api.clone(),
            self.events.clone(),
        )?)
    }

    /// Run the boot pipeline for one profile and hand back its session.
    pub async fn open_profile(
        &self,
        key: ProfileKey,
    ) -> Result<ProfileSession<HttpDownloader>> {
        let profile_dir = {
            let base = self
                .config
                .profile_dirs
                .get(&key.to_string())
                .cloned()
                .unwrap_or_else(|| self.config.download_dir_path());
            base.join(&key.service).join(&key.username)
        };

        ProfileSession::boot(
            &self.data_dir,
            key,
            profile_dir,
            self.downloader.clone(),
            self.global_slots.clone(),
            self.config.max_concurrent,
            self.config.strict_restore,
            self.events.clone(),
        )
        .await
    }
}

/// One opened profile: its store, scheduler, and retry supervisor.
pub struct ProfileSession<F: MediaFetcher + 'static> {
    key: ProfileKey,
    store: Arc<ProfileStore>,
    controller: Arc<DownloadController<F>>,
    supervisor: Arc<RetrySupervisor<F>>,
    profile_dir: PathBuf,
    restore_summary: RestoreSummary,
    handles: ControllerHandle,
    supervisor_handle: tokio::task::JoinHandle<()>,
    events: EventBus,
    closed: AtomicBool,
}

impl<F: MediaFetcher + 'static> ProfileSession<F> {
    /// Boot pipeline: restore from disk first, persist the reconciled
    /// catalog, then start the scheduler, supervisor and watchdog.
    /// Subscribers should attach to the bus only after this returns.
    #[allow(clippy::too_many_arguments)]
    pub async fn boot(
        data_dir: &std::path::Path,
        key: ProfileKey,
        profile_dir: PathBuf,
        fetcher: Arc<F>,
        global_slots: Arc<Semaphore>,
        max_concurrent: usize,
        strict_restore: bool,
        events: EventBus,
    ) -> Result<Self> {
        let store = ProfileStore::open(data_dir, key.clone(), events.clone()).await?;

        let scanner = if strict_restore {
            RestoreScanner::strict()
        } else {
            RestoreScanner::new()
        };
        let restore_summary = scanner.run(&store, &profile_dir).await;
        store.save().await?;

        let controller = DownloadController::new(
            store.clone(),
            fetcher,
            profile_dir.clone(),
            global_slots,
            max_concurrent,
        );
        let handles = controller.clone().start();
        let supervisor = RetrySupervisor::new(store.clone(), controller.clone());
        let supervisor_handle = supervisor.clone().start();

        info!(profile = %key, "profile session opened");
        Ok(Self {
            key,
            store,
            controller,
            supervisor,
            profile_dir,
            restore_summary,
            handles,
            supervisor_handle,
            events,
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &ProfileKey {
        &self.key
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    pub fn restore_summary(&self) -> &RestoreSummary {
        &self.restore_summary
    }

    pub fn profile_dir(&self) -> &std::path::Path {
        &self.profile_dir
    }

    /// Enqueue every downloadable entry; returns how many were queued.
    pub async fn download_all(&self) -> usize {
        self.controller.enqueue_eligible().await
    }

    /// Enqueue one entry by name.
    pub async fn download(&self, name: &str) -> bool {
        self.controller.enqueue(name).await
    }

    pub async fn stats(&self) -> ControllerStats {
        self.controller.stats().await
    }

    /// Block until the queue and the worker pool are both empty.
    pub async fn wait_idle(&self) {
        loop {
            let stats = self.controller.stats().await;
            if stats.pending == 0 && stats.active == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    /// Mark an entry Ignored; restore will never override it.
    pub async fn ignore(&self, name: &str) -> Result<()> {
        self.store.set_status(name, MediaStatus::Ignored, None).await?;
        self.store.notify_changed().await;
        Ok(())
    }

    /// Lift an Ignored mark: the entry becomes Completed when its file is
    /// on disk, Missing otherwise.
    pub async fn unignore(&self, name: &str) -> Result<()> {
        let final_path = self
            .store
            .update_media(name, |m| m.final_path(&self.profile_dir))
            .await?;

        if final_path.exists() {
            let size = tokio::fs::metadata(&final_path).await.map(|m| m.len()).unwrap_or(0);
            self.store.set_status(name, MediaStatus::Completed, None).await?;
            self.store
                .update_media(name, |m| {
                    m.local_size = size;
                    if size > m.size_http {
                        m.size_http = size;
                    }
                    m.percent = 100;
                })
                .await?;
        } else {
            self.store.set_status(name, MediaStatus::Missing, None).await?;
            self.store.update_media(name, |m| m.reset_progress()).await?;
        }
        self.store.notify_changed().await;
        Ok(())
    }

    /// User override: mark an entry done without verification. The
    /// diagnostic notes the forcing so it stays distinguishable.
    pub async fn force_complete(&self, name: &str) -> Result<()> {
        self.store
            .update_media(name, |m| {
                m.status = MediaStatus::Completed;
                m.percent = 100;
                m.error.clear();
                m.hash_check = "(forced)".to_string();
            })
            .await?;
        self.store.notify_changed().await;
        Ok(())
    }

    /// Force-retry a finished entry from scratch.
    pub async fn retry(&self, name: &str) -> Result<bool> {
        self.store.set_status(name, MediaStatus::Waiting, None).await?;
        Ok(self.controller.enqueue_waiting(name).await)
    }

    /// Runtime change of the per-profile ceiling.
    pub async fn set_max_concurrent(&self, n: usize) {
        self.controller.set_max_concurrent(n).await;
    }

    /// Idempotent shutdown: active entries land on Paused, the catalog is
    /// fsynced, and the scheduler stops without cancelling in-flight
    /// transfers.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.supervisor.stop();
        self.controller.stop(false);
        self.store.normalize_transient().await;
        self.store.save().await?;

        self.events.publish(
            TOPIC_PROFILE_UPDATE,
            &Event::ProfileUpdate {
                reason: UpdateReason::WindowClose,
                no_sort: Some(true),
                profile_key: Some(self.key.to_string()),
            },
        );
        info!(profile = %self.key, "profile session closed");
        Ok(())
    }

    /// Stop everything, including in-flight transfers; partial `.tmp`
    /// files stay on disk for the next resume.
    pub async fn abort(&self) -> Result<()> {
        self.controller.stop(true);
        self.shutdown().await
    }

    /// Await the background tasks after a shutdown; test hygiene mainly.
    pub async fn join(self) {
        let _ = self.handles.scheduler.await;
        let _ = self.handles.watchdog.await;
        let _ = self.supervisor_handle.await;
    }
}
