//! Bounded per-profile download scheduling
//!
//! One controller per open profile: a FIFO queue of media names, a
//! per-profile semaphore, and a share of the process-wide semaphore. A
//! single scheduler task reaps finished workers and dispatches new ones
//! every tick; workers never outnumber the smaller of the two ceilings.
//!
//! Lock order is global semaphore, then profile semaphore, then the
//! catalog mutex; the catalog mutex is never held across network I/O.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::models::MediaStatus;
use crate::catalog::store::ProfileStore;
use crate::constants::scheduler;
use crate::download::downloader::{DownloadError, DownloadRequest, MediaFetcher, ProgressSink};

/// Queue/activity counters for observers and the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStats {
    pub pending: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

struct SchedulerState {
    queue: VecDeque<String>,
    active: HashMap<String, JoinHandle<()>>,
    profile_slots: Arc<Semaphore>,
    max_concurrent: usize,
}

/// Background tasks owned by a started controller.
pub struct ControllerHandle {
    pub scheduler: JoinHandle<()>,
    pub watchdog: JoinHandle<()>,
}

/// Per-profile bounded scheduler over a [`MediaFetcher`].
pub struct DownloadController<F: MediaFetcher + 'static> {
    store: Arc<ProfileStore>,
    fetcher: Arc<F>,
    profile_dir: PathBuf,
    global_slots: Arc<Semaphore>,
    state: Mutex<SchedulerState>,
    kick: Notify,
    /// Stops workers cooperatively
    cancel: CancellationToken,
    /// Stops the scheduler loop without touching in-flight workers
    shutdown: CancellationToken,
}

impl<F: MediaFetcher + 'static> DownloadController<F> {
    pub fn new(
        store: Arc<ProfileStore>,
        fetcher: Arc<F>,
        profile_dir: PathBuf,
        global_slots: Arc<Semaphore>,
        max_concurrent: usize,
    ) -> Arc<Self> {
        let max_concurrent = max_concurrent.max(1);
        Arc::new(Self {
            store,
            fetcher,
            profile_dir,
            global_slots,
            state: Mutex::new(SchedulerState {
                queue: VecDeque::new(),
                active: HashMap::new(),
                profile_slots: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
            }),
            kick: Notify::new(),
            cancel: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the scheduler loop and its stall watchdog.
    pub fn start(self: Arc<Self>) -> ControllerHandle {
        let scheduler = tokio::spawn(self.clone().scheduler_loop());
        let watchdog = tokio::spawn(self.clone().watchdog_loop());
        info!(profile = %self.store.key(), "scheduler started");
        ControllerHandle { scheduler, watchdog }
    }

    /// Stop scheduling. In-flight transfers are cancelled only when
    /// `cancel_inflight` is set; otherwise they drain on their own.
    pub fn stop(&self, cancel_inflight: bool) {
        self.shutdown.cancel();
        if cancel_inflight {
            self.cancel.cancel();
        }
        info!(profile = %self.store.key(), cancel_inflight, "scheduler stopped");
    }

    /// Enqueue one media by name. Idempotent: entries already queued or
    /// active, and statuses outside the queueable set, are rejected.
    pub async fn enqueue(&self, name: &str) -> bool {
        let mut state = self.state.lock().await;

        if state.active.contains_key(name) || state.queue.iter().any(|n| n == name) {
            return false;
        }

        let queueable = self
            .store
            .update_media(name, |m| m.status.is_queueable())
            .await
            .unwrap_or(false);
        if !queueable {
            return false;
        }

        if self
            .store
            .set_status(name, MediaStatus::Waiting, None)
            .await
            .is_err()
        {
            return false;
        }

        state.queue.push_back(name.to_string());
        debug!(profile = %self.store.key(), name, pending = state.queue.len(), "enqueued");
        self.kick.notify_one();
        true
    }

    /// Queue an entry that already holds `Waiting` (the force-retry path,
    /// where a Completed entry was moved back by the caller).
    pub async fn enqueue_waiting(&self, name: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.active.contains_key(name) || state.queue.iter().any(|n| n == name) {
            return false;
        }
        let waiting = self
            .store
            .update_media(name, |m| m.status == MediaStatus::Waiting)
            .await
            .unwrap_or(false);
        if !waiting {
            return false;
        }
        state.queue.push_back(name.to_string());
        self.kick.notify_one();
        true
    }

    /// Enqueue everything currently eligible; returns how many were taken.
    pub async fn enqueue_eligible(&self) -> usize {
        let names: Vec<String> = self
            .store
            .with_catalog(|catalog| {
                catalog
                    .medias
                    .iter()
                    .filter(|m| m.status.is_queueable())
                    .map(|m| m.name.clone())
                    .collect()
            })
            .await;

        let mut count = 0;
        for name in names {
            if self.enqueue(&name).await {
                count += 1;
            }
        }
        count
    }

    /// Replace the per-profile ceiling. The new semaphore governs new
    /// dispatches; running workers finish on permits of the old one.
    pub async fn set_max_concurrent(&self, n: usize) {
        let n = n.max(1);
        let mut state = self.state.lock().await;
        if n == state.max_concurrent {
            return;
        }
        info!(profile = %self.store.key(), from = state.max_concurrent, to = n, "parallelism changed");
        state.max_concurrent = n;
        state.profile_slots = Arc::new(Semaphore::new(n));
        self.kick.notify_one();
    }

    pub async fn stats(&self) -> ControllerStats {
        let state = self.state.lock().await;
        ControllerStats {
            pending: state.queue.len(),
            active: state.active.len(),
            max_concurrent: state.max_concurrent,
        }
    }

    /// Wake the scheduler outside its regular tick.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    async fn scheduler_loop(self: Arc<Self>) {
        let mut idle_ticks = 0u32;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let dispatched = Self::tick(&self).await;

            let stats = self.stats().await;
            if dispatched == 0 && stats.active == 0 && stats.pending == 0 {
                idle_ticks += 1;
                if idle_ticks == scheduler::IDLE_DIAGNOSTIC_TICKS {
                    debug!(profile = %self.store.key(), "scheduler idle");
                }
            } else {
                idle_ticks = 0;
            }

            tokio::select! {
                _ = tokio::time::sleep(scheduler::TICK) => {}
                _ = self.kick.notified() => {}
                _ = self.shutdown.cancelled() => break,
            }
        }
    }

    /// One scheduler pass: reap, then dispatch while slots allow.
    async fn tick(this: &Arc<Self>) -> usize {
        let mut state = this.state.lock().await;

        // reap finished workers; their permits released on task end
        let finished: Vec<String> = state
            .active
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in finished {
            if let Some(handle) = state.active.remove(&name) {
                if let Err(e) = handle.await {
                    warn!(profile = %this.store.key(), name = %name, error = %e, "worker panicked");
                }
            }
        }

        // dispatch
        let mut dispatched = 0usize;
        loop {
            let global = match this.global_slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let profile = match state.profile_slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    drop(global);
                    break;
                }
            };

            let name = match state.queue.pop_front() {
                Some(name) => name,
                None => {
                    drop(profile);
                    drop(global);
                    break;
                }
            };

            if this
                .store
                .set_status(&name, MediaStatus::Downloading, None)
                .await
                .is_err()
            {
                // no longer Waiting (user action in between); drop it
                drop(profile);
                drop(global);
                continue;
            }

            let handle = tokio::spawn(this.clone().run_worker(name.clone(), global, profile));
            state.active.insert(name, handle);
            dispatched += 1;
        }

        dispatched
    }

    /// One media transfer, permits held for its whole duration.
    async fn run_worker(
        self: Arc<Self>,
        name: String,
        _global: OwnedSemaphorePermit,
        _profile: OwnedSemaphorePermit,
    ) {
        let details = self
            .store
            .update_media(&name, |m| {
                (m.url.clone(), m.cdn_path.clone(), m.media_type)
            })
            .await;
        let (url, cdn_path, media_type) = match details {
            Ok(details) => details,
            Err(e) => {
                warn!(name = %name, error = %e, "media vanished before dispatch");
                return;
            }
        };

        let request = DownloadRequest {
            url,
            cdn_path,
            final_path: self
                .profile_dir
                .join(media_type.subdir())
                .join(&name),
        };

        let (sink, drain) = StoreSink::start(self.store.clone(), name.clone());
        let result = self.fetcher.fetch(&request, &sink, &self.cancel).await;
        drop(sink);
        // all progress events applied before the terminal status lands
        let _ = drain.await;

        let outcome = match result {
            Ok(()) => {
                self.store
                    .set_status(&name, MediaStatus::Completed, None)
                    .await
            }
            Err(DownloadError::Stopped) => {
                self.store.set_status(&name, MediaStatus::Paused, None).await
            }
            Err(e) => {
                warn!(profile = %self.store.key(), name = %name, error = %e, "download failed");
                // Failed is only reachable through Retrying
                let _ = self
                    .store
                    .set_status(&name, MediaStatus::Retrying, None)
                    .await;
                self.store
                    .set_status(&name, MediaStatus::Failed, Some(e.to_string()))
                    .await
            }
        };
        if let Err(e) = outcome {
            warn!(name = %name, error = %e, "terminal status rejected");
        }

        self.store.notify_changed().await;
        self.kick.notify_one();
    }

    /// Kick the scheduler when the queue is non-empty but nothing has
    /// been active for a while.
    async fn watchdog_loop(self: Arc<Self>) {
        let mut stalled_for = std::time::Duration::ZERO;
        let probe = std::time::Duration::from_secs(1);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(probe) => {}
                _ = self.shutdown.cancelled() => break,
            }

            let stats = self.stats().await;
            if stats.pending > 0 && stats.active == 0 {
                stalled_for += probe;
                if stalled_for >= scheduler::WATCHDOG_STALL {
                    warn!(profile = %self.store.key(), pending = stats.pending, "queue stalled, kicking scheduler");
                    self.kick.notify_one();
                    stalled_for = std::time::Duration::ZERO;
                }
            } else {
                stalled_for = std::time::Duration::ZERO;
            }
        }
    }
}

/// Bridges the synchronous progress callback onto the async store through
/// an unbounded channel; a background task applies events in order.
struct StoreSink {
    tx: tokio::sync::mpsc::UnboundedSender<SinkEvent>,
}

enum SinkEvent {
    Progress { downloaded: u64, speed: String, total: u64 },
    Retry,
}

impl StoreSink {
    fn start(store: Arc<ProfileStore>, name: String) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SinkEvent>();

        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SinkEvent::Progress { downloaded, speed, total } => {
                        let was_retrying = store
                            .update_media(&name, |m| m.status == MediaStatus::Retrying)
                            .await
                            .unwrap_or(false);
                        if was_retrying {
                            let _ = store
                                .set_status(&name, MediaStatus::Downloading, None)
                                .await;
                        }
                        store.record_progress(&name, downloaded, total, speed).await;
                    }
                    SinkEvent::Retry => {
                        let _ = store.set_status(&name, MediaStatus::Retrying, None).await;
                    }
                }
            }
        });

        (Self { tx }, drain)
    }
}

impl ProgressSink for StoreSink {
    fn on_progress(&self, downloaded: u64, speed: &str, total: u64) {
        let _ = self.tx.send(SinkEvent::Progress {
            downloaded,
            speed: speed.to_string(),
            total,
        });
    }

    fn on_retry(&self, _attempt: u32) {
        let _ = self.tx.send(SinkEvent::Retry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::models::{Media, ProfileKey};
    use crate::events::EventBus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Sleeps briefly while tracking current/peak concurrency.
    struct CountingFetcher {
        current: AtomicUsize,
        peak: AtomicUsize,
        completed: AtomicUsize,
        hold: std::time::Duration,
        fail: bool,
    }

    impl CountingFetcher {
        fn new(hold: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                hold,
                fail: false,
            })
        }

        fn failing(hold: std::time::Duration) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
                hold,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl MediaFetcher for CountingFetcher {
        async fn fetch(
            &self,
            request: &DownloadRequest,
            progress: &dyn ProgressSink,
            _cancel: &CancellationToken,
        ) -> Result<(), DownloadError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);

            if self.fail {
                return Err(DownloadError::Exhausted);
            }
            // pretend we wrote the file
            if let Some(parent) = request.final_path.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            tokio::fs::write(&request.final_path, b"data").await.ok();
            progress.on_progress(4, "0 B/s", 4);
            Ok(())
        }
    }

    async fn store_with_media(
        temp_dir: &TempDir,
        username: &str,
        count: usize,
    ) -> Arc<ProfileStore> {
        let store = ProfileStore::open(
            temp_dir.path(),
            ProfileKey::new("onlyfans", username),
            EventBus::new(),
        )
        .await
        .unwrap();
        for i in 0..count {
            store
                .upsert(Media::new(
                    i.to_string(),
                    format!("f{}.mp4", i),
                    format!("/data/x/f{}.mp4", i),
                ))
                .await;
        }
        store
    }

    async fn wait_for<Fut>(mut check: impl FnMut() -> Fut, timeout: std::time::Duration) -> bool
    where
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check().await {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_per_profile_cap_respected() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_media(&temp_dir, "val", 20).await;
        let fetcher = CountingFetcher::new(std::time::Duration::from_millis(50));
        let global = Arc::new(Semaphore::new(50));

        let controller = DownloadController::new(
            store.clone(),
            fetcher.clone(),
            temp_dir.path().join("dl"),
            global,
            3,
        );
        let handle = controller.clone().start();
        assert_eq!(controller.enqueue_eligible().await, 20);

        let done = wait_for(
            || async { fetcher.completed.load(Ordering::SeqCst) >= 20 },
            std::time::Duration::from_secs(10),
        )
        .await;
        assert!(done, "queue never drained");
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);

        controller.stop(false);
        let _ = handle.scheduler.await;
    }

    #[tokio::test]
    async fn test_global_cap_spans_profiles() {
        let temp_dir = TempDir::new().unwrap();
        let global = Arc::new(Semaphore::new(4));
        let fetcher = CountingFetcher::new(std::time::Duration::from_millis(50));

        let store_a = store_with_media(&temp_dir, "alpha", 10).await;
        let store_b = store_with_media(&temp_dir, "bravo", 10).await;

        let ctrl_a = DownloadController::new(
            store_a,
            fetcher.clone(),
            temp_dir.path().join("a"),
            global.clone(),
            10,
        );
        let ctrl_b = DownloadController::new(
            store_b,
            fetcher.clone(),
            temp_dir.path().join("b"),
            global.clone(),
            10,
        );

        let handle_a = ctrl_a.clone().start();
        let handle_b = ctrl_b.clone().start();
        ctrl_a.enqueue_eligible().await;
        ctrl_b.enqueue_eligible().await;

        let done = wait_for(
            || async { fetcher.completed.load(Ordering::SeqCst) >= 20 },
            std::time::Duration::from_secs(10),
        )
        .await;
        assert!(done, "queues never drained");
        // both profiles together never exceed the process-wide ceiling
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 4);

        ctrl_a.stop(false);
        ctrl_b.stop(false);
        let _ = handle_a.scheduler.await;
        let _ = handle_b.scheduler.await;
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_media(&temp_dir, "val", 1).await;
        let fetcher = CountingFetcher::new(std::time::Duration::from_millis(10));
        let global = Arc::new(Semaphore::new(10));

        let controller =
            DownloadController::new(store.clone(), fetcher, temp_dir.path().join("dl"), global, 2);

        assert!(controller.enqueue("f0.mp4").await);
        // second enqueue of the same name is rejected
        assert!(!controller.enqueue("f0.mp4").await);
        assert_eq!(controller.stats().await.pending, 1);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_non_queueable_status() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_media(&temp_dir, "val", 2).await;
        let fetcher = CountingFetcher::new(std::time::Duration::from_millis(10));
        let global = Arc::new(Semaphore::new(10));

        store
            .update_media("f0.mp4", |m| m.status = MediaStatus::Completed)
            .await
            .unwrap();
        store
            .update_media("f1.mp4", |m| m.status = MediaStatus::Ignored)
            .await
            .unwrap();

        let controller =
            DownloadController::new(store, fetcher, temp_dir.path().join("dl"), global, 2);
        assert!(!controller.enqueue("f0.mp4").await);
        assert!(!controller.enqueue("f1.mp4").await);
        assert!(!controller.enqueue("missing-name.mp4").await);
    }

    #[tokio::test]
    async fn test_failures_marked_failed_with_error() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_media(&temp_dir, "val", 2).await;
        let fetcher = CountingFetcher::failing(std::time::Duration::from_millis(10));
        let global = Arc::new(Semaphore::new(10));

        let controller = DownloadController::new(
            store.clone(),
            fetcher,
            temp_dir.path().join("dl"),
            global,
            2,
        );
        let handle = controller.clone().start();
        controller.enqueue_eligible().await;

        let store_check = store.clone();
        let done = wait_for(
            || {
                let store = store_check.clone();
                async move {
                    store
                        .with_catalog(|c| c.count_status(MediaStatus::Failed) == 2)
                        .await
                }
            },
            std::time::Duration::from_secs(5),
        )
        .await;
        assert!(done, "entries never failed");

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.get("f0.mp4").unwrap().error, "Échec complet");

        controller.stop(false);
        let _ = handle.scheduler.await;
    }

    #[tokio::test]
    async fn test_successful_download_completes_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_media(&temp_dir, "val", 1).await;
        let fetcher = CountingFetcher::new(std::time::Duration::from_millis(10));
        let global = Arc::new(Semaphore::new(10));

        let controller = DownloadController::new(
            store.clone(),
            fetcher,
            temp_dir.path().join("dl"),
            global,
            2,
        );
        let handle = controller.clone().start();
        assert!(controller.enqueue("f0.mp4").await);

        let store_check = store.clone();
        let done = wait_for(
            || {
                let store = store_check.clone();
                async move {
                    store
                        .with_catalog(|c| c.count_status(MediaStatus::Completed) == 1)
                        .await
                }
            },
            std::time::Duration::from_secs(5),
        )
        .await;
        assert!(done, "entry never completed");

        let snapshot = store.snapshot().await;
        let media = snapshot.get("f0.mp4").unwrap();
        assert_eq!(media.percent, 100);
        assert!(media.error.is_empty());

        controller.stop(false);
        let _ = handle.scheduler.await;
    }

    #[tokio::test]
    async fn test_set_max_concurrent_swaps_ceiling() {
        let temp_dir = TempDir::new().unwrap();
        let store = store_with_media(&temp_dir, "val", 0).await;
        let fetcher = CountingFetcher::new(std::time::Duration::from_millis(10));
        let global = Arc::new(Semaphore::new(10));

        let controller =
            DownloadController::new(store, fetcher, temp_dir.path().join("dl"), global, 2);
        assert_eq!(controller.stats().await.max_concurrent, 2);

        controller.set_max_concurrent(5).await;
        assert_eq!(controller.stats().await.max_concurrent, 5);

        // floor at 1
        controller.set_max_concurrent(0).await;
        assert_eq!(controller.stats().await.max_concurrent, 1);
    }
}
