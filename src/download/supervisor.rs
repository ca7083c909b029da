//! Long-term requeue of permanently failed items
//!
//! Workers exhaust their own in-attempt budget before marking an entry
//! Failed; this supervisor gives those entries another life on a slow
//! cadence, bounded per pass so a flaky CDN cannot flood the queue.
//! The media's `retry_count` is the authoritative re-enqueue counter and
//! bounds the total number of lives; the in-memory metadata only paces
//! them, and is reset whenever an entry leaves Failed.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::models::MediaStatus;
use crate::catalog::store::ProfileStore;
use crate::constants::supervisor;
use crate::download::controller::DownloadController;
use crate::download::downloader::MediaFetcher;

/// Scans one profile's catalog for Failed entries and re-enqueues the
/// eligible ones with long-term backoff.
pub struct RetrySupervisor<F: MediaFetcher + 'static> {
    store: Arc<ProfileStore>,
    controller: Arc<DownloadController<F>>,
    next_at: Mutex<HashMap<String, tokio::time::Instant>>,
    shutdown: CancellationToken,
}

impl<F: MediaFetcher + 'static> RetrySupervisor<F> {
    pub fn new(store: Arc<ProfileStore>, controller: Arc<DownloadController<F>>) -> Arc<Self> {
        Arc::new(Self {
            store,
            controller,
            next_at: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let this = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(supervisor::SCAN_INTERVAL) => {}
                    _ = this.shutdown.cancelled() => break,
                }
                this.scan_once().await;
            }
        })
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// One pass: drop pacing metadata for entries that left Failed, then
    /// re-enqueue up to the per-pass budget of due entries.
    pub async fn scan_once(&self) -> usize {
        let failed: Vec<(String, u32)> = self
            .store
            .with_catalog(|catalog| {
                catalog
                    .medias
                    .iter()
                    .filter(|m| m.status == MediaStatus::Failed)
                    .map(|m| (m.name.clone(), m.retry_count))
                    .collect()
            })
            .await;

        let mut next_at = self.next_at.lock().await;
        next_at.retain(|name, _| failed.iter().any(|(f, _)| f == name));

        let now = tokio::time::Instant::now();
        let mut pushed = 0usize;

        for (name, retry_count) in &failed {
            if pushed >= supervisor::MAX_PER_PASS {
                break;
            }
            if *retry_count >= supervisor::EXTERNAL_RETRY_LIMIT {
                continue;
            }
            if next_at.get(name).is_some_and(|due| now < *due) {
                continue;
            }

            let _ = self
                .store
                .update_media(name, |m| m.retry_count += 1)
                .await;

            if self.controller.enqueue(name).await {
                next_at.insert(name.clone(), now + supervisor::EXTERNAL_RETRY_DELAY);
                pushed += 1;
                debug!(name = %name, retry_count = retry_count + 1, "failed entry re-enqueued");
            } else {
                // enqueue refused (already queued or raced); undo the count
                let _ = self
                    .store
                    .update_media(name, |m| m.retry_count = m.retry_count.saturating_sub(1))
                    .await;
            }
        }

        if pushed > 0 {
            info!(profile = %self.store.key(), pushed, "retry supervisor pass");
        }
        pushed
    }
}
