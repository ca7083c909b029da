//! Parallelism ceilings across profiles sharing one process-wide limit.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use coomer_dl::catalog::{Media, ProfileKey, ProfileStore};
use coomer_dl::download::{
    DownloadController, DownloadError, DownloadRequest, MediaFetcher, ProgressSink,
};
use coomer_dl::events::EventBus;

/// Tracks concurrency per profile (by path component) and globally.
struct Meter {
    global_current: AtomicUsize,
    global_peak: AtomicUsize,
    per_profile: std::sync::Mutex<std::collections::HashMap<String, (usize, usize)>>,
    completed: AtomicUsize,
}

impl Meter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            global_current: AtomicUsize::new(0),
            global_peak: AtomicUsize::new(0),
            per_profile: std::sync::Mutex::new(std::collections::HashMap::new()),
            completed: AtomicUsize::new(0),
        })
    }

    fn profile_peak(&self, profile: &str) -> usize {
        self.per_profile
            .lock()
            .unwrap()
            .get(profile)
            .map(|(_, peak)| *peak)
            .unwrap_or(0)
    }
}

struct MeteredFetcher {
    meter: Arc<Meter>,
    profile: String,
}

#[async_trait]
impl MediaFetcher for MeteredFetcher {
    async fn fetch(
        &self,
        _request: &DownloadRequest,
        _progress: &dyn ProgressSink,
        _cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let now = self.meter.global_current.fetch_add(1, Ordering::SeqCst) + 1;
        self.meter.global_peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut map = self.meter.per_profile.lock().unwrap();
            let entry = map.entry(self.profile.clone()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;

        self.meter.global_current.fetch_sub(1, Ordering::SeqCst);
        {
            let mut map = self.meter.per_profile.lock().unwrap();
            if let Some(entry) = map.get_mut(&self.profile) {
                entry.0 -= 1;
            }
        }
        self.meter.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

async fn store_with_media(
    data_dir: &std::path::Path,
    username: &str,
    count: usize,
) -> Arc<ProfileStore> {
    let store = ProfileStore::open(
        data_dir,
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

#[tokio::test]
async fn global_and_per_profile_ceilings_hold() {
    let temp_dir = TempDir::new().unwrap();
    let meter = Meter::new();
    let global = Arc::new(Semaphore::new(5));

    let store_a = store_with_media(temp_dir.path(), "alpha", 25).await;
    let store_b = store_with_media(temp_dir.path(), "bravo", 25).await;

    let ctrl_a = DownloadController::new(
        store_a,
        Arc::new(MeteredFetcher {
            meter: meter.clone(),
            profile: "alpha".to_string(),
        }),
        temp_dir.path().join("dl").join("alpha"),
        global.clone(),
        2,
    );
    let ctrl_b = DownloadController::new(
        store_b,
        Arc::new(MeteredFetcher {
            meter: meter.clone(),
            profile: "bravo".to_string(),
        }),
        temp_dir.path().join("dl").join("bravo"),
        global.clone(),
        10,
    );

    let handle_a = ctrl_a.clone().start();
    let handle_b = ctrl_b.clone().start();
    assert_eq!(ctrl_a.enqueue_eligible().await, 25);
    assert_eq!(ctrl_b.enqueue_eligible().await, 25);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
    while meter.completed.load(Ordering::SeqCst) < 50 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "queues never drained: {}",
            meter.completed.load(Ordering::SeqCst)
        );
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }

    assert!(meter.global_peak.load(Ordering::SeqCst) <= 5);
    assert!(meter.profile_peak("alpha") <= 2);
    assert!(meter.profile_peak("bravo") <= 5);

    ctrl_a.stop(false);
    ctrl_b.stop(false);
    let _ = handle_a.scheduler.await;
    let _ = handle_b.scheduler.await;
}

#[tokio::test]
async fn fifo_order_within_one_profile() {
    let temp_dir = TempDir::new().unwrap();

    struct OrderFetcher {
        order: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaFetcher for OrderFetcher {
        async fn fetch(
            &self,
            request: &DownloadRequest,
            _progress: &dyn ProgressSink,
            _cancel: &CancellationToken,
        ) -> Result<(), DownloadError> {
            let name = request
                .final_path
                .file_name()
                .unwrap()
                .to_string_lossy()
                .to_string();
            self.order.lock().unwrap().push(name);
            Ok(())
        }
    }

    let store = store_with_media(temp_dir.path(), "alpha", 8).await;
    let fetcher = Arc::new(OrderFetcher {
        order: std::sync::Mutex::new(Vec::new()),
    });
    // one worker at a time makes dispatch order observable
    let ctrl = DownloadController::new(
        store,
        fetcher.clone(),
        temp_dir.path().join("dl"),
        Arc::new(Semaphore::new(1)),
        1,
    );

    let handle = ctrl.clone().start();
    for i in 0..8 {
        assert!(ctrl.enqueue(&format!("f{}.mp4", i)).await);
    }

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
    while fetcher.order.lock().unwrap().len() < 8 {
        assert!(tokio::time::Instant::now() < deadline, "queue never drained");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    let order = fetcher.order.lock().unwrap().clone();
    let expected: Vec<String> = (0..8).map(|i| format!("f{}.mp4", i)).collect();
    assert_eq!(order, expected);

    ctrl.stop(false);
    let _ = handle.scheduler.await;
}
