//! Resumable single-file transfers with CDN fail-over
//!
//! One call drives a media file to disk: iterate the mirror candidates,
//! resume from any `.tmp` partial via a Range request, stream with a
//! per-chunk watchdog, verify size and content hash, then promote the
//! partial with an atomic rename. The rename is the only commit point;
//! everything before it can be retried or resumed.

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{downloads, network};
use crate::utils::fs::{atomic_replace, format_speed};
use crate::utils::hash::verify_cdn_hash;
use crate::utils::url::mirror_urls;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No chunk received within the stall timeout")]
    Stalled,

    #[error("Incomplete transfer: {got}/{want} bytes")]
    Undersized { got: u64, want: u64 },

    #[error("Checksum invalide")]
    ChecksumMismatch,

    #[error("Video failed validation")]
    InvalidVideo,

    #[error("Image failed validation")]
    InvalidImage,

    #[error("Resume rejected, restarting from zero")]
    ResumeRejected,

    #[error("Stopped")]
    Stopped,

    #[error("Échec complet")]
    Exhausted,
}

impl DownloadError {
    /// Verification failures are reported as-is when the retry budget
    /// runs out; transport failures collapse into `Exhausted`.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            Self::Undersized { .. } | Self::ChecksumMismatch | Self::InvalidVideo | Self::InvalidImage
        )
    }
}

/// Everything needed to fetch one media file.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Canonical CDN URL
    pub url: String,
    /// CDN path, whose basename is the expected SHA-256
    pub cdn_path: String,
    /// Where the finished file lands
    pub final_path: PathBuf,
}

impl DownloadRequest {
    /// The resumable sibling: `foo.mp4` -> `foo.mp4.tmp`.
    pub fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .final_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.final_path.with_file_name(name)
    }
}

/// Observer for transfer progress. Implementations must not block; a
/// panicking sink is caught and never disturbs the transfer.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, downloaded: u64, speed: &str, total: u64);

    /// Called before each in-attempt retry; default is to ignore it.
    fn on_retry(&self, _attempt: u32) {}
}

/// No-op sink for callers that do not care.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _downloaded: u64, _speed: &str, _total: u64) {}
}

fn emit_safe(sink: &dyn ProgressSink, downloaded: u64, speed: &str, total: u64) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        sink.on_progress(downloaded, speed, total);
    }));
    if result.is_err() {
        warn!("progress sink panicked; suppressed");
    }
}

/// Seam between the scheduler and the actual transfer, so concurrency
/// behavior is testable without a network.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &DownloadRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError>;
}

/// The real, HTTP-backed fetcher.
pub struct HttpDownloader {
    http: reqwest::Client,
    retry_delay: Duration,
}

impl HttpDownloader {
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_retry_delay(downloads::RETRY_DELAY)
    }

    /// Same downloader with a custom base delay between attempts; tests
    /// pass something tiny.
    pub fn with_retry_delay(retry_delay: Duration) -> Result<Self, DownloadError> {
        let http = reqwest::Client::builder()
            .user_agent(network::USER_AGENT)
            .pool_max_idle_per_host(network::POOL_MAX_IDLE_PER_HOST)
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(network::CONNECT_TIMEOUT)
            .read_timeout(network::READ_TIMEOUT)
            .build()?;

        Ok(Self { http, retry_delay })
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let tmp_path = request.tmp_path();
        if let Some(parent) = request.final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let candidates = mirror_urls(&request.url);
        let mut total_retries = 0u32;
        let mut last_error: Option<DownloadError> = None;

        info!(url = %request.url, dest = %request.final_path.display(), "download starting");

        for candidate in &candidates {
            debug!(candidate = %candidate, "trying CDN node");
            let mut node_retries = 0u32;

            while node_retries < downloads::RETRIES_PER_NODE {
                if cancel.is_cancelled() {
                    return Err(DownloadError::Stopped);
                }

                match self
                    .attempt(candidate, request, &tmp_path, progress, cancel)
                    .await
                {
                    Ok(AttemptOutcome::Done) => return Ok(()),
                    Ok(AttemptOutcome::NextNode) => break,
                    Err(DownloadError::Stopped) => return Err(DownloadError::Stopped),
                    Err(e) => {
                        node_retries += 1;
                        total_retries += 1;
                        warn!(
                            candidate = %candidate,
                            node_retries,
                            total_retries,
                            error = %e,
                            "attempt failed"
                        );

                        if e.is_verification() {
                            discard_small_tmp(&tmp_path).await;
                        }
                        last_error = Some(e);

                        if total_retries >= downloads::TOTAL_RETRIES {
                            return Err(self.final_error(last_error, &tmp_path).await);
                        }
                        let retry_result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                            progress.on_retry(node_retries);
                        }));
                        if retry_result.is_err() {
                            warn!("progress sink panicked on retry; suppressed");
                        }
                        self.backoff(node_retries, cancel).await?;
                    }
                }
            }
        }

        Err(self.final_error(last_error, &tmp_path).await)
    }

    /// One GET against one candidate URL, resume included.
    async fn attempt(
        &self,
        candidate: &str,
        request: &DownloadRequest,
        tmp_path: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<AttemptOutcome, DownloadError> {
        let mut resume_from = match tokio::fs::metadata(tmp_path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut builder = self.http.get(candidate);
        if resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", resume_from));
            debug!(resume_from, "resuming partial");
        }

        let response = builder.send().await?;
        let status = response.status();

        // dead node, move on immediately
        if status == StatusCode::FORBIDDEN || status == StatusCode::NOT_FOUND {
            warn!(candidate, status = status.as_u16(), "CDN node refused, failing over");
            return Ok(AttemptOutcome::NextNode);
        }

        // Range not satisfiable: the partial probably already holds the
        // whole file. Verify it; finalize on success, restart from zero
        // otherwise.
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            if tmp_path.exists() {
                match self.verify(tmp_path, request, 0).await {
                    Ok(()) => {
                        self.finalize(tmp_path, request, progress).await?;
                        return Ok(AttemptOutcome::Done);
                    }
                    Err(e) => {
                        debug!(error = %e, "416 partial failed verification, restarting");
                    }
                }
            }
            tokio::fs::remove_file(tmp_path).await.ok();
            return Err(DownloadError::ResumeRejected);
        }

        if !status.is_success() {
            return Err(DownloadError::Http(
                response.error_for_status().unwrap_err(),
            ));
        }

        // the server ignored our Range: start over cleanly
        if status == StatusCode::OK && resume_from > 0 {
            tokio::fs::remove_file(tmp_path).await.ok();
            resume_from = 0;
        }

        let total = response
            .content_length()
            .map(|len| len + resume_from)
            .unwrap_or(0);

        let mut file = if resume_from > 0 {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(tmp_path)
                .await?
        } else {
            tokio::fs::File::create(tmp_path).await?
        };

        let mut downloaded = resume_from;
        let mut stream = response.bytes_stream();
        let mut last_emit = tokio::time::Instant::now()
            .checked_sub(downloads::PROGRESS_INTERVAL)
            .unwrap_or_else(tokio::time::Instant::now);
        let mut speed_bytes = downloaded;
        let mut speed_at = tokio::time::Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Stopped);
            }

            let chunk = match tokio::time::timeout(downloads::CHUNK_STALL_TIMEOUT, stream.next())
                .await
            {
                Err(_) => return Err(DownloadError::Stalled),
                Ok(Some(Err(e))) => return Err(DownloadError::Http(e)),
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let now = tokio::time::Instant::now();
            if now.duration_since(last_emit) >= downloads::PROGRESS_INTERVAL {
                let elapsed = now.duration_since(speed_at).as_secs_f64();
                let speed = if elapsed > 0.01 {
                    format_speed((downloaded - speed_bytes) as f64 / elapsed)
                } else {
                    "0 B/s".to_string()
                };
                speed_bytes = downloaded;
                speed_at = now;
                emit_safe(progress, downloaded, &speed, total);
                last_emit = now;
            }
        }

        file.flush().await?;
        drop(file);

        self.verify(tmp_path, request, total).await?;
        self.finalize(tmp_path, request, progress).await?;
        Ok(AttemptOutcome::Done)
    }

    /// All checks that must pass before the rename.
    async fn verify(
        &self,
        tmp_path: &Path,
        request: &DownloadRequest,
        total: u64,
    ) -> Result<(), DownloadError> {
        let size = tokio::fs::metadata(tmp_path).await?.len();

        // integer math so a file at exactly the tolerance reliably fails
        let tolerance_pct = (downloads::SIZE_TOLERANCE * 100.0) as u64;
        if total > 0 && size.saturating_mul(100) <= total.saturating_mul(tolerance_pct) {
            return Err(DownloadError::Undersized {
                got: size,
                want: total,
            });
        }

        match verify_cdn_hash(tmp_path, &request.cdn_path).await? {
            Ok(()) => {}
            Err(_actual) => return Err(DownloadError::ChecksumMismatch),
        }

        let name = request
            .final_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();

        if [".mp4", ".webm", ".mkv", ".m4v"]
            .iter()
            .any(|ext| name.ends_with(ext))
            && !is_valid_video(tmp_path).await
        {
            return Err(DownloadError::InvalidVideo);
        }
        if [".jpg", ".jpeg", ".png", ".webp"]
            .iter()
            .any(|ext| name.ends_with(ext))
            && !is_valid_image(tmp_path).await
        {
            return Err(DownloadError::InvalidImage);
        }

        Ok(())
    }

    /// Atomic promotion plus the final 100% progress emission.
    async fn finalize(
        &self,
        tmp_path: &Path,
        request: &DownloadRequest,
        progress: &dyn ProgressSink,
    ) -> Result<(), DownloadError> {
        atomic_replace(tmp_path, &request.final_path).await?;
        let size = tokio::fs::metadata(&request.final_path).await?.len();
        emit_safe(progress, size, "0 B/s", size);
        info!(dest = %request.final_path.display(), size, "download finished");
        Ok(())
    }

    /// Exponential backoff with jitter between attempts, abortable.
    async fn backoff(&self, attempt: u32, cancel: &CancellationToken) -> Result<(), DownloadError> {
        let exp = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self
            .retry_delay
            .checked_mul(exp)
            .unwrap_or(downloads::BACKOFF_CAP)
            .min(downloads::BACKOFF_CAP);
        let jitter = 0.8 + 0.4 * rand::thread_rng().gen::<f64>();
        let delay = delay.mul_f64(jitter);

        tokio::select! {
            _ = cancel.cancelled() => Err(DownloadError::Stopped),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Error reported after the budget is spent: the last verification
    /// failure if there was one, otherwise the blanket exhaustion. Tiny
    /// partials are not worth keeping around for inspection.
    async fn final_error(
        &self,
        last_error: Option<DownloadError>,
        tmp_path: &Path,
    ) -> DownloadError {
        discard_small_tmp(tmp_path).await;
        match last_error {
            Some(e) if e.is_verification() => e,
            _ => DownloadError::Exhausted,
        }
    }
}

enum AttemptOutcome {
    Done,
    NextNode,
}

#[async_trait]
impl MediaFetcher for HttpDownloader {
    async fn fetch(
        &self,
        request: &DownloadRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        self.run(request, progress, cancel).await
    }
}

/// Remove a failed partial only when it is too small to be worth keeping.
async fn discard_small_tmp(tmp_path: &Path) {
    if let Ok(meta) = tokio::fs::metadata(tmp_path).await {
        if meta.len() < downloads::TMP_KEEP_THRESHOLD {
            tokio::fs::remove_file(tmp_path).await.ok();
        }
    }
}

/// ffprobe-based container check; skipped when ffprobe is not installed.
async fn is_valid_video(path: &Path) -> bool {
    let result = tokio::process::Command::new("ffprobe")
        .args(["-v", "error", "-show_format", "-show_streams"])
        .arg(path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await;

    match result {
        Ok(status) => status.success(),
        // validator unavailable: skip the check
        Err(_) => true,
    }
}

/// Decode check through the image crate.
async fn is_valid_image(path: &Path) -> bool {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || image::open(&path).is_ok())
        .await
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &TempDir, name: &str, cdn_path: &str) -> DownloadRequest {
        DownloadRequest {
            url: crate::utils::url::build_media_url(cdn_path),
            cdn_path: cdn_path.to_string(),
            final_path: dir.path().join(name),
        }
    }

    #[test]
    fn test_tmp_path_appends_suffix() {
        let temp_dir = TempDir::new().unwrap();
        let req = request(&temp_dir, "foo.mp4", "/data/x/abc.mp4");
        assert_eq!(
            req.tmp_path().file_name().unwrap().to_str().unwrap(),
            "foo.mp4.tmp"
        );
    }

    #[tokio::test]
    async fn test_verify_size_boundary() {
        let temp_dir = TempDir::new().unwrap();
        let downloader = HttpDownloader::with_retry_delay(Duration::from_millis(1)).unwrap();

        // sha256("hello") as the expected digest so the hash check passes
        let cdn = "/data/x/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.bin";
        let req = request(&temp_dir, "out.bin", cdn);

        // exactly 95% of 1000 declared bytes -> still incomplete
        std::fs::write(req.tmp_path(), vec![0u8; 950]).unwrap();
        let err = downloader.verify(&req.tmp_path(), &req, 1000).await.unwrap_err();
        assert!(matches!(err, DownloadError::Undersized { got: 950, want: 1000 }));

        // one byte past the threshold -> verification proceeds to the hash
        std::fs::write(req.tmp_path(), vec![0u8; 951]).unwrap();
        let err = downloader.verify(&req.tmp_path(), &req, 1000).await.unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn test_verify_hash_pass() {
        let temp_dir = TempDir::new().unwrap();
        let downloader = HttpDownloader::with_retry_delay(Duration::from_millis(1)).unwrap();

        let cdn = "/data/x/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.bin";
        let req = request(&temp_dir, "out.bin", cdn);
        std::fs::write(req.tmp_path(), b"hello").unwrap();

        downloader.verify(&req.tmp_path(), &req, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_final_error_prefers_verification_failure() {
        let temp_dir = TempDir::new().unwrap();
        let downloader = HttpDownloader::with_retry_delay(Duration::from_millis(1)).unwrap();
        let tmp = temp_dir.path().join("x.tmp");

        let err = downloader
            .final_error(Some(DownloadError::ChecksumMismatch), &tmp)
            .await;
        assert_eq!(err.to_string(), "Checksum invalide");

        let err = downloader.final_error(Some(DownloadError::Stalled), &tmp).await;
        assert_eq!(err.to_string(), "Échec complet");

        let err = downloader.final_error(None, &tmp).await;
        assert_eq!(err.to_string(), "Échec complet");
    }

    #[tokio::test]
    async fn test_small_tmp_discarded_large_kept() {
        let temp_dir = TempDir::new().unwrap();

        let small = temp_dir.path().join("small.tmp");
        std::fs::write(&small, vec![0u8; 512]).unwrap();
        discard_small_tmp(&small).await;
        assert!(!small.exists());

        let large = temp_dir.path().join("large.tmp");
        std::fs::write(&large, vec![0u8; 4096]).unwrap();
        discard_small_tmp(&large).await;
        assert!(large.exists());
    }

    #[test]
    fn test_progress_sink_panic_is_contained() {
        struct PanickingSink;
        impl ProgressSink for PanickingSink {
            fn on_progress(&self, _: u64, _: &str, _: u64) {
                panic!("observer bug");
            }
        }

        emit_safe(&PanickingSink, 1, "0 B/s", 2);
    }

    #[tokio::test]
    async fn test_image_validation_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("fake.jpg");
        std::fs::write(&path, b"definitely not a jpeg").unwrap();
        assert!(!is_valid_image(&path).await);
    }
}
