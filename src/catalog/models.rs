use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::constants::storage::{IMAGE_SUBDIR, OTHER_SUBDIR, VIDEO_SUBDIR};

/// Identity of one tracked profile: a `(service, username)` pair.
///
/// Names both the catalog file `data/<service>/<username>.json` and the
/// download tree `<base>/<service>/<username>/{v,p,o}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileKey {
    pub service: String,
    pub username: String,
}

impl ProfileKey {
    pub fn new(service: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            username: username.into(),
        }
    }

    /// Parse the `"service:username"` form used in settings.
    pub fn parse(s: &str) -> Option<Self> {
        let (service, username) = s.split_once(':')?;
        if service.is_empty() || username.is_empty() {
            return None;
        }
        Some(Self::new(service, username))
    }

    /// Parse a profile page URL.
    pub fn from_url(url: &str) -> Option<Self> {
        let (service, username) = crate::utils::url::extract_profile_info(url)?;
        Some(Self::new(service, username))
    }
}

impl std::fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service, self.username)
    }
}

/// Media category, derived from the file extension at ingest time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Image,
    Other,
}

impl MediaType {
    /// Classify a filename by extension.
    pub fn from_name(name: &str) -> Self {
        let ext = name
            .rsplit('.')
            .next()
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "mp4" | "m4v" | "mov" | "webm" | "avi" | "mkv" | "flv" => Self::Video,
            "jpg" | "jpeg" | "png" | "webp" | "gif" => Self::Image,
            _ => Self::Other,
        }
    }

    /// The subdirectory this category lands in under the profile root.
    pub fn subdir(&self) -> &'static str {
        match self {
            Self::Video => VIDEO_SUBDIR,
            Self::Image => IMAGE_SUBDIR,
            Self::Other => OTHER_SUBDIR,
        }
    }
}

impl Default for MediaType {
    fn default() -> Self {
        Self::Other
    }
}

/// Per-media lifecycle state.
///
/// `Ignored` is sticky: the restore scanner never overrides it, only an
/// explicit unignore transitions out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaStatus {
    /// Known from the API, nothing on disk
    Missing,
    /// Enqueued, waiting for a worker slot
    Waiting,
    /// A worker is transferring it
    Downloading,
    /// Transient failure inside the attempt budget
    Retrying,
    /// Stopped with a resumable partial (or normalized at boot)
    Paused,
    /// On disk, verified
    Completed,
    /// All attempts exhausted
    Failed,
    /// On disk but failed verification
    Incomplete,
    /// User-asserted final state, immune to restore
    Ignored,
}

impl MediaStatus {
    /// Statuses eligible for enqueueing.
    pub fn is_queueable(&self) -> bool {
        matches!(
            self,
            Self::Missing | Self::Paused | Self::Failed | Self::Incomplete
        )
    }

    /// Statuses normalized to `Paused` at boot and shutdown.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Downloading | Self::Retrying | Self::Waiting)
    }

    /// Total transition function. Invalid transitions return an error,
    /// never silently mutate.
    pub fn transition(self, to: MediaStatus) -> Result<MediaStatus, TransitionError> {
        use MediaStatus::*;

        let allowed = match (self, to) {
            // no-op transitions are always fine
            (a, b) if a == b => true,
            // anything can be ignored by the user
            (_, Ignored) => true,
            // unignore resolves to Missing or Completed depending on disk
            (Ignored, Missing) | (Ignored, Completed) => true,
            (Ignored, _) => false,
            // enqueue
            (Missing, Waiting) | (Paused, Waiting) | (Failed, Waiting) | (Incomplete, Waiting) => {
                true
            }
            // force-retry a finished file
            (Completed, Waiting) => true,
            // dispatch
            (Waiting, Downloading) => true,
            // worker outcomes; Failed is only reachable through Retrying
            (Downloading, Completed) | (Downloading, Retrying) | (Downloading, Paused) => true,
            (Retrying, Downloading) | (Retrying, Failed) | (Retrying, Paused) => true,
            // queued entries can be paused before dispatch
            (Waiting, Paused) => true,
            _ => false,
        };

        if allowed {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }
}

impl Default for MediaStatus {
    fn default() -> Self {
        Self::Missing
    }
}

impl std::fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Missing => "Missing",
            Self::Waiting => "Waiting",
            Self::Downloading => "Downloading",
            Self::Retrying => "Retrying",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Incomplete => "Incomplete",
            Self::Ignored => "Ignored",
        };
        write!(f, "{}", s)
    }
}

/// Rejected status transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: MediaStatus,
    pub to: MediaStatus,
}

/// One media item of a profile catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: String,
    /// Filename, unique within a catalog
    pub name: String,
    pub cdn_path: String,
    pub url: String,
    #[serde(rename = "type", default)]
    pub media_type: MediaType,
    #[serde(default)]
    pub status: MediaStatus,
    /// Bytes currently on disk, across either `.tmp` or the final file
    #[serde(default)]
    pub local_size: u64,
    /// Remote size; monotonic non-decreasing once observed
    #[serde(default)]
    pub size_http: u64,
    #[serde(default)]
    pub percent: u8,
    /// Opaque verification diagnostic; empty means OK or not yet checked
    #[serde(default)]
    pub hash_check: String,
    /// Last error message; empty outside Failed
    #[serde(default)]
    pub error: String,
    /// Long-term re-enqueue counter, distinct from in-attempt retries
    #[serde(default)]
    pub retry_count: u32,
    /// Display-only last reported transfer rate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
}

impl Media {
    pub fn new(id: impl Into<String>, name: impl Into<String>, cdn_path: impl Into<String>) -> Self {
        let name = name.into();
        let cdn_path = cdn_path.into();
        let media_type = MediaType::from_name(&name);
        let url = crate::utils::url::build_media_url(&cdn_path);
        Self {
            id: id.into(),
            name,
            cdn_path,
            url,
            media_type,
            status: MediaStatus::Missing,
            local_size: 0,
            size_http: 0,
            percent: 0,
            hash_check: String::new(),
            error: String::new(),
            retry_count: 0,
            speed: None,
        }
    }

    /// Record observed progress, keeping `size_http` monotonic and
    /// `percent` derived.
    pub fn record_progress(&mut self, local_size: u64, total: u64, speed: Option<String>) {
        self.local_size = local_size;
        if total > self.size_http {
            self.size_http = total;
        }
        self.percent = Self::percent_of(local_size, self.size_http);
        if let Some(speed) = speed {
            self.speed = Some(speed);
        }
    }

    /// Derived completion percentage, clamped to 0..=100.
    pub fn percent_of(local: u64, total: u64) -> u8 {
        if total == 0 {
            return 0;
        }
        ((local.saturating_mul(100)) / total).min(100) as u8
    }

    /// Zero all progress-tracking fields.
    pub fn reset_progress(&mut self) {
        self.local_size = 0;
        self.percent = 0;
        self.hash_check.clear();
        self.speed = None;
    }

    /// Attempt a status transition through the state machine.
    pub fn set_status(&mut self, to: MediaStatus) -> Result<(), TransitionError> {
        self.status = self.status.transition(to)?;
        if self.status != MediaStatus::Failed {
            self.error.clear();
        }
        Ok(())
    }

    /// Final path of this media under a profile directory.
    pub fn final_path(&self, profile_dir: &std::path::Path) -> PathBuf {
        profile_dir.join(self.media_type.subdir()).join(&self.name)
    }
}

/// The authoritative per-profile record of known media and their states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub medias: Vec<Media>,
    pub last_update: DateTime<Utc>,
    pub profile_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_dir: Option<PathBuf>,
}

impl Catalog {
    pub fn new(profile_name: impl Into<String>) -> Self {
        Self {
            medias: Vec::new(),
            last_update: Utc::now(),
            profile_name: profile_name.into(),
            custom_dir: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_update = Utc::now();
    }

    pub fn get(&self, name: &str) -> Option<&Media> {
        self.medias.iter().find(|m| m.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Media> {
        self.medias.iter_mut().find(|m| m.name == name)
    }

    /// Insert or update by `name`, preserving the unique-name invariant.
    pub fn upsert(&mut self, media: Media) {
        match self.get_mut(&media.name) {
            Some(existing) => *existing = media,
            None => self.medias.push(media),
        }
    }

    /// Insert only if no entry carries that name yet. Returns whether the
    /// entry was added.
    pub fn insert_new(&mut self, media: Media) -> bool {
        if self.get(&media.name).is_some() {
            return false;
        }
        self.medias.push(media);
        true
    }

    /// Names of all entries currently `Ignored`; taken before a restore
    /// scan and re-applied after.
    pub fn ignored_names(&self) -> Vec<String> {
        self.medias
            .iter()
            .filter(|m| m.status == MediaStatus::Ignored)
            .map(|m| m.name.clone())
            .collect()
    }

    /// Count entries per status.
    pub fn count_status(&self, status: MediaStatus) -> usize {
        self.medias.iter().filter(|m| m.status == status).count()
    }
}
