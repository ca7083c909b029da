//! Application-wide constants
//!
//! This module centralizes magic numbers and configuration defaults used throughout
//! the application, making them easier to maintain and understand.

use std::time::Duration;

/// Network-related constants
pub mod network {
    use super::*;

    /// Timeout for establishing a connection
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Timeout for reading from an established connection
    pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

    /// Connection-pool size for the shared clients
    pub const POOL_MAX_IDLE_PER_HOST: usize = 32;

    /// User agent string for HTTP requests
    pub const USER_AGENT: &str = concat!("coomer-dl/", env!("CARGO_PKG_VERSION"));

    /// The site currently refuses API requests without this Accept value
    pub const API_ACCEPT: &str = "text/css";

    /// Retry budget for a single API request on 429/5xx or socket errors
    pub const API_RETRIES: u32 = 4;

    /// Base delay before the first API retry
    pub const API_BACKOFF_BASE: Duration = Duration::from_secs(2);

    /// Multiplier applied to the API backoff after each attempt
    pub const API_BACKOFF_FACTOR: f64 = 1.6;

    /// Hard cap on any single API retry delay, Retry-After included
    pub const API_BACKOFF_CAP: Duration = Duration::from_secs(30);
}

/// CDN topology
pub mod cdn {
    /// Primary CDN host
    pub const BASE_HOST: &str = "coomer.st";

    /// Mirror subdomains serving identical content
    pub const MIRRORS: &[&str] = &["n1", "n2", "n3", "n4"];
}

/// Pagination constants
pub mod pagination {
    use super::*;

    /// Retry budget for a single page fetch
    pub const PAGE_RETRIES: u32 = 6;

    /// Base delay before the first page retry
    pub const PAGE_BACKOFF_BASE: Duration = Duration::from_secs(2);

    /// Multiplier applied after each page retry
    pub const PAGE_BACKOFF_FACTOR: f64 = 1.6;

    /// Hard cap on a page retry delay
    pub const PAGE_BACKOFF_CAP: Duration = Duration::from_secs(20);

    /// Fixed pause between successive pages
    pub const PAGE_SLEEP: Duration = Duration::from_millis(200);

    /// Upper bound of the random jitter added to the inter-page pause
    pub const PAGE_SLEEP_JITTER: Duration = Duration::from_millis(250);
}

/// Download configuration constants
pub mod downloads {
    use super::*;

    /// Chunk size for streaming downloads (8 KiB)
    pub const CHUNK_SIZE: usize = 8192;

    /// Abort the attempt when no chunk arrives within this window
    pub const CHUNK_STALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Retry budget against a single CDN mirror
    pub const RETRIES_PER_NODE: u32 = 3;

    /// Retry budget across all mirrors combined
    pub const TOTAL_RETRIES: u32 = 8;

    /// Base delay between download attempts
    pub const RETRY_DELAY: Duration = Duration::from_secs(10);

    /// Hard cap on the exponential backoff between attempts
    pub const BACKOFF_CAP: Duration = Duration::from_secs(30);

    /// Minimum interval between progress emissions
    pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

    /// A transfer shorter than this fraction of the declared size is incomplete
    pub const SIZE_TOLERANCE: f64 = 0.95;

    /// Failed partials smaller than this are deleted rather than kept
    pub const TMP_KEEP_THRESHOLD: u64 = 1024;
}

/// Scheduler constants
pub mod scheduler {
    use super::*;

    /// Scheduler loop tick
    pub const TICK: Duration = Duration::from_millis(50);

    /// Consecutive idle ticks before a single diagnostic is logged
    pub const IDLE_DIAGNOSTIC_TICKS: u32 = 100;

    /// Default per-profile parallelism ceiling
    pub const DEFAULT_MAX_CONCURRENT: usize = 25;

    /// Default process-wide parallelism ceiling
    pub const DEFAULT_GLOBAL_MAX: usize = 50;

    /// Environment variable overriding the process-wide ceiling
    pub const GLOBAL_MAX_ENV: &str = "CU_GLOBAL_MAX";

    /// Queue non-empty but nothing active for this long triggers a kick
    pub const WATCHDOG_STALL: Duration = Duration::from_secs(30);
}

/// Retry supervisor constants
pub mod supervisor {
    use super::*;

    /// Interval between catalog scans for Failed entries
    pub const SCAN_INTERVAL: Duration = Duration::from_secs(10);

    /// Give up on an entry after this many long-term re-enqueues
    pub const EXTERNAL_RETRY_LIMIT: u32 = 10;

    /// Delay before a Failed entry becomes eligible again
    pub const EXTERNAL_RETRY_DELAY: Duration = Duration::from_secs(60);

    /// At most this many re-enqueues per pass, to avoid spikes
    pub const MAX_PER_PASS: usize = 5;
}

/// Storage-related constants
pub mod storage {
    /// Temporary file suffix for atomic writes and partial downloads
    pub const TEMP_FILE_SUFFIX: &str = "tmp";

    /// Catalog directory relative to the working directory
    pub const DATA_DIR: &str = "data";

    /// Settings file name
    pub const SETTINGS_FILE: &str = "settings.json";

    /// Default base directory for downloaded files
    pub const DEFAULT_DOWNLOAD_DIR: &str = "downloads";

    /// Subdirectory for videos
    pub const VIDEO_SUBDIR: &str = "v";

    /// Subdirectory for images
    pub const IMAGE_SUBDIR: &str = "p";

    /// Subdirectory for everything else
    pub const OTHER_SUBDIR: &str = "o";
}
