pub mod controller;
pub mod downloader;
pub mod supervisor;

// Re-export main types
pub use controller::{ControllerHandle, DownloadController};
pub use downloader::{
    DownloadError, DownloadRequest, HttpDownloader, MediaFetcher, ProgressSink,
};
pub use supervisor::RetrySupervisor;
