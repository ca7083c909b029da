pub mod client;
pub mod models;
pub mod pager;

// Re-export main types
pub use client::{ApiClient, ApiError};
pub use models::{parse_posts, Post, PostFile};
pub use pager::{PageMode, PostFetcher, PostPager};
