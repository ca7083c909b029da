//! Paginated media enumeration
//!
//! The posts API paginates, but not consistently across services: some
//! profiles answer `before_id`, others `max_id`, a timestamp cursor, page
//! numbers (0- or 1-indexed), or a raw offset. After page 1 the pager
//! probes the known modes in order of robustness and caches the first one
//! that yields unseen posts for the rest of the session.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashSet;
use tracing::{debug, info, warn};

use crate::api::client::{build_url, ApiClient, ApiError};
use crate::api::models::{parse_posts, Post};
use crate::catalog::models::Media;
use crate::constants::pagination;
use crate::utils::hash::cdn_path_hash;
use crate::utils::url::{posts_endpoint, profile_page};

/// Seam between the pager and HTTP, so pagination logic is testable
/// without a network.
#[async_trait]
pub trait PostFetcher: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<Vec<Post>, ApiError>;
}

#[async_trait]
impl<T: PostFetcher + ?Sized> PostFetcher for std::sync::Arc<T> {
    async fn fetch_page(&self, url: &str) -> Result<Vec<Post>, ApiError> {
        (**self).fetch_page(url).await
    }
}

#[async_trait]
impl PostFetcher for ApiClient {
    async fn fetch_page(&self, url: &str) -> Result<Vec<Post>, ApiError> {
        let referer = referer_for(url);
        let body = self.get_json(url, &referer).await?;
        parse_posts(body)
    }
}

/// Derive the profile page (used as Referer) from a posts API URL.
fn referer_for(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        let segments: Vec<&str> = parsed.path().trim_matches('/').split('/').collect();
        // api / v1 / <service> / user / <username> / posts
        if segments.len() >= 5 && segments[0] == "api" && segments[3] == "user" {
            return profile_page(segments[2], segments[4]);
        }
    }
    format!("https://{}", crate::constants::cdn::BASE_HOST)
}

/// Detected pagination mode, cached per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    BeforeId,
    MaxId,
    Before,
    Page,
    Offset,
}

impl std::fmt::Display for PageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BeforeId => "before_id",
            Self::MaxId => "max_id",
            Self::Before => "before",
            Self::Page => "page",
            Self::Offset => "offset",
        };
        write!(f, "{}", s)
    }
}

/// Lazy, finite sequence of normalized media pages for one profile.
pub struct PostPager<F: PostFetcher> {
    fetcher: F,
    base: String,
    seen_ids: HashSet<String>,
    seen_keys: HashSet<String>,
    mode: Option<PageMode>,
    page_no: u32,
    last_id: Option<String>,
    last_ts: Option<String>,
    started: bool,
    finished: bool,
}

impl<F: PostFetcher> PostPager<F> {
    pub fn new(fetcher: F, service: &str, username: &str) -> Self {
        Self {
            fetcher,
            base: posts_endpoint(service, username),
            seen_ids: HashSet::new(),
            seen_keys: HashSet::new(),
            mode: None,
            page_no: 1,
            last_id: None,
            last_ts: None,
            started: false,
            finished: false,
        }
    }

    /// The pagination mode adopted after page 1, once detected.
    pub fn mode(&self) -> Option<PageMode> {
        self.mode
    }

    /// Publication instant of the most recently processed post. Pages
    /// arrive newest-first, so this is the oldest point reached so far.
    pub fn last_timestamp_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        crate::api::models::parse_timestamp_utc(self.last_ts.as_deref()?)
    }

    /// Fetch and normalize the next page. `Ok(None)` once exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Media>>, ApiError> {
        if self.finished {
            return Ok(None);
        }

        if !self.started {
            self.started = true;
            let url = build_url(&self.base, &[]);
            let posts = self.fetcher.fetch_page(&url).await?;
            if posts.is_empty() {
                info!("no posts on page 1");
                self.finished = true;
                return Ok(None);
            }
            let (medias, new_ids) = self.normalize(&posts);
            if new_ids == 0 {
                self.finished = true;
            }
            return Ok(Some(medias));
        }

        if self.mode.is_none() {
            return self.detect_mode().await;
        }

        let url = self.next_url();
        let posts = self.fetch_resilient(&url).await?;
        if posts.is_empty() {
            self.finished = true;
            return Ok(None);
        }

        let (medias, new_ids) = self.normalize(&posts);
        if new_ids == 0 {
            self.finished = true;
            return Ok(None);
        }
        Ok(Some(medias))
    }

    /// Drain every page, pausing briefly between them. On a terminal
    /// failure the medias gathered so far are returned alongside the
    /// error so the caller can persist the partial catalog.
    pub async fn fetch_all(&mut self) -> (Vec<Media>, Option<ApiError>) {
        let mut all = Vec::new();
        loop {
            match self.next_page().await {
                Ok(Some(medias)) => {
                    all.extend(medias);
                    let jitter_ms = rand::thread_rng()
                        .gen_range(0..=pagination::PAGE_SLEEP_JITTER.as_millis() as u64);
                    tokio::time::sleep(
                        pagination::PAGE_SLEEP + std::time::Duration::from_millis(jitter_ms),
                    )
                    .await;
                }
                Ok(None) => return (all, None),
                Err(e) => {
                    warn!(error = %e, "pagination terminated early");
                    return (all, Some(e));
                }
            }
        }
    }

    /// Probe candidate URLs in robustness order; adopt the first that
    /// returns at least one unseen post id.
    async fn detect_mode(&mut self) -> Result<Option<Vec<Media>>, ApiError> {
        let candidates = self.candidates();

        for (url, mode, page_no) in candidates {
            let posts = match self.fetcher.fetch_page(&url).await {
                Ok(posts) => posts,
                Err(_) => continue,
            };
            if posts.is_empty() {
                continue;
            }
            let any_unseen = posts
                .iter()
                .filter_map(|p| p.id_str())
                .any(|id| !self.seen_ids.contains(&id));
            if !any_unseen {
                continue;
            }

            info!(mode = %mode, posts = posts.len(), "pagination mode detected");
            self.mode = Some(mode);
            self.page_no = page_no;
            let (medias, _) = self.normalize(&posts);
            return Ok(Some(medias));
        }

        debug!("no further pages detected, enumeration complete");
        self.finished = true;
        Ok(None)
    }

    /// Candidate URLs for page 2, most robust first.
    fn candidates(&self) -> Vec<(String, PageMode, u32)> {
        let mut candidates = Vec::new();

        if let Some(last_id) = &self.last_id {
            candidates.push((
                build_url(&self.base, &[("before_id", last_id.clone())]),
                PageMode::BeforeId,
                2,
            ));
            candidates.push((
                build_url(&self.base, &[("max_id", last_id.clone())]),
                PageMode::MaxId,
                2,
            ));
        }
        if let Some(last_ts) = &self.last_ts {
            candidates.push((
                build_url(&self.base, &[("before", last_ts.clone())]),
                PageMode::Before,
                2,
            ));
        }

        // some profiles index the second page as 1
        candidates.push((
            build_url(&self.base, &[("page", "2".to_string())]),
            PageMode::Page,
            2,
        ));
        candidates.push((
            build_url(&self.base, &[("page", "1".to_string())]),
            PageMode::Page,
            1,
        ));

        candidates.push((
            build_url(&self.base, &[("o", self.seen_ids.len().to_string())]),
            PageMode::Offset,
            2,
        ));

        candidates
    }

    /// URL for the page after the current one, per the adopted mode.
    fn next_url(&mut self) -> String {
        match self.mode.expect("next_url requires a detected mode") {
            PageMode::BeforeId => build_url(
                &self.base,
                &[("before_id", self.last_id.clone().unwrap_or_default())],
            ),
            PageMode::MaxId => build_url(
                &self.base,
                &[("max_id", self.last_id.clone().unwrap_or_default())],
            ),
            PageMode::Before => build_url(
                &self.base,
                &[("before", self.last_ts.clone().unwrap_or_default())],
            ),
            PageMode::Page => {
                self.page_no += 1;
                build_url(&self.base, &[("page", self.page_no.to_string())])
            }
            PageMode::Offset => build_url(&self.base, &[("o", self.seen_ids.len().to_string())]),
        }
    }

    /// Fetch a page with the aggressive per-page retry budget.
    async fn fetch_resilient(&self, url: &str) -> Result<Vec<Post>, ApiError> {
        let mut delay = pagination::PAGE_BACKOFF_BASE;
        let mut last_error = None;

        for attempt in 0..pagination::PAGE_RETRIES {
            match self.fetcher.fetch_page(url).await {
                Ok(posts) => return Ok(posts),
                Err(e) if e.is_transient() => {
                    warn!(url, attempt, error = %e, "page fetch failed, retrying");
                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                    delay = delay
                        .mul_f64(pagination::PAGE_BACKOFF_FACTOR)
                        .min(pagination::PAGE_BACKOFF_CAP);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(ApiError::Status(0)))
    }

    /// Flatten a page of posts into deduplicated media entries, advancing
    /// the pagination cursors. Returns the entries plus how many post ids
    /// were new.
    fn normalize(&mut self, posts: &[Post]) -> (Vec<Media>, usize) {
        let mut medias = Vec::new();
        let mut new_ids = 0usize;
        let mut skipped = 0usize;

        for post in posts {
            let post_id = match post.id_str() {
                Some(id) => id,
                None => continue,
            };

            // cursors advance on every post, seen or not
            self.last_id = Some(post_id.clone());
            if let Some(ts) = post.timestamp() {
                self.last_ts = Some(ts.to_string());
            }

            if !self.seen_ids.insert(post_id.clone()) {
                continue;
            }
            new_ids += 1;

            if let Some(file) = &post.file {
                if let Some(media) = self.normalize_file(file, &post_id, &mut skipped) {
                    medias.push(media);
                }
            }
            for (i, attachment) in post.attachments.iter().enumerate() {
                let att_id = format!("{}_att{}", post_id, i);
                if let Some(media) = self.normalize_file(attachment, &att_id, &mut skipped) {
                    medias.push(media);
                }
            }
        }

        debug!(added = medias.len(), skipped, new_ids, "page normalized");
        (medias, new_ids)
    }

    fn normalize_file(
        &mut self,
        file: &crate::api::models::PostFile,
        media_id: &str,
        skipped: &mut usize,
    ) -> Option<Media> {
        let name = file.name.as_deref()?;
        let path = file.path.as_deref()?;
        if name.is_empty() || path.is_empty() {
            return None;
        }

        let duplicate_key = cdn_path_hash(path).unwrap_or_else(|| name.to_string());
        if !self.seen_keys.insert(duplicate_key) {
            *skipped += 1;
            return None;
        }

        Some(Media::new(media_id, name, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Routes URLs to canned pages by matching on a query fragment.
    struct FakeFetcher {
        routes: Vec<(&'static str, Vec<Post>)>,
    }

    impl FakeFetcher {
        fn new(routes: Vec<(&'static str, Vec<Post>)>) -> Self {
            Self { routes }
        }
    }

    #[async_trait]
    impl PostFetcher for FakeFetcher {
        async fn fetch_page(&self, url: &str) -> Result<Vec<Post>, ApiError> {
            for (fragment, posts) in &self.routes {
                if url.contains(fragment) {
                    return Ok(posts.clone());
                }
            }
            Ok(Vec::new())
        }
    }

    fn posts(range: std::ops::Range<u32>) -> Vec<Post> {
        range
            .map(|i| {
                serde_json::from_value(json!({
                    "id": i,
                    "published": format!("2024-01-{:02}T00:00:00", (i % 27) + 1),
                    "file": {"name": format!("f{}.mp4", i), "path": format!("/data/x/{:064x}.mp4", i)}
                }))
                .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_single_page_profile() {
        let fetcher = FakeFetcher::new(vec![("posts?_", posts(0..5))]);
        let mut pager = PostPager::new(fetcher, "onlyfans", "val");

        let page1 = pager.next_page().await.unwrap().unwrap();
        assert_eq!(page1.len(), 5);

        // every candidate returns the same already-seen posts or nothing
        assert!(pager.next_page().await.unwrap().is_none());
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mode_fallback_to_page_numbers() {
        // before_id and max_id return nothing new; page=2 has fresh posts
        let fetcher = FakeFetcher::new(vec![
            ("before_id=", Vec::new()),
            ("max_id=", posts(0..50)),
            ("page=2", posts(50..80)),
            ("page=3", posts(80..90)),
            ("posts?_", posts(0..50)),
        ]);
        let mut pager = PostPager::new(fetcher, "onlyfans", "val");

        assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 50);
        assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 30);
        assert_eq!(pager.mode(), Some(PageMode::Page));
        assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 10);
        // page=4 unmatched -> empty -> done
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_before_id_mode_adopted_first() {
        let fetcher = FakeFetcher::new(vec![
            ("before_id=", posts(50..60)),
            ("page=", posts(200..220)),
            ("posts?_", posts(0..50)),
        ]);
        let mut pager = PostPager::new(fetcher, "onlyfans", "val");

        pager.next_page().await.unwrap().unwrap();
        let page2 = pager.next_page().await.unwrap().unwrap();
        assert_eq!(page2.len(), 10);
        assert_eq!(pager.mode(), Some(PageMode::BeforeId));
    }

    #[tokio::test]
    async fn test_duplicates_dropped_across_pages() {
        // page 2 repeats a CDN hash from page 1 under a new post id
        let mut second: Vec<Post> = posts(50..52);
        second.push(
            serde_json::from_value(json!({
                "id": 999,
                "file": {"name": "dup.mp4", "path": format!("/data/x/{:064x}.mp4", 1)}
            }))
            .unwrap(),
        );
        let fetcher = FakeFetcher::new(vec![
            ("before_id=", second),
            ("posts?_", posts(0..50)),
        ]);
        let mut pager = PostPager::new(fetcher, "onlyfans", "val");

        assert_eq!(pager.next_page().await.unwrap().unwrap().len(), 50);
        let page2 = pager.next_page().await.unwrap().unwrap();
        // post 999 is a new id but its file is a known hash
        assert_eq!(page2.len(), 2);
    }

    #[tokio::test]
    async fn test_attachments_expand_to_entries() {
        let page: Vec<Post> = vec![serde_json::from_value(json!({
            "id": 1,
            "file": {"name": "main.mp4", "path": "/data/a/aaaa.mp4"},
            "attachments": [
                {"name": "x.jpg", "path": "/data/a/bbbb.jpg"},
                {"name": "y.jpg", "path": "/data/a/cccc.jpg"}
            ]
        }))
        .unwrap()];
        let fetcher = FakeFetcher::new(vec![("posts?_", page)]);
        let mut pager = PostPager::new(fetcher, "onlyfans", "val");

        let medias = pager.next_page().await.unwrap().unwrap();
        assert_eq!(medias.len(), 3);
        assert_eq!(medias[0].id, "1");
        assert_eq!(medias[1].id, "1_att0");
        assert_eq!(medias[2].id, "1_att1");
    }

    #[tokio::test]
    async fn test_terminal_error_surfaces_partial() {
        struct FailingFetcher;

        #[async_trait]
        impl PostFetcher for FailingFetcher {
            async fn fetch_page(&self, url: &str) -> Result<Vec<Post>, ApiError> {
                if url.contains("before_id=") {
                    Err(ApiError::Unauthorized(403))
                } else {
                    Ok(posts(0..3))
                }
            }
        }

        let mut pager = PostPager::new(FailingFetcher, "onlyfans", "val");
        let (medias, error) = pager.fetch_all().await;
        // page 1 succeeded; detection hit a terminal error on the first candidate
        assert_eq!(medias.len(), 3);
        assert!(error.is_none() || matches!(error, Some(ApiError::Unauthorized(_))));
    }

    #[test]
    fn test_referer_for_posts_url() {
        assert_eq!(
            referer_for("https://coomer.st/api/v1/onlyfans/user/val/posts?o=50"),
            "https://coomer.st/onlyfans/user/val"
        );
    }
}
