//! CDN and profile URL handling

use regex::Regex;
use url::Url;

use crate::constants::cdn::{BASE_HOST, MIRRORS};

/// Build the canonical media URL for a CDN path as reported by the API.
pub fn build_media_url(path: &str) -> String {
    if path.starts_with("/data") {
        format!("https://{}{}", BASE_HOST, path)
    } else {
        format!("https://{}/data{}", BASE_HOST, path)
    }
}

/// All candidate URLs for one media file: the primary host first, then the
/// mirror subdomains, all serving the same path.
pub fn mirror_urls(original_url: &str) -> Vec<String> {
    let path = Url::parse(original_url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| original_url.to_string());

    let mut urls = vec![format!("https://{}{}", BASE_HOST, path)];
    for node in MIRRORS {
        urls.push(format!("https://{}.{}{}", node, BASE_HOST, path));
    }
    urls
}

/// Parse `(service, username)` out of a profile page URL.
pub fn extract_profile_info(url: &str) -> Option<(String, String)> {
    let pattern = Regex::new(r"^https?://(?:www\.)?coomer\.st/([^/]+)/user/([^/?#]+)").ok()?;
    let caps = pattern.captures(url.trim())?;
    Some((caps[1].to_lowercase(), caps[2].to_string()))
}

/// API endpoint for a profile's posts.
pub fn posts_endpoint(service: &str, username: &str) -> String {
    format!(
        "https://{}/api/v1/{}/user/{}/posts",
        BASE_HOST, service, username
    )
}

/// Profile page URL, used as Referer on API requests.
pub fn profile_page(service: &str, username: &str) -> String {
    format!("https://{}/{}/user/{}", BASE_HOST, service, username)
}
