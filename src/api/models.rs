//! Wire types for the posts API
//!
//! The API is loose with shapes: a page is either a bare JSON list or an
//! object wrapping `posts`, ids come as strings or numbers, and the
//! publication timestamp hides behind three different keys.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::api::client::ApiError;

/// One file referenced by a post, either its primary file or an attachment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// One post as returned by `/api/v1/<service>/user/<username>/posts`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Post {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub post_id: Option<Value>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub published: Option<String>,
    #[serde(default)]
    pub added: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub file: Option<PostFile>,
    #[serde(default)]
    pub attachments: Vec<PostFile>,
}

impl Post {
    /// Stable post id as a string, whichever key and JSON type carried it.
    pub fn id_str(&self) -> Option<String> {
        value_to_id(self.id.as_ref()).or_else(|| value_to_id(self.post_id.as_ref()))
    }

    /// Raw publication timestamp, first key that is present.
    pub fn timestamp(&self) -> Option<&str> {
        self.published
            .as_deref()
            .or(self.added.as_deref())
            .or(self.created_at.as_deref())
    }

    /// Publication instant; naive timestamps are assumed UTC.
    pub fn published_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp_utc(self.timestamp()?)
    }
}

/// Parse a site timestamp; values without a zone are assumed UTC.
pub fn parse_timestamp_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    // the site frequently emits "2024-01-02T03:04:05" without a zone
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()?;
    Some(naive.and_utc())
}

fn value_to_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Interpret a page body: either a bare list or `{"posts": [...]}`.
pub fn parse_posts(body: Value) -> Result<Vec<Post>, ApiError> {
    let list = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("posts") {
            Some(Value::Array(items)) => items,
            _ => return Err(ApiError::UnexpectedShape),
        },
        _ => return Err(ApiError::UnexpectedShape),
    };

    list.into_iter()
        .map(|item| serde_json::from_value(item).map_err(|_| ApiError::UnexpectedShape))
        .collect()
}
