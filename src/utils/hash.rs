//! Streaming content hashing and CDN digest extraction
//!
//! The CDN names every file after its SHA-256; the hex basename of the
//! remote path is the expected digest of the local bytes.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use crate::constants::downloads::CHUNK_SIZE;

/// Compute the SHA-256 of a file, streaming it in 8 KiB blocks.
///
/// Runs synchronously; call from `spawn_blocking` when on the runtime.
pub fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Async wrapper around [`sha256_file`] for use inside the runtime.
pub async fn sha256_file_async(path: &Path) -> Result<String, std::io::Error> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_file(&path))
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))?
}

/// Extract the expected digest from a CDN path or URL: the basename with
/// the extension and any query string stripped.
///
/// `/data/ab/cd/abcdef123.mp4` -> `Some("abcdef123")`
pub fn cdn_path_hash(path_or_url: &str) -> Option<String> {
    let without_query = path_or_url.split('?').next().unwrap_or(path_or_url);
    let basename = without_query.rsplit('/').next()?;
    let stem = match basename.rfind('.') {
        Some(pos) if pos > 0 => &basename[..pos],
        _ => basename,
    };
    if stem.is_empty() {
        None
    } else {
        Some(stem.to_string())
    }
}

/// Check a local file against the digest embedded in its CDN path.
///
/// Returns the actual digest on mismatch so callers can surface it.
pub async fn verify_cdn_hash(
    local: &Path,
    cdn_path: &str,
) -> Result<Result<(), String>, std::io::Error> {
    let expected = match cdn_path_hash(cdn_path) {
        Some(h) => h,
        None => return Ok(Ok(())),
    };
    let actual = sha256_file_async(local).await?;
    if actual == expected {
        Ok(Ok(()))
    } else {
        Ok(Err(actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cdn_path_hash_from_path() {
        assert_eq!(
            cdn_path_hash("/data/ab/cd/abcdef123456.mp4").as_deref(),
            Some("abcdef123456")
        );
        assert_eq!(
            cdn_path_hash("https://n1.coomer.st/data/xx/foo.jpg?f=name").as_deref(),
            Some("foo")
        );
        assert_eq!(cdn_path_hash("noext").as_deref(), Some("noext"));
        assert_eq!(cdn_path_hash(""), None);
    }

    #[test]
    fn test_sha256_file_known_digest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        // sha256("hello")
        assert_eq!(
            sha256_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[tokio::test]
    async fn test_verify_cdn_hash_match_and_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("payload.bin");
        std::fs::write(&path, b"hello").unwrap();

        let good =
            "/data/2c/f2/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.bin";
        assert!(verify_cdn_hash(&path, good).await.unwrap().is_ok());

        let bad = "/data/00/00/0000000000000000000000000000000000000000000000000000000000000000.bin";
        let err = verify_cdn_hash(&path, bad).await.unwrap().unwrap_err();
        assert!(err.starts_with("2cf24dba"));
    }
}
