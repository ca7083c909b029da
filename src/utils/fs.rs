use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Expand tilde (~) in file paths to home directory
pub fn expand_tilde(path: &str) -> Result<PathBuf> {
    if path.starts_with('~') {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Unable to determine home directory"))?;
        Ok(home.join(&path[2..]))
    } else {
        Ok(PathBuf::from(path))
    }
}

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_dir(path: &Path) -> Result<(), std::io::Error> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
    }
    Ok(())
}

/// Promote `src` over `dst` by rename.
///
/// Callers treat this as the sole commit point for finished files. If the
/// plain rename fails (some platforms refuse to rename over an existing
/// file), the destination is removed and the rename retried once.
pub async fn atomic_replace(src: &Path, dst: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(_) => {
            let _ = tokio::fs::remove_file(dst).await;
            tokio::fs::rename(src, dst).await
        }
    }
}

/// Write `content` to `path` through a sibling temp file, fsync, then rename.
///
/// The file at `path` is either the previous version or the new one, never
/// a partial write.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension(crate::constants::storage::TEMP_FILE_SUFFIX);
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    atomic_replace(&temp_path, path).await
}

/// Total size in bytes of all files under `path`, recursively.
///
/// Tolerates races: entries that vanish mid-walk are skipped.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    for entry in entries.flatten() {
        let entry_path = entry.path();
        match entry.metadata() {
            Ok(meta) if meta.is_dir() => total += dir_size(&entry_path),
            Ok(meta) if meta.is_file() => total += meta.len(),
            _ => {}
        }
    }

    total
}

/// Get a human-readable file size string
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.1} {}", size, UNITS[unit_index])
}

/// Format a transfer rate the way the status column displays it
pub fn format_speed(bytes_per_sec: f64) -> String {
    if bytes_per_sec < 1024.0 {
        format!("{:.1} B/s", bytes_per_sec)
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    }
}
