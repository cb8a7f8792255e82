//! # File Management Module
//!
//! Questo modulo gestisce le operazioni sui file del batch runner.
//!
//! ## Responsabilità:
//! - Discovery ricorsiva dei file in una directory (walkdir)
//! - Riconoscimento dei file supportati leggendo i magic number, non le estensioni
//! - Sostituzione in place con swap tramite backup `.bak`
//! - Formattazione human-readable delle dimensioni e calcolo della riduzione
//!
//! ## Sicurezza operazioni:
//! - L'originale viene rinominato in `<nome>.bak` prima della scrittura
//! - Se la scrittura fallisce il backup viene ripristinato
//! - Il backup viene rimosso solo dopo una scrittura riuscita

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::format::{detect, FormatTag, SNIFF_WINDOW};

/// Manages file operations and discovery
pub struct FileManager;

impl FileManager {
    /// Sniffs the head of `path`. `None` when the bytes match no known container.
    pub async fn sniff_file(path: &Path) -> Result<Option<FormatTag>> {
        let mut file = fs::File::open(path).await?;
        let mut head = Vec::with_capacity(SNIFF_WINDOW);
        (&mut file).take(SNIFF_WINDOW as u64).read_to_end(&mut head).await?;
        let tag = detect(&head);
        Ok(tag.recognized.then_some(tag))
    }

    /// Supported files under `input` (or `input` itself), sorted by path.
    pub async fn find_media_files(input: &Path) -> Result<Vec<(PathBuf, FormatTag)>> {
        let candidates: Vec<PathBuf> = if input.is_file() {
            vec![input.to_path_buf()]
        } else {
            WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|path| !Self::is_backup(path))
                .collect()
        };

        let mut files = Vec::new();
        for path in candidates {
            match Self::sniff_file(&path).await {
                Ok(Some(tag)) => files.push((path, tag)),
                Ok(None) => debug!("Skipping unrecognized file: {}", path.display()),
                Err(e) => warn!("Cannot read {}: {}", path.display(), e),
            }
        }
        Ok(files)
    }

    fn is_backup(path: &Path) -> bool {
        path.extension().is_some_and(|ext| ext == "bak")
    }

    /// `<file>.bak` next to `original`
    pub fn backup_path(original: &Path) -> PathBuf {
        let mut name = original.file_name().unwrap_or_default().to_os_string();
        name.push(".bak");
        original.with_file_name(name)
    }

    /// Replaces `original` with `bytes` at `destination`, keeping a `.bak` until the write succeeds.
    ///
    /// `destination` differs from `original` when the format, and so the extension, changed.
    pub async fn replace_file(original: &Path, destination: &Path, bytes: &[u8]) -> Result<()> {
        let backup = Self::backup_path(original);
        fs::rename(original, &backup).await?;

        match fs::write(destination, bytes).await {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&backup).await {
                    warn!("Could not remove backup {}: {}", backup.display(), e);
                }
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(destination).await;
                fs::rename(&backup, original).await?;
                Err(e.into())
            }
        }
    }

    /// Writes `bytes` to `destination`, creating parent directories.
    pub async fn write_output(destination: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(destination, bytes).await?;
        Ok(())
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }

    /// Calculate percentage reduction
    pub fn calculate_reduction(original_size: u64, new_size: u64) -> f64 {
        if original_size == 0 {
            0.0
        } else {
            ((original_size as f64 - new_size as f64) / original_size as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MediaFormat;
    use tempfile::TempDir;

    const PNG_HEAD: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13, b'I', b'H', b'D', b'R'];

    #[test]
    fn test_format_size() {
        assert_eq!(FileManager::format_size(512), "512 B");
        assert_eq!(FileManager::format_size(2048), "2.00 KB");
        assert_eq!(FileManager::format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_calculate_reduction() {
        assert_eq!(FileManager::calculate_reduction(0, 10), 0.0);
        assert_eq!(FileManager::calculate_reduction(200, 50), 75.0);
        assert!(FileManager::calculate_reduction(100, 150) < 0.0);
    }

    #[tokio::test]
    async fn test_discovery_sniffs_bytes_not_extensions() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("picture.dat"), PNG_HEAD).unwrap();
        std::fs::write(dir.path().join("notes.png"), b"just some text, not an image").unwrap();
        std::fs::write(dir.path().join("old.png.bak"), PNG_HEAD).unwrap();

        let files = FileManager::find_media_files(dir.path()).await.unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].0.ends_with("nested/picture.dat"));
        assert_eq!(files[0].1.format, MediaFormat::Png);
    }

    #[tokio::test]
    async fn test_replace_file_swaps_and_removes_backup() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("photo.png");
        let converted = dir.path().join("photo.webp");
        std::fs::write(&original, b"original").unwrap();

        FileManager::replace_file(&original, &converted, b"smaller").await.unwrap();

        assert!(!original.exists());
        assert!(!FileManager::backup_path(&original).exists());
        assert_eq!(std::fs::read(&converted).unwrap(), b"smaller");
    }

    #[tokio::test]
    async fn test_failed_replace_restores_original() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("photo.jpg");
        std::fs::write(&original, b"original").unwrap();
        let unwritable = dir.path().join("missing-dir").join("photo.jpg");

        assert!(FileManager::replace_file(&original, &unwritable, b"new").await.is_err());
        assert_eq!(std::fs::read(&original).unwrap(), b"original");
    }
}
