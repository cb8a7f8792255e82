//! # Path Resolution Module
//!
//! Centralizza il calcolo dei path di output del batch runner.
//!
//! - Con `--output` l'albero della directory di input viene replicato sotto l'output
//! - Senza `--output` il file viene riscritto accanto all'originale
//! - Se il formato cambia cambia anche l'estensione; altrimenti il nome resta identico

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::debug;

use crate::format::MediaFormat;

/// Output paths for one batch run. Both roots are canonical.
#[derive(Debug, Clone)]
pub struct PathResolver {
    input_base: PathBuf,
    output_dir: Option<PathBuf>,
}

impl PathResolver {
    /// `input` may be a file (its directory becomes the base) or a directory.
    /// The output directory is created if missing.
    pub async fn new(input: &Path, output_dir: Option<&Path>) -> Result<Self> {
        let canonical_input = tokio::fs::canonicalize(input)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to canonicalize input {}: {}", input.display(), e))?;
        let input_base = if canonical_input.is_file() {
            canonical_input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or(canonical_input)
        } else {
            canonical_input
        };

        let output_dir = match output_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to create output dir {}: {}", dir.display(), e))?;
                let canonical = tokio::fs::canonicalize(dir)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to canonicalize output dir {}: {}", dir.display(), e))?;
                Some(canonical)
            }
            None => None,
        };

        Ok(Self { input_base, output_dir })
    }

    pub fn input_base(&self) -> &Path {
        &self.input_base
    }

    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    /// True for files that live inside the output tree, so reruns skip earlier results.
    pub fn is_inside_output(&self, path: &Path) -> bool {
        self.output_dir.as_ref().is_some_and(|dir| path.starts_with(dir))
    }

    /// Destination of `input_path` once it holds `output_format` data.
    pub fn output_path(
        &self,
        input_path: &Path,
        source_format: MediaFormat,
        output_format: MediaFormat,
    ) -> Result<PathBuf> {
        let filename = Self::file_name(input_path, source_format, output_format)?;

        let Some(output_dir) = &self.output_dir else {
            return Ok(input_path.with_file_name(filename));
        };

        let relative_dir = match input_path.strip_prefix(&self.input_base) {
            Ok(rel) => rel.parent().unwrap_or(Path::new("")),
            Err(e) => {
                debug!("Strip prefix failed for {}: {} - using output root", input_path.display(), e);
                Path::new("")
            }
        };

        let result = output_dir.join(relative_dir).join(filename);
        debug!("Resolved output path: {} -> {}", input_path.display(), result.display());
        Ok(result)
    }

    fn file_name(input_path: &Path, source_format: MediaFormat, output_format: MediaFormat) -> Result<String> {
        let invalid = || anyhow::anyhow!("Invalid file name: {}", input_path.display());
        if source_format == output_format {
            let name = input_path.file_name().ok_or_else(invalid)?;
            return Ok(name.to_string_lossy().into_owned());
        }
        let stem = input_path.file_stem().ok_or_else(invalid)?;
        Ok(format!("{}.{}", stem.to_string_lossy(), output_format.extension()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_output_dir_mirrors_tree() {
        let input = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let nested = input.path().join("2024").join("trip");
        std::fs::create_dir_all(&nested).unwrap();
        let photo = nested.join("beach.JPG");
        std::fs::write(&photo, b"x").unwrap();

        let resolver = PathResolver::new(input.path(), Some(output.path())).await.unwrap();
        let photo = tokio::fs::canonicalize(&photo).await.unwrap();

        let same = resolver.output_path(&photo, MediaFormat::Jpeg, MediaFormat::Jpeg).unwrap();
        assert!(same.ends_with("2024/trip/beach.JPG"));
        assert!(same.starts_with(resolver.output_dir().unwrap()));

        let converted = resolver.output_path(&photo, MediaFormat::Jpeg, MediaFormat::WebP).unwrap();
        assert!(converted.ends_with("2024/trip/beach.webp"));
    }

    #[tokio::test]
    async fn test_in_place_keeps_directory() {
        let input = TempDir::new().unwrap();
        let clip = input.path().join("clip.mkv");
        std::fs::write(&clip, b"x").unwrap();

        let resolver = PathResolver::new(&clip, None).await.unwrap();
        let clip = tokio::fs::canonicalize(&clip).await.unwrap();
        let target = "mp4".parse().unwrap();

        let path = resolver
            .output_path(&clip, "mkv".parse().unwrap(), target)
            .unwrap();
        assert_eq!(path, clip.with_file_name("clip.mp4"));
        assert_eq!(resolver.input_base(), clip.parent().unwrap());
    }

    #[tokio::test]
    async fn test_output_inside_input_is_detected() {
        let input = TempDir::new().unwrap();
        let output = input.path().join("out");
        let resolver = PathResolver::new(input.path(), Some(&output)).await.unwrap();
        let out = resolver.output_dir().unwrap().to_path_buf();

        assert!(resolver.is_inside_output(&out.join("a.png")));
        assert!(!resolver.is_inside_output(&resolver.input_base().join("a.png")));
    }
}
