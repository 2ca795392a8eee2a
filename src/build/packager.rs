//! Zip packaging of build output.

use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::SimpleFileOptions;

use crate::errors::BuildError;

/// Streams a directory tree into a deflate-compressed zip archive.
///
/// Files are copied entry by entry through a buffered writer, so large build
/// outputs are never held in memory. The archive is written under a
/// `.partial` name and renamed into place only once complete.
#[derive(Debug, Clone, Default)]
pub struct ArtifactPackager;

impl ArtifactPackager {
    pub fn new() -> Self {
        Self
    }

    pub async fn pack(&self, source_dir: &Path, output_archive_path: &Path) -> Result<PathBuf, BuildError> {
        let source = source_dir.to_path_buf();
        let output = output_archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || pack_blocking(&source, &output))
            .await
            .map_err(|e| BuildError::PackagingFailed {
                path: output_archive_path.to_path_buf(),
                message: format!("packaging task panicked: {}", e),
            })?
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    output.with_file_name(name)
}

fn pack_blocking(source: &Path, output: &Path) -> Result<PathBuf, BuildError> {
    if !source.is_dir() {
        return Err(BuildError::PackagingFailed {
            path: source.to_path_buf(),
            message: "build output directory does not exist".to_string(),
        });
    }

    let partial = partial_path(output);
    let result = write_archive(source, output, &partial);
    match result {
        Ok(()) => {
            tracing::debug!(archive = %output.display(), "artifact packaged");
            Ok(output.to_path_buf())
        }
        Err(e) => {
            if partial.exists()
                && let Err(rm) = std::fs::remove_file(&partial)
            {
                tracing::warn!(path = %partial.display(), error = %rm, "failed to remove partial archive");
            }
            Err(BuildError::PackagingFailed {
                path: output.to_path_buf(),
                message: e.to_string(),
            })
        }
    }
}

fn write_archive(source: &Path, output: &Path, partial: &Path) -> io::Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(partial)?;
    let mut zip = zip::ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);

    for entry in WalkDir::new(source).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)
                .map_err(io::Error::other)?;
        } else {
            zip.start_file(name, options).map_err(io::Error::other)?;
            let mut input = File::open(entry.path())?;
            io::copy(&mut input, &mut zip)?;
        }
    }

    let mut writer = zip.finish().map_err(io::Error::other)?;
    io::Write::flush(&mut writer)?;
    drop(writer);

    std::fs::rename(partial, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Read;

    #[tokio::test]
    async fn test_pack_creates_archive_with_relative_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dist = dir.path().join("dist");
        fs::create_dir_all(dist.join("assets")).unwrap();
        fs::write(dist.join("index.html"), "<html></html>").unwrap();
        fs::write(dist.join("assets/app.js"), "console.log(1)").unwrap();

        let out = dir.path().join("artifacts/demo.zip");
        let path = ArtifactPackager::new().pack(&dist, &out).await.unwrap();
        assert_eq!(path, out);
        assert!(fs::metadata(&out).unwrap().len() > 0);
        assert!(!partial_path(&out).exists());

        let mut archive = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        let mut contents = String::new();
        archive
            .by_name("assets/app.js")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "console.log(1)");
        assert!(archive.by_name("index.html").is_ok());
    }

    #[tokio::test]
    async fn test_pack_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("demo.zip");
        let err = ArtifactPackager::new()
            .pack(&dir.path().join("nope"), &out)
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::PackagingFailed { .. }));
        assert!(!out.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pack_unwritable_destination_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dist = dir.path().join("dist");
        fs::create_dir_all(&dist).unwrap();
        fs::write(dist.join("index.html"), "x").unwrap();

        // A regular file where the parent directory should be.
        let blocker = dir.path().join("artifacts");
        fs::write(&blocker, "not a dir").unwrap();
        let out = blocker.join("demo.zip");

        let err = ArtifactPackager::new().pack(&dist, &out).await.unwrap_err();
        assert!(matches!(err, BuildError::PackagingFailed { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/a/b/demo.zip")),
            PathBuf::from("/a/b/demo.zip.partial")
        );
    }
}
