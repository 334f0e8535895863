// backuptool/src/snapshot/archive.rs
use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::path::{Path, PathBuf};
use tar::Builder;
use walkdir::WalkDir;

/// Creates a GZipped TAR archive from a set of source paths.
///
/// A file source is stored under its file name; a directory source is stored
/// under its directory name with its tree layout preserved. Any entry whose
/// path starts with one of `exclude_dirs` is skipped.
pub fn create_tar_gz(
    archive_dest_path: &Path,
    sources: &[PathBuf],
    exclude_dirs: &[PathBuf],
) -> Result<PathBuf> {
    if let Some(parent) = archive_dest_path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "Failed to create parent directory for archive: {}",
                    parent.display()
                )
            })?;
        }
    }

    let archive_file = File::create(archive_dest_path).with_context(|| {
        format!(
            "Failed to create archive file: {}",
            archive_dest_path.display()
        )
    })?;
    let enc = GzEncoder::new(archive_file, Compression::default());
    let mut tar_builder = Builder::new(enc);
    tar_builder.follow_symlinks(false);

    for source in sources {
        if source.is_file() {
            let name = source
                .file_name()
                .with_context(|| format!("Source has no file name: {}", source.display()))?;
            tar_builder
                .append_path_with_name(source, name)
                .with_context(|| format!("Failed to append file {}", source.display()))?;
        } else if source.is_dir() {
            let base = source
                .file_name()
                .with_context(|| format!("Source has no directory name: {}", source.display()))?;
            for entry in WalkDir::new(source).follow_links(false) {
                let entry = entry
                    .with_context(|| format!("Failed to walk directory: {}", source.display()))?;
                let path = entry.path();
                if exclude_dirs.iter().any(|ex| path.starts_with(ex)) {
                    continue;
                }
                let rel = path.strip_prefix(source).with_context(|| {
                    format!(
                        "Failed to strip prefix {} from {}",
                        source.display(),
                        path.display()
                    )
                })?;
                if rel.as_os_str().is_empty() {
                    continue;
                }
                let name = Path::new(base).join(rel);
                if path.is_dir() {
                    tar_builder
                        .append_dir(&name, path)
                        .with_context(|| format!("Failed to append directory {}", path.display()))?;
                } else if path.is_file() {
                    tar_builder
                        .append_path_with_name(path, &name)
                        .with_context(|| format!("Failed to append file {}", path.display()))?;
                }
            }
        } else {
            anyhow::bail!("Archive source does not exist: {}", source.display());
        }
    }

    let encoder = tar_builder
        .into_inner()
        .context("Failed to flush tar builder")?;
    encoder
        .finish()
        .with_context(|| format!("Failed to finish gzip encoding for {}", archive_dest_path.display()))?;

    Ok(archive_dest_path.to_path_buf())
}

/// Walks the archive's table of contents and returns the number of file
/// entries. Fails if the archive cannot be read end to end, which is the
/// integrity probe run right after creation.
pub fn entry_count(archive_path: &Path) -> Result<usize> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive {}", archive_path.display()))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    let mut count = 0;
    for entry in archive
        .entries()
        .with_context(|| format!("Failed to list archive {}", archive_path.display()))?
    {
        let entry = entry
            .with_context(|| format!("Corrupt entry in archive {}", archive_path.display()))?;
        if entry.header().entry_type().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn archives_files_and_dirs_with_exclusions() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tree = dir.path().join("certs");
        fs::create_dir_all(tree.join("live"))?;
        fs::create_dir_all(tree.join("archive"))?;
        fs::write(tree.join("live/fullchain.pem"), "cert")?;
        fs::write(tree.join("archive/old1.pem"), "stale")?;
        let env_file = dir.path().join(".env");
        fs::write(&env_file, "KEY=value")?;

        let dest = dir.path().join("config.tar.gz");
        create_tar_gz(
            &dest,
            &[env_file, tree.clone()],
            &[tree.join("archive")],
        )?;

        // .env + live/fullchain.pem; the archive/ subtree is excluded.
        assert_eq!(entry_count(&dest)?, 2);
        Ok(())
    }

    #[test]
    fn missing_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.tar.gz");
        let missing = dir.path().join("nope");
        assert!(create_tar_gz(&dest, &[missing], &[]).is_err());
    }

    #[test]
    fn listing_a_truncated_archive_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let bogus = dir.path().join("bogus.tar.gz");
        fs::write(&bogus, b"this is not a gzip stream")?;
        assert!(entry_count(&bogus).is_err());
        Ok(())
    }
}
