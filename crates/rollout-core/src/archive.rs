//! Zip helpers shared by package installation, delta packages and the setup
//! payload.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use thiserror::Error;
use zip::write::SimpleFileOptions;

/// Entry that carries package metadata and is never installed.
pub(crate) const METADATA_ENTRY: &str = "metadata.json";
const LIB_DIR: &str = "lib";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{context} {}: {source}", path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{context} {}: {source}", path.display())]
    Zip {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

impl ArchiveError {
    fn io(context: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    fn zip(context: &'static str, path: &Path, source: zip::result::ZipError) -> Self {
        Self::Zip {
            context,
            path: path.to_path_buf(),
            source,
        }
    }
}

fn open_archive(zip_path: &Path) -> Result<zip::ZipArchive<std::fs::File>, ArchiveError> {
    let file = std::fs::File::open(zip_path)
        .map_err(|error| ArchiveError::io("failed to open zip file", zip_path, error))?;
    zip::ZipArchive::new(file)
        .map_err(|error| ArchiveError::zip("failed to read zip archive", zip_path, error))
}

/// Extract every entry of `zip_path` below `dest`. Entries whose path would
/// escape `dest` are skipped.
///
/// # Errors
/// Returns an error when the archive cannot be read or a file cannot be
/// written.
pub fn extract_zip(zip_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    extract_filtered(zip_path, dest, |name| Some(name.to_path_buf()))
}

/// Extract the installable content of a full package.
///
/// When the package has a `lib/<target>/` tree only that tree is extracted,
/// with the `lib/<target>` prefix removed. Otherwise everything except
/// `metadata.json` is extracted as-is.
///
/// # Errors
/// Returns an error when the archive cannot be read or a file cannot be
/// written.
pub fn extract_package(zip_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let has_lib_tree = {
        let archive = open_archive(zip_path)?;
        archive
            .file_names()
            .any(|name| name.starts_with("lib/") && name.matches('/').count() >= 2)
    };

    if has_lib_tree {
        extract_filtered(zip_path, dest, |name| {
            let mut components = name.components();
            match components.next() {
                Some(Component::Normal(first)) if first == LIB_DIR => {}
                _ => return None,
            }
            components.next()?;
            let rest = components.as_path();
            (!rest.as_os_str().is_empty()).then(|| rest.to_path_buf())
        })
    } else {
        extract_filtered(zip_path, dest, |name| {
            (name != Path::new(METADATA_ENTRY)).then(|| name.to_path_buf())
        })
    }
}

fn extract_filtered(
    zip_path: &Path,
    dest: &Path,
    map_name: impl Fn(&Path) -> Option<PathBuf>,
) -> Result<(), ArchiveError> {
    let mut archive = open_archive(zip_path)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|error| ArchiveError::zip("failed to read zip entry", zip_path, error))?;
        let Some(name) = entry.enclosed_name() else {
            warn!("Skipping zip entry with unsafe path");
            continue;
        };
        let Some(relative) = map_name(&name) else {
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|error| {
                ArchiveError::io("failed to create extraction directory", &out_path, error)
            })?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|error| {
                ArchiveError::io("failed to create extraction parent directory", parent, error)
            })?;
        }
        let mut outfile = std::fs::File::create(&out_path).map_err(|error| {
            ArchiveError::io("failed to create extracted file", &out_path, error)
        })?;
        std::io::copy(&mut entry, &mut outfile).map_err(|error| {
            ArchiveError::io("failed to extract archive entry", &out_path, error)
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode));
            }
        }
    }

    debug!("Extraction complete to {}", dest.display());
    Ok(())
}

/// Read one entry of an archive into memory. `Ok(None)` when it is absent.
///
/// # Errors
/// Returns an error when the archive or the entry cannot be read.
pub fn read_entry(zip_path: &Path, name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
    let mut archive = open_archive(zip_path)?;
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(error) => return Err(ArchiveError::zip("failed to read zip entry", zip_path, error)),
    };

    let mut data = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
    entry
        .read_to_end(&mut data)
        .map_err(|error| ArchiveError::io("failed to read zip entry", zip_path, error))?;
    Ok(Some(data))
}

/// Zip the contents of `dir` into `out_path`.
///
/// The output only depends on file names and contents: entries are sorted,
/// timestamps are pinned to the zip epoch and permissions are normalised.
///
/// # Errors
/// Returns an error when a file cannot be read or the archive cannot be
/// written.
pub fn zip_directory(dir: &Path, out_path: &Path) -> Result<(), ArchiveError> {
    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    files.sort();

    let out = std::fs::File::create(out_path)
        .map_err(|error| ArchiveError::io("failed to create zip file", out_path, error))?;
    let mut writer = zip::ZipWriter::new(out);

    for relative in &files {
        let source = dir.join(relative);
        let name = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .unix_permissions(if is_executable(&source) { 0o755 } else { 0o644 });

        writer
            .start_file(name.as_str(), options)
            .map_err(|error| ArchiveError::zip("failed to start zip entry", out_path, error))?;
        let data = std::fs::read(&source)
            .map_err(|error| ArchiveError::io("failed to read file for zip", &source, error))?;
        writer
            .write_all(&data)
            .map_err(|error| ArchiveError::io("failed to write zip entry", out_path, error))?;
    }

    writer
        .finish()
        .map_err(|error| ArchiveError::zip("failed to finish zip archive", out_path, error))?;
    debug!("Zipped {} files into {}", files.len(), out_path.display());
    Ok(())
}

/// Write an in-memory set of entries as a zip, in the given order, with the
/// same pinned timestamps and permissions as [`zip_directory`].
///
/// # Errors
/// Returns an error when the archive cannot be written.
pub fn write_entries(out_path: &Path, entries: &[(&str, &[u8])]) -> Result<(), ArchiveError> {
    let out = std::fs::File::create(out_path)
        .map_err(|error| ArchiveError::io("failed to create zip file", out_path, error))?;
    let mut writer = zip::ZipWriter::new(out);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    for (name, data) in entries {
        writer
            .start_file(*name, options)
            .map_err(|error| ArchiveError::zip("failed to start zip entry", out_path, error))?;
        writer
            .write_all(data)
            .map_err(|error| ArchiveError::io("failed to write zip entry", out_path, error))?;
    }

    writer
        .finish()
        .map_err(|error| ArchiveError::zip("failed to finish zip archive", out_path, error))?;
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), ArchiveError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|error| ArchiveError::io("failed to read directory", dir, error))?;
    for entry in entries {
        let entry =
            entry.map_err(|error| ArchiveError::io("failed to read directory entry", dir, error))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            files.push(relative.to_path_buf());
        }
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|meta| meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}
