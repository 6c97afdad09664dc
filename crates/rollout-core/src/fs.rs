use std::io::Write;
use std::path::Path;

/// Replace `path` with `data` so readers only ever see the old or the new
/// content. The bytes go to a sibling temp file that is renamed over `path`.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "target path has no parent")
    })?;
    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("file");

    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|error| error.error)?;
    Ok(())
}

/// Move a file, falling back to copy-and-delete across volumes.
pub(crate) fn move_file(src: &Path, dest: &Path) -> std::io::Result<()> {
    if std::fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    std::fs::copy(src, dest)?;
    std::fs::remove_file(src)
}

#[cfg(test)]
mod tests {
    use super::{move_file, write_atomic};

    #[test]
    fn write_atomic_replaces_existing_file_without_leftovers() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("RELEASES");
        std::fs::write(&path, "old").expect("seed file should be written");

        write_atomic(&path, b"new").expect("atomic write should succeed");

        assert_eq!(std::fs::read_to_string(&path).expect("read back"), "new");
        let leftovers = std::fs::read_dir(temp_dir.path())
            .expect("read temp dir entries")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn write_atomic_fails_without_touching_target_when_dir_missing() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let path = temp_dir.path().join("missing").join("RELEASES");

        assert!(write_atomic(&path, b"data").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn move_file_relocates_content() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let src = temp_dir.path().join("a.bin");
        let dest = temp_dir.path().join("b.bin");
        std::fs::write(&src, b"bytes").expect("source should be written");

        move_file(&src, &dest).expect("move should succeed");

        assert!(!src.exists());
        assert_eq!(std::fs::read(&dest).expect("dest readable"), b"bytes");
    }
}
