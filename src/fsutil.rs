//! Atomic file publication.
//!
//! Files are written to a hidden temporary sibling and renamed into place, so a
//! reader listing the directory sees either nothing or the complete file.
//! Temporary names look like `.<name>.tmp-<uuid>` and are ignored by readers
//! through [`is_temp_file`].

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{FleetError, Result};

const TEMP_MARKER: &str = ".tmp-";

/// Hidden temporary sibling of `path`.
pub fn temp_path(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FleetError::InvalidArgument(format!("no file name in {}", path.display())))?;
    Ok(path.with_file_name(format!(".{name}{TEMP_MARKER}{}", Uuid::new_v4().simple())))
}

/// True for in-flight temporary files created by [`temp_path`].
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.contains(TEMP_MARKER))
        .unwrap_or(false)
}

/// Write `bytes` to `path` atomically, fsyncing before the rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path)?;
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

/// Copy `src` to `dst` atomically, carrying over the source modification time.
/// Returns the number of bytes copied.
pub fn copy_atomic(src: &Path, dst: &Path) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(dst)?;
    let result = (|| {
        let bytes = fs::copy(src, &tmp)?;
        let modified = fs::metadata(src)?.modified()?;
        let file = File::options().write(true).open(&tmp)?;
        file.set_modified(modified)?;
        file.sync_all()?;
        fs::rename(&tmp, dst)?;
        Ok::<u64, std::io::Error>(bytes)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_is_hidden_sibling() {
        let tmp = temp_path(Path::new("/out/shard_001__inferred.parquet")).unwrap();
        assert_eq!(tmp.parent(), Some(Path::new("/out")));
        assert!(is_temp_file(&tmp));
        assert!(!is_temp_file(Path::new("/out/shard_001__inferred.parquet")));
        assert!(!is_temp_file(Path::new("/out/.hidden")));
    }

    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/a.bin");
        write_atomic(&path, b"hello").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"hello");
        let names: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn copy_atomic_preserves_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("out/dst.bin");
        fs::write(&src, b"payload").unwrap();

        let copied = copy_atomic(&src, &dst).unwrap();
        assert_eq!(copied, 7);
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert_eq!(
            fs::metadata(&src).unwrap().modified().unwrap(),
            fs::metadata(&dst).unwrap().modified().unwrap()
        );
    }
}
