mod batch_store;
mod checkpoint;

pub use batch_store::{parse_batch_index, BatchFile, BatchStore, BATCH_FILE_EXTENSION};
pub use checkpoint::{Checkpoint, CheckpointStore, RunCounters, CHECKPOINT_FILE_NAME};

use std::{fs, io, path::Path};

/// Writes `body` next to `path` and renames it into place, so readers never observe a
/// partially written file under the final name.
pub(crate) fn write_atomic(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let written = fs::write(&tmp_path, body).and_then(|()| fs::rename(&tmp_path, path));
    if written.is_err() && tmp_path.is_file() {
        let _ = fs::remove_file(&tmp_path);
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replaces_the_target_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        fs::write(&path, b"old").unwrap();

        write_atomic(&path, b"new").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert!(!dir.path().join("embeddings.bin.tmp").exists());
    }

    #[test]
    fn failed_rename_removes_the_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("embeddings.bin");
        fs::create_dir_all(path.join("occupied")).unwrap();

        assert!(write_atomic(&path, b"body").is_err());
        assert!(!dir.path().join("embeddings.bin.tmp").exists());
        assert!(path.is_dir());
    }

    #[test]
    fn failed_write_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("embeddings.bin");

        assert!(write_atomic(&path, b"body").is_err());
        assert!(!dir.path().join("missing").exists());
    }
}
