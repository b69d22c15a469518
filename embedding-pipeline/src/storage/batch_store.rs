use std::{
    cmp::Ordering,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use common::{
    error::AppError,
    types::{BatchIndex, ResultKind, StoredValue, Tensor},
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use super::write_atomic;

pub const BATCH_FILE_EXTENSION: &str = "bin";
const TOMBSTONE_SUFFIX: &str = "removing";

#[allow(clippy::expect_used)]
static BATCH_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"batch(\d+)").expect("batch pattern compiles"));

/// Extracts the batch index from a file name. The last `batch<digits>` occurrence wins,
/// so a base name that itself contains `batch` does not shadow the real index.
pub fn parse_batch_index(file_name: &str) -> Option<BatchIndex> {
    BATCH_PATTERN
        .captures_iter(file_name)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|digits| digits.as_str().parse::<u64>().ok())
        .map(BatchIndex::new)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub path: PathBuf,
    /// `None` for files whose name carries no parsable index; these sort last.
    pub index: Option<BatchIndex>,
}

impl BatchFile {
    fn ordering(&self, other: &Self) -> Ordering {
        let rank = |file: &Self| (file.index.is_none(), file.index);
        rank(self)
            .cmp(&rank(other))
            .then_with(|| self.path.file_name().cmp(&other.path.file_name()))
    }
}

/// Per-kind directories of serialized batch result sets under one output directory.
#[derive(Debug, Clone)]
pub struct BatchStore {
    root: PathBuf,
    basename: String,
}

impl BatchStore {
    pub fn new(root: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            basename: basename.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kind_dir(&self, kind: ResultKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    pub fn batch_path(&self, kind: ResultKind, index: BatchIndex) -> PathBuf {
        self.kind_dir(kind).join(format!(
            "{}_{kind}_batch{index}.{BATCH_FILE_EXTENSION}",
            self.basename
        ))
    }

    pub fn write(
        &self,
        kind: ResultKind,
        index: BatchIndex,
        result_set: Vec<Tensor>,
    ) -> Result<PathBuf, AppError> {
        self.write_value(kind, index, &StoredValue::from(result_set))
    }

    /// Serializes any stored value under the batch name for `(kind, index)`, replacing
    /// a previous file with the same index.
    pub fn write_value(
        &self,
        kind: ResultKind,
        index: BatchIndex,
        value: &StoredValue,
    ) -> Result<PathBuf, AppError> {
        let dir = self.kind_dir(kind);
        fs::create_dir_all(&dir)?;

        let path = self.batch_path(kind, index);
        write_atomic(&path, &value.encode()?)?;
        debug!(kind = %kind, batch = %index, path = %path.display(), "wrote batch file");
        Ok(path)
    }

    /// Lists the batch files of a kind in ascending batch-index order.
    pub fn list(&self, kind: ResultKind) -> Result<Vec<BatchFile>, AppError> {
        let dir = self.kind_dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BATCH_FILE_EXTENSION) {
                continue;
            }
            let index = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_batch_index);
            if index.is_none() {
                warn!(path = %path.display(), "batch file name has no batch index; ordering it last");
            }
            files.push(BatchFile { path, index });
        }

        files.sort_by(BatchFile::ordering);
        Ok(files)
    }

    /// Directory a kind is moved to before deletion.
    pub fn tombstone_dir(&self, kind: ResultKind) -> PathBuf {
        self.root.join(format!("{kind}.{TOMBSTONE_SUFFIX}"))
    }

    /// Removes the whole directory of a kind.
    ///
    /// The directory is renamed to its tombstone first, so the kind either keeps every batch
    /// file or none of them. A tombstone that cannot be deleted is left for
    /// [`BatchStore::purge_tombstones`].
    pub fn remove_kind(&self, kind: ResultKind) -> Result<(), AppError> {
        let tombstone = self.tombstone_dir(kind);
        remove_dir_if_present(&tombstone)?;
        match fs::rename(self.kind_dir(kind), &tombstone) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = remove_dir_if_present(&tombstone) {
            warn!(
                kind = %kind,
                path = %tombstone.display(),
                error = %err,
                "batch files detached but not deleted; they are purged on the next run"
            );
        }
        Ok(())
    }

    /// Deletes tombstones left by an interrupted removal. Returns how many were found.
    pub fn purge_tombstones(&self) -> Result<usize, AppError> {
        let mut purged = 0usize;
        for kind in ResultKind::ALL {
            let tombstone = self.tombstone_dir(kind);
            if tombstone.exists() {
                remove_dir_if_present(&tombstone)?;
                purged = purged.saturating_add(1);
            }
        }
        Ok(purged)
    }

    /// True when the kind directory holds at least one batch file.
    pub fn has_batches(&self, kind: ResultKind) -> Result<bool, AppError> {
        Ok(!self.list(kind)?.is_empty())
    }
}

fn remove_dir_if_present(path: &Path) -> Result<(), AppError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tensor(value: f32) -> Tensor {
        Tensor::new(vec![1], vec![value]).unwrap()
    }

    #[test]
    fn batch_names_follow_the_basename_kind_index_pattern() {
        let store = BatchStore::new("/out/proteins", "proteins");
        assert_eq!(
            store.batch_path(ResultKind::Attention, BatchIndex::new(12)),
            PathBuf::from("/out/proteins/attention/proteins_attention_batch12.bin")
        );
    }

    #[test]
    fn parses_the_last_batch_number() {
        assert_eq!(
            parse_batch_index("proteins_embeddings_batch42.bin"),
            Some(BatchIndex::new(42))
        );
        assert_eq!(
            parse_batch_index("batch7_set_embeddings_batch3.bin"),
            Some(BatchIndex::new(3))
        );
        assert_eq!(parse_batch_index("stray.bin"), None);
        assert_eq!(parse_batch_index("batch99999999999999999999999.bin"), None);
    }

    #[test]
    fn write_creates_directory_and_overwrites() {
        let dir = tempdir().unwrap();
        let store = BatchStore::new(dir.path(), "p");

        let first = store
            .write(ResultKind::Embeddings, BatchIndex::FIRST, vec![tensor(1.0)])
            .unwrap();
        let second = store
            .write(
                ResultKind::Embeddings,
                BatchIndex::FIRST,
                vec![tensor(2.0), tensor(3.0)],
            )
            .unwrap();
        assert_eq!(first, second);

        let stored = StoredValue::decode(&fs::read(&second).unwrap()).unwrap();
        assert_eq!(stored, StoredValue::from(vec![tensor(2.0), tensor(3.0)]));
        assert_eq!(store.list(ResultKind::Embeddings).unwrap().len(), 1);
    }

    #[test]
    fn list_orders_numerically_with_unparsable_names_last() {
        let dir = tempdir().unwrap();
        let store = BatchStore::new(dir.path(), "p");
        for index in [10, 2, 1] {
            store
                .write(ResultKind::Embeddings, BatchIndex::new(index), vec![tensor(0.0)])
                .unwrap();
        }
        let kind_dir = store.kind_dir(ResultKind::Embeddings);
        fs::write(kind_dir.join("zz_stray.bin"), b"junk").unwrap();
        fs::write(kind_dir.join("aa_stray.bin"), b"junk").unwrap();
        fs::write(kind_dir.join("notes.txt"), b"ignored").unwrap();

        let names: Vec<String> = store
            .list(ResultKind::Embeddings)
            .unwrap()
            .into_iter()
            .map(|file| file.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(
            names,
            vec![
                "p_embeddings_batch1.bin",
                "p_embeddings_batch2.bin",
                "p_embeddings_batch10.bin",
                "aa_stray.bin",
                "zz_stray.bin",
            ]
        );
    }

    #[test]
    fn missing_kind_directory_lists_empty() {
        let dir = tempdir().unwrap();
        let store = BatchStore::new(dir.path(), "p");
        assert!(store.list(ResultKind::Attention).unwrap().is_empty());
        assert!(!store.has_batches(ResultKind::Attention).unwrap());
        store.remove_kind(ResultKind::Attention).unwrap();
    }

    #[test]
    fn remove_kind_detaches_the_whole_directory() {
        let dir = tempdir().unwrap();
        let store = BatchStore::new(dir.path(), "p");
        for index in 0..3 {
            store
                .write(ResultKind::Embeddings, BatchIndex::new(index), vec![tensor(0.0)])
                .unwrap();
        }
        // Leftover from an earlier interrupted removal.
        fs::create_dir_all(store.tombstone_dir(ResultKind::Embeddings)).unwrap();

        store.remove_kind(ResultKind::Embeddings).unwrap();

        assert!(!store.kind_dir(ResultKind::Embeddings).exists());
        assert!(!store.tombstone_dir(ResultKind::Embeddings).exists());
    }

    #[test]
    fn purge_tombstones_clears_interrupted_removals_only() {
        let dir = tempdir().unwrap();
        let store = BatchStore::new(dir.path(), "p");
        store
            .write(ResultKind::Attention, BatchIndex::FIRST, vec![tensor(1.0)])
            .unwrap();
        let tombstone = store.tombstone_dir(ResultKind::Embeddings);
        fs::create_dir_all(&tombstone).unwrap();
        fs::write(tombstone.join("p_embeddings_batch2.bin"), b"partial").unwrap();

        assert_eq!(store.purge_tombstones().unwrap(), 1);
        assert!(!tombstone.exists());
        assert!(store.has_batches(ResultKind::Attention).unwrap());
        assert_eq!(store.purge_tombstones().unwrap(), 0);
    }
}
