use std::{
    fs,
    path::{Path, PathBuf},
};

use common::{
    error::AppError,
    types::{ResultKind, StoredValue},
    utils::config::OutputEncoding,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::storage::{write_atomic, BatchStore};

/// Outcome of merging one result kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateReport {
    pub kind: ResultKind,
    pub artifact_path: PathBuf,
    pub elements: usize,
    pub files_merged: usize,
    pub files_skipped: usize,
    /// False when the artifact could not be confirmed and batch files were kept.
    pub sources_removed: bool,
}

/// Merges the batch files of a [`BatchStore`] into one artifact per result kind.
pub struct Aggregator<'a> {
    store: &'a BatchStore,
    encoding: OutputEncoding,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a BatchStore, encoding: OutputEncoding) -> Self {
        Self { store, encoding }
    }

    pub fn artifact_path(&self, kind: ResultKind) -> PathBuf {
        self.store
            .root()
            .join(format!("{kind}.{}", self.encoding.extension()))
    }

    /// Concatenates all batch files of `kind` in batch order and writes the artifact.
    ///
    /// Files that are not a list container are skipped with a warning. A conversion
    /// failure in interchange mode aborts this kind and leaves its batch files alone.
    /// The batch directory is removed only once the artifact is confirmed on disk.
    #[tracing::instrument(skip(self), fields(encoding = %self.encoding))]
    pub fn aggregate(&self, kind: ResultKind) -> Result<AggregateReport, AppError> {
        let files = self.store.list(kind)?;

        let mut elements = Vec::new();
        let mut files_merged = 0usize;
        let mut files_skipped = 0usize;
        for file in &files {
            match load_batch(&file.path) {
                Ok(items) => {
                    files_merged = files_merged.saturating_add(1);
                    elements.extend(items);
                }
                Err(err @ AppError::MalformedBatchFile { .. }) => {
                    files_skipped = files_skipped.saturating_add(1);
                    warn!(
                        kind = %kind,
                        batch = ?file.index.map(|index| index.value()),
                        error = %err,
                        "Skipping batch file that does not contain a list"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let element_count = elements.len();
        let body = self.encode(elements)?;
        let artifact_path = self.artifact_path(kind);

        let written = write_atomic(&artifact_path, &body);
        if let Err(err) = &written {
            warn!(
                kind = %kind,
                path = %artifact_path.display(),
                error = %err,
                "failed to write aggregate artifact"
            );
        }

        let sources_removed = if written.is_ok() && artifact_path.is_file() {
            self.remove_sources(kind)
        } else {
            let incomplete = AppError::ArtifactWriteIncomplete(artifact_path.clone());
            warn!(
                kind = %kind,
                error = %incomplete,
                "Aggregation failed. Original batch files were not removed"
            );
            false
        };

        info!(
            kind = %kind,
            elements = element_count,
            files_merged,
            files_skipped,
            path = %artifact_path.display(),
            "aggregated batch results"
        );

        Ok(AggregateReport {
            kind,
            artifact_path,
            elements: element_count,
            files_merged,
            files_skipped,
            sources_removed,
        })
    }

    fn encode(&self, elements: Vec<StoredValue>) -> Result<Vec<u8>, AppError> {
        match self.encoding {
            OutputEncoding::Native => StoredValue::List(elements).encode(),
            OutputEncoding::Interchange => {
                let nested = elements
                    .iter()
                    .map(StoredValue::to_interchange)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(serde_json::to_vec(&Value::Array(nested))?)
            }
        }
    }

    fn remove_sources(&self, kind: ResultKind) -> bool {
        match self.store.remove_kind(kind) {
            Ok(()) => {
                info!(kind = %kind, "Original batch files removed");
                true
            }
            Err(err) => {
                warn!(kind = %kind, error = %err, "failed to remove batch files after aggregation");
                false
            }
        }
    }
}

fn load_batch(path: &Path) -> Result<Vec<StoredValue>, AppError> {
    let raw = fs::read(path)?;
    match StoredValue::decode(&raw) {
        Ok(StoredValue::List(items)) => Ok(items),
        Ok(other) => Err(AppError::MalformedBatchFile {
            path: path.to_path_buf(),
            reason: format!("expected a list, found {}", other.type_name()),
        }),
        Err(err) => Err(AppError::MalformedBatchFile {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }),
    }
}
