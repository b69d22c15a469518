use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use common::{error::AppError, types::BatchIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::write_atomic;
use crate::reader::Cursor;

pub const CHECKPOINT_FILE_NAME: &str = "progress.json";
pub const CHECKPOINT_VERSION: u32 = 1;

fn current_checkpoint_version() -> u32 {
    CHECKPOINT_VERSION
}

/// Cumulative record accounting for one input, carried across resumed runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub records_read: u64,
    pub records_filtered: u64,
    pub records_encoded: u64,
    pub batches_written: u64,
    pub batches_skipped: u64,
}

/// Progress recorded after the last fully processed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "current_checkpoint_version")]
    pub version: u32,
    /// File name of the input the checkpoint belongs to.
    pub source: String,
    pub next_batch: BatchIndex,
    pub cursor: Cursor,
    #[serde(default)]
    pub counters: RunCounters,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(source: &Path, next_batch: BatchIndex, cursor: Cursor, counters: RunCounters) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            source: source_name(source),
            next_batch,
            cursor,
            counters,
            updated_at: Utc::now(),
        }
    }

    pub fn belongs_to(&self, source: &Path) -> bool {
        self.source == source_name(source)
    }
}

fn source_name(source: &Path) -> String {
    source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(CHECKPOINT_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Checkpoint>, AppError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&raw)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            warn!(
                path = %self.path.display(),
                version = checkpoint.version,
                expected = CHECKPOINT_VERSION,
                "checkpoint version differs; reading it as current"
            );
        }
        Ok(Some(checkpoint))
    }

    pub fn persist(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(checkpoint)?;
        write_atomic(&self.path, &body)?;
        debug!(
            next_batch = %checkpoint.next_batch,
            line = checkpoint.cursor.line(),
            "checkpoint saved"
        );
        Ok(())
    }

    pub fn clear(&self) -> Result<(), AppError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
