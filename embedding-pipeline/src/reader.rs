use std::{
    fs::File,
    io::{BufRead, BufReader, ErrorKind, Seek, SeekFrom},
    path::Path,
};

use common::{error::AppError, types::Record};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Resume point in a FASTA source.
///
/// `line` is the index of the last consumed line (`-1` before the first line). `byte`
/// is the byte offset of the line after it; when present the reader seeks straight
/// there, otherwise it skips `line + 1` lines from the top of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    line: i64,
    #[serde(default)]
    byte: Option<u64>,
}

impl Cursor {
    pub const START: Self = Self {
        line: -1,
        byte: Some(0),
    };

    /// A cursor known only by line index; resuming from it re-scans to that line.
    pub fn from_line(line: i64) -> Self {
        if line < 0 {
            Self::START
        } else {
            Self { line, byte: None }
        }
    }

    pub fn line(&self) -> i64 {
        self.line
    }

    pub fn byte(&self) -> Option<u64> {
        self.byte
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::START
    }
}

/// Reads the next batch of at most `batch_size` records after `start`.
///
/// The header line that would open record `batch_size + 1` is left unconsumed and the
/// returned cursor stops just before it. An exhausted source yields no records and hands
/// `start` back unchanged.
pub fn read_batch(
    path: &Path,
    start: Cursor,
    batch_size: usize,
) -> Result<(Vec<Record>, Cursor), AppError> {
    if batch_size == 0 {
        return Err(AppError::InvalidInput(
            "batch size must be at least 1".to_string(),
        ));
    }

    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(AppError::NotFound(format!(
                "FASTA source {}",
                path.display()
            )))
        }
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);

    let mut byte_pos = position_reader(&mut reader, start)?;
    let mut next_line = start.line.saturating_add(1);
    let mut last_consumed = start.line;

    let mut records = Vec::new();
    let mut current: Option<Record> = None;
    let mut headers_seen = 0usize;
    let mut buf = String::new();

    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }

        let line = buf.trim();
        if let Some(identifier) = line.strip_prefix('>') {
            if headers_seen == batch_size {
                break;
            }
            headers_seen = headers_seen.saturating_add(1);
            if let Some(done) = current.take() {
                records.push(done);
            }
            current = Some(Record::new(identifier, String::new()));
        } else if let Some(record) = current.as_mut() {
            record.sequence.push_str(line);
        } else if !line.is_empty() {
            debug!(
                path = %path.display(),
                line = next_line,
                "dropping sequence line without a preceding header"
            );
        }

        last_consumed = next_line;
        next_line = next_line.saturating_add(1);
        byte_pos = byte_pos.saturating_add(read as u64);
    }

    if let Some(done) = current.take() {
        records.push(done);
    }

    if headers_seen == 0 {
        return Ok((Vec::new(), start));
    }

    Ok((
        records,
        Cursor {
            line: last_consumed,
            byte: Some(byte_pos),
        },
    ))
}

/// Moves the reader to the first unconsumed line and returns its byte offset.
fn position_reader(reader: &mut BufReader<File>, start: Cursor) -> Result<u64, AppError> {
    if let Some(byte) = start.byte {
        reader.seek(SeekFrom::Start(byte))?;
        return Ok(byte);
    }

    let mut byte_pos = 0u64;
    let mut skipped = -1i64;
    let mut scratch = Vec::new();
    while skipped < start.line {
        scratch.clear();
        let read = reader.read_until(b'\n', &mut scratch)?;
        if read == 0 {
            break;
        }
        byte_pos = byte_pos.saturating_add(read as u64);
        skipped = skipped.saturating_add(1);
    }
    Ok(byte_pos)
}
