use std::process::Stdio;

use async_trait::async_trait;
use common::{
    error::AppError,
    types::{Record, Tensor},
};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, warn};

use super::{EmbeddingService, EncodedBatch};

#[derive(Serialize)]
struct EncodeRequest<'a> {
    records: &'a [Record],
}

#[derive(Deserialize)]
struct EncodeResponse {
    embeddings: Vec<Vec<Vec<f32>>>,
    attentions: Vec<Vec<Vec<f32>>>,
    #[serde(default)]
    peak_device_memory_mb: Option<f64>,
}

/// Runs an external encoder program once per batch.
///
/// The program receives `{"records": [{"identifier", "sequence"}, ...]}` as JSON on
/// stdin and must print `{"embeddings": [...], "attentions": [...]}` (one matrix per
/// record, nested lists) and optionally `peak_device_memory_mb` on stdout.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    program: String,
    args: Vec<String>,
}

impl CommandEncoder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl EmbeddingService for CommandEncoder {
    fn backend_label(&self) -> &str {
        "command"
    }

    async fn encode(&self, records: &[Record]) -> Result<EncodedBatch, AppError> {
        let payload = serde_json::to_vec(&EncodeRequest { records })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                AppError::Encoder(format!("failed to start encoder '{}': {err}", self.program))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Encoder("encoder stdin unavailable".into()))?;
        let feed = async move {
            stdin.write_all(&payload).await?;
            stdin.shutdown().await
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::Encoder(format!(
                "encoder '{}' exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        if let Err(err) = fed {
            // The program may legitimately stop reading early; its exit status decides.
            warn!(program = %self.program, error = %err, "encoder closed stdin early");
        }

        let response: EncodeResponse = serde_json::from_slice(&output.stdout)
            .map_err(|err| AppError::Encoder(format!("unreadable encoder output: {err}")))?;
        debug!(
            program = %self.program,
            records = records.len(),
            peak_device_memory_mb = ?response.peak_device_memory_mb,
            "external encoder finished"
        );

        Ok(EncodedBatch {
            embeddings: to_tensors(response.embeddings)?,
            attentions: to_tensors(response.attentions)?,
            peak_device_memory_mb: response.peak_device_memory_mb,
        })
    }
}

fn to_tensors(matrices: Vec<Vec<Vec<f32>>>) -> Result<Vec<Tensor>, AppError> {
    matrices.into_iter().map(Tensor::from_rows).collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandEncoder {
        CommandEncoder::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn parses_program_output() {
        let encoder = shell(
            r#"cat > /dev/null; echo '{"embeddings":[[[1.0,2.0],[3.0,4.0]]],"attentions":[[[0.5,0.5],[0.5,0.5]]],"peak_device_memory_mb":12.5}'"#,
        );

        let batch = encoder.encode(&[Record::new("a", "MK")]).await.unwrap();

        assert_eq!(batch.embeddings[0].shape(), &[2, 2]);
        assert_eq!(batch.embeddings[0].data(), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(batch.attentions[0].shape(), &[2, 2]);
        assert_eq!(batch.peak_device_memory_mb, Some(12.5));
    }

    #[tokio::test]
    async fn receives_records_on_stdin() {
        let encoder = shell(
            r#"req=$(cat); case "$req" in *'"identifier":"P1"'*) echo '{"embeddings":[],"attentions":[]}';; *) exit 3;; esac"#,
        );

        let batch = encoder.encode(&[Record::new("P1", "MK")]).await.unwrap();
        assert!(batch.embeddings.is_empty());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_encoder_error() {
        let encoder = shell("cat > /dev/null; echo boom >&2; exit 2");
        let result = encoder.encode(&[Record::new("a", "MK")]).await;
        assert!(matches!(result, Err(AppError::Encoder(message)) if message.contains("boom")));
    }

    #[tokio::test]
    async fn missing_program_is_an_encoder_error() {
        let encoder = CommandEncoder::new("/nonexistent/encoder-binary", Vec::new());
        let result = encoder.encode(&[Record::new("a", "MK")]).await;
        assert!(matches!(result, Err(AppError::Encoder(_))));
    }
}
