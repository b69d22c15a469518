use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::anyhow;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::debug;

use crate::error::AppError;

/// Batch size used when per-batch length assessment is enabled.
pub const ASSESSMENT_BATCH_SIZE: usize = 1;
/// Batch size used for plain throughput runs.
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_MAX_SEQUENCE_LENGTH: usize = 1024;

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    /// Binary serialized object form, able to hold any stored value.
    #[default]
    Native,
    /// Plain JSON of nested numeric lists.
    Interchange,
}

impl OutputEncoding {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Native => "bin",
            Self::Interchange => "json",
        }
    }
}

impl FromStr for OutputEncoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "bin" | "binary" => Ok(Self::Native),
            "interchange" | "json" => Ok(Self::Interchange),
            other => Err(anyhow!(
                "unknown output encoding '{other}'. Expected 'native' or 'interchange'."
            )),
        }
    }
}

impl fmt::Display for OutputEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Interchange => write!(f, "interchange"),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EncoderBackend {
    #[default]
    Hashed,
    Command,
}

impl FromStr for EncoderBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hashed" => Ok(Self::Hashed),
            "command" | "cmd" | "external" => Ok(Self::Command),
            other => Err(anyhow!(
                "unknown encoder backend '{other}'. Expected 'hashed' or 'command'."
            )),
        }
    }
}

impl fmt::Display for EncoderBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hashed => write!(f, "hashed"),
            Self::Command => write!(f, "command"),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
pub struct EncoderConfig {
    #[serde(default)]
    pub backend: EncoderBackend,
    #[serde(default = "default_encoder_dimension")]
    pub dimension: usize,
    /// Program and arguments for the `command` backend.
    #[serde(default)]
    pub command: Vec<String>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backend: EncoderBackend::default(),
            dimension: default_encoder_dimension(),
            command: Vec::new(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Explicit batch size; when unset it follows `enable_length_assessment`.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
    #[serde(default)]
    pub enable_length_assessment: bool,
    #[serde(default = "default_true")]
    pub persist_batches: bool,
    #[serde(default)]
    pub output_encoding: OutputEncoding,
    #[serde(default)]
    pub resume: bool,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub encoder: EncoderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: None,
            max_sequence_length: default_max_sequence_length(),
            enable_length_assessment: false,
            persist_batches: true,
            output_encoding: OutputEncoding::default(),
            resume: false,
            allowed_extensions: default_allowed_extensions(),
            log_dir: None,
            encoder: EncoderConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(if self.enable_length_assessment {
            ASSESSMENT_BATCH_SIZE
        } else {
            DEFAULT_BATCH_SIZE
        })
    }

    /// Checks the values that cannot be expressed through serde defaults alone.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.effective_batch_size() == 0 {
            return Err(AppError::InvalidInput(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.allowed_extensions.is_empty() {
            return Err(AppError::Validation(
                "allowed_extensions must name at least one extension".to_string(),
            ));
        }
        if self.encoder.backend == EncoderBackend::Command && self.encoder.command.is_empty() {
            return Err(AppError::Validation(
                "encoder.command is required for the command backend".to_string(),
            ));
        }
        Ok(())
    }

    /// True when `path` carries one of the configured extensions (case-insensitive).
    pub fn accepts_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.allowed_extensions
                    .iter()
                    .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
            })
    }
}

fn default_true() -> bool {
    true
}

fn default_max_sequence_length() -> usize {
    DEFAULT_MAX_SEQUENCE_LENGTH
}

fn default_encoder_dimension() -> usize {
    32
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["fasta".to_string(), "fa".to_string()]
}

/// Loads configuration from an optional `pipeline-config.*` file in the working
/// directory, an explicit file, and `PIPELINE_*` environment variables, in that order.
pub fn get_config(explicit: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let mut builder =
        Config::builder().add_source(File::with_name("pipeline-config").required(false));
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading pipeline config file");
        builder = builder.add_source(File::from(path).required(true));
    }

    let config = builder
        .add_source(
            Environment::with_prefix("PIPELINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("allowed_extensions")
                .with_list_parse_key("encoder.command"),
        )
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn batch_size_follows_length_assessment_when_unset() {
        let plain = PipelineConfig::default();
        assert_eq!(plain.effective_batch_size(), DEFAULT_BATCH_SIZE);

        let assessing = PipelineConfig {
            enable_length_assessment: true,
            ..Default::default()
        };
        assert_eq!(assessing.effective_batch_size(), ASSESSMENT_BATCH_SIZE);

        let explicit = PipelineConfig {
            enable_length_assessment: true,
            batch_size: Some(7),
            ..Default::default()
        };
        assert_eq!(explicit.effective_batch_size(), 7);
    }

    #[test]
    fn validate_rejects_zero_batch_size() {
        let config = PipelineConfig {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn validate_requires_command_for_command_backend() {
        let config = PipelineConfig {
            encoder: EncoderConfig {
                backend: EncoderBackend::Command,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn accepts_configured_extensions_only() {
        let config = PipelineConfig::default();
        assert!(config.accepts_extension(Path::new("/data/proteins.fasta")));
        assert!(config.accepts_extension(Path::new("proteins.FA")));
        assert!(!config.accepts_extension(Path::new("proteins.txt")));
        assert!(!config.accepts_extension(Path::new("proteins")));
    }

    #[test]
    fn output_encoding_parses_aliases() {
        assert_eq!(
            "json".parse::<OutputEncoding>().unwrap(),
            OutputEncoding::Interchange
        );
        assert_eq!(
            "Native".parse::<OutputEncoding>().unwrap(),
            OutputEncoding::Native
        );
        assert!("pickle".parse::<OutputEncoding>().is_err());
    }

    #[test]
    fn get_config_reads_explicit_file_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        std::fs::write(
            &path,
            "batch_size = 4\noutput_encoding = \"interchange\"\n\n[encoder]\ndimension = 8\n",
        )
        .unwrap();

        let config = get_config(Some(&path)).expect("config loads");
        assert_eq!(config.batch_size, Some(4));
        assert_eq!(config.output_encoding, OutputEncoding::Interchange);
        assert_eq!(config.encoder.dimension, 8);
        assert_eq!(config.encoder.backend, EncoderBackend::Hashed);
        assert_eq!(config.max_sequence_length, DEFAULT_MAX_SEQUENCE_LENGTH);
        assert!(config.persist_batches);
        assert_eq!(config.allowed_extensions, vec!["fasta", "fa"]);
    }
}
