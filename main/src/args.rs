use std::path::PathBuf;

use clap::Parser;
use common::utils::config::{EncoderBackend, OutputEncoding, PipelineConfig};

/// Encode a FASTA file batch by batch into per-residue embeddings and attention maps.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// FASTA file to encode
    pub input: PathBuf,

    /// Extra configuration file, applied after `pipeline-config.*` and before
    /// `PIPELINE_*` environment variables
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Records per batch (defaults to 1 with --length-assessment, else 10)
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Longest sequence, in residues, passed to the encoder
    #[arg(long)]
    pub max_sequence_length: Option<usize>,

    /// Log time, CPU and memory per batch against sequence length
    #[arg(long)]
    pub length_assessment: bool,

    /// Keep results in memory instead of writing batch files and artifacts
    #[arg(long)]
    pub in_memory: bool,

    /// Artifact encoding: native or interchange
    #[arg(long)]
    pub output_encoding: Option<OutputEncoding>,

    /// Continue from the checkpoint left by an interrupted run
    #[arg(long)]
    pub resume: bool,

    /// Directory for run log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Encoder backend: hashed or command
    #[arg(long)]
    pub encoder: Option<EncoderBackend>,

    /// Embedding width of the hashed encoder
    #[arg(long)]
    pub dimension: Option<usize>,

    /// Program and arguments of the command encoder, comma separated
    #[arg(long = "encoder-command", value_delimiter = ',')]
    pub encoder_command: Vec<String>,
}

impl Cli {
    /// Overrides loaded configuration with the flags that were given.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(batch_size) = self.batch_size {
            config.batch_size = Some(batch_size);
        }
        if let Some(max) = self.max_sequence_length {
            config.max_sequence_length = max;
        }
        if self.length_assessment {
            config.enable_length_assessment = true;
        }
        if self.in_memory {
            config.persist_batches = false;
        }
        if let Some(encoding) = self.output_encoding {
            config.output_encoding = encoding;
        }
        if self.resume {
            config.resume = true;
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
        if let Some(backend) = self.encoder {
            config.encoder.backend = backend;
        }
        if let Some(dimension) = self.dimension {
            config.encoder.dimension = dimension;
        }
        if !self.encoder_command.is_empty() {
            config.encoder.command.clone_from(&self.encoder_command);
        }
    }
}
