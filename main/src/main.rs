mod args;

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use common::{
    error::AppError,
    utils::config::{get_config, PipelineConfig},
};
use embedding_pipeline::{
    build_encoder, AggregateOutcome, EmbeddingPipeline, ProcfsMonitor, ResourceMonitor,
    RunSummary,
};
use tokio::runtime::Builder;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::args::Cli;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = load_config(&cli);

    let log_dir = config.as_ref().ok().and_then(|config| config.log_dir.clone());
    let log_file = init_tracing(log_dir.as_deref());

    let outcome = log_file.and_then(|log_file| {
        if let Some(path) = log_file {
            info!(path = %path.display(), "writing run log");
        }
        let config = config?;
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to create tokio runtime")?;
        runtime.block_on(run(&cli, config))
    });

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let invalid_input = err
                .downcast_ref::<AppError>()
                .is_some_and(AppError::is_invalid_input);
            if invalid_input {
                error!(input = %cli.input.display(), "invalid input: {err:#}");
            } else {
                error!("run failed: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = get_config(cli.config.as_deref()).context("loading pipeline config")?;
    cli.apply(&mut config);
    Ok(config)
}

/// Installs the stderr subscriber, plus a plain-text run log when `log_dir` is set.
/// Stderr logging is installed even when the run log cannot be created.
fn init_tracing(log_dir: Option<&Path>) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (run_log, failure) = match log_dir.map(open_run_log).transpose() {
        Ok(run_log) => (run_log, None),
        Err(err) => (None, Some(err)),
    };
    let (file, log_path) = run_log.unzip();
    let file_layer =
        file.map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .ok();

    match failure {
        Some(err) => Err(err),
        None => Ok(log_path),
    }
}

fn open_run_log(dir: &Path) -> Result<(File, PathBuf)> {
    fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    let path = dir.join(format!("run_{}.log", Local::now().format("%Y-%m-%d_%H-%M")));
    let file =
        File::create(&path).with_context(|| format!("creating log file {}", path.display()))?;
    Ok((file, path))
}

async fn run(cli: &Cli, config: PipelineConfig) -> Result<()> {
    let encoder = build_encoder(&config.encoder).context("building encoder")?;
    let monitor: Arc<dyn ResourceMonitor> = Arc::new(ProcfsMonitor::new());
    info!(
        encoder = encoder.backend_label(),
        batch_size = config.effective_batch_size(),
        max_sequence_length = config.max_sequence_length,
        output_encoding = %config.output_encoding,
        "starting embedding run"
    );

    let pipeline = EmbeddingPipeline::new(config, encoder, monitor)?;
    let summary = pipeline.run(&cli.input).await?;
    report(&summary);
    Ok(())
}

fn report(summary: &RunSummary) {
    info!(
        output_dir = %summary.output_dir.display(),
        resumed = summary.resumed,
        records_read = summary.counters.records_read,
        records_filtered = summary.counters.records_filtered,
        records_encoded = summary.counters.records_encoded,
        batches = summary.counters.batches_written,
        skipped_batches = summary.counters.batches_skipped,
        "run finished"
    );

    for (kind, outcome) in &summary.aggregates {
        match outcome {
            AggregateOutcome::Aggregated(report) => info!(
                kind = %kind,
                path = %report.artifact_path.display(),
                elements = report.elements,
                "artifact ready"
            ),
            AggregateOutcome::AlreadyAggregated(path) => {
                info!(kind = %kind, path = %path.display(), "artifact ready");
            }
            AggregateOutcome::Failed(err) => {
                warn!(kind = %kind, error = %err, "artifact not produced");
            }
        }
    }

    if let Some(results) = &summary.in_memory {
        info!(
            embeddings = results.embeddings.len(),
            attentions = results.attentions.len(),
            "results kept in memory only"
        );
    }
}
