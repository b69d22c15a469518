mod layout;


pub use layout::{validate_input, OutputLayout};

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use common::{
    error::AppError,
    types::{BatchIndex, Record, ResultKind, Tensor},
    utils::config::PipelineConfig,
};
use tracing::{debug, error, info, warn};

use crate::{
    aggregator::{AggregateReport, Aggregator},
    encoder::{EmbeddingService, EncodedBatch},
    filter::filter_records,
    monitor::ResourceMonitor,
    reader::{read_batch, Cursor},
    storage::{BatchStore, Checkpoint, CheckpointStore, RunCounters},
};

pub const ASSESSMENT_HEADER: &str = ">>batch_id,length(bp),time(s),cpu(%),gpu_mem,mem(MB)";

/// Measurements for one encoded batch when length assessment is on.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentSample {
    pub batch: BatchIndex,
    pub residues: usize,
    pub elapsed: Duration,
    pub cpu_percent: Option<f32>,
    pub device_memory_mb: Option<f64>,
    pub memory_delta_mb: Option<f64>,
}

/// Renders a sample as `>>batch_<i>,<length>,<seconds>,<cpu%>,<device mem>,<mem delta>`,
/// writing `NA` for unavailable readings.
pub fn format_assessment_line(sample: &AssessmentSample) -> String {
    fn or_na<T>(value: Option<T>, render: impl Fn(T) -> String) -> String {
        value.map_or_else(|| "NA".to_string(), render)
    }

    format!(
        ">>batch_{},{},{:.3},{},{},{}",
        sample.batch,
        sample.residues,
        sample.elapsed.as_secs_f64(),
        or_na(sample.cpu_percent, |cpu| format!("{cpu:.1}")),
        or_na(sample.device_memory_mb, |mb| format!("{mb:.1}")),
        or_na(sample.memory_delta_mb, |mb| format!("{mb:.2}")),
    )
}

/// What happened to one result kind after the batch loop.
#[derive(Debug)]
pub enum AggregateOutcome {
    Aggregated(AggregateReport),
    /// Resumed run with no batch files left and the artifact already on disk.
    AlreadyAggregated(PathBuf),
    Failed(AppError),
}

impl AggregateOutcome {
    /// True when the artifact is final and no batch files of the kind remain.
    pub fn is_settled(&self) -> bool {
        match self {
            Self::Aggregated(report) => report.sources_removed,
            Self::AlreadyAggregated(_) => true,
            Self::Failed(_) => false,
        }
    }
}

/// Results kept in memory when batch persistence is disabled, in record order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InMemoryResults {
    pub embeddings: Vec<Tensor>,
    pub attentions: Vec<Tensor>,
}

impl InMemoryResults {
    fn extend(&mut self, batch: EncodedBatch) {
        self.embeddings.extend(batch.embeddings);
        self.attentions.extend(batch.attentions);
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub counters: RunCounters,
    /// Batch index the next batch would receive; equals the number of written batches.
    pub next_batch: BatchIndex,
    pub resumed: bool,
    pub aggregates: Vec<(ResultKind, AggregateOutcome)>,
    pub in_memory: Option<InMemoryResults>,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.aggregates.iter().all(|(_, outcome)| outcome.is_settled())
    }
}

/// Where the batch loop starts.
struct StartPoint {
    cursor: Cursor,
    next_batch: BatchIndex,
    counters: RunCounters,
    resumed: bool,
}

impl StartPoint {
    fn fresh() -> Self {
        Self {
            cursor: Cursor::START,
            next_batch: BatchIndex::FIRST,
            counters: RunCounters::default(),
            resumed: false,
        }
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct EmbeddingPipeline {
    config: PipelineConfig,
    encoder: Arc<dyn EmbeddingService>,
    monitor: Arc<dyn ResourceMonitor>,
}

impl EmbeddingPipeline {
    pub fn new(
        config: PipelineConfig,
        encoder: Arc<dyn EmbeddingService>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            config,
            encoder,
            monitor,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Streams `input` through filter and encoder batch by batch, then aggregates every
    /// result kind. Batch-loop errors end the run; aggregation errors are reported per
    /// kind in the summary.
    #[tracing::instrument(
        skip_all,
        fields(
            input = %input.display(),
            encoder = self.encoder.backend_label(),
            batch_size = self.config.effective_batch_size(),
            persist = self.config.persist_batches
        )
    )]
    pub async fn run(&self, input: &Path) -> Result<RunSummary, AppError> {
        validate_input(&self.config, input)?;
        let layout = OutputLayout::for_input(input)?;
        fs::create_dir_all(&layout.output_dir)?;

        let store = BatchStore::new(&layout.output_dir, &layout.basename);
        let checkpoints = CheckpointStore::new(&layout.output_dir);
        let start = if self.config.persist_batches {
            let purged = store.purge_tombstones()?;
            if purged > 0 {
                warn!(
                    output_dir = %store.root().display(),
                    purged,
                    "deleted batch files left by an interrupted cleanup"
                );
            }
            self.prepare_start(input, &store, &checkpoints)?
        } else {
            StartPoint::fresh()
        };

        let batch_size = self.config.effective_batch_size();
        let max_length = self.config.max_sequence_length;
        let mut cursor = start.cursor;
        let mut index = start.next_batch;
        let mut counters = start.counters;
        let mut in_memory = (!self.config.persist_batches).then(InMemoryResults::default);

        if self.config.enable_length_assessment {
            info!("{ASSESSMENT_HEADER}");
        }

        loop {
            let (records, next_cursor) = read_batch(input, cursor, batch_size)?;
            if records.is_empty() {
                break;
            }
            counters.records_read = counters.records_read.saturating_add(count(records.len()));

            let kept = filter_records(&records, max_length);
            let dropped = records.len().saturating_sub(kept.len());
            counters.records_filtered = counters.records_filtered.saturating_add(count(dropped));
            if dropped > 0 {
                debug!(batch = %index, dropped, max_length, "filtered oversize records");
            }

            if kept.is_empty() {
                info!(
                    batch = %index,
                    line = next_cursor.line(),
                    "every record in this read exceeded the length limit; skipping"
                );
                counters.batches_skipped = counters.batches_skipped.saturating_add(1);
                cursor = next_cursor;
                if self.config.persist_batches {
                    checkpoints.persist(&Checkpoint::new(input, index, cursor, counters))?;
                }
                continue;
            }

            let encoded = self.encode_batch(index, &kept).await?;
            match in_memory.as_mut() {
                Some(results) => results.extend(encoded),
                None => {
                    store.write(ResultKind::Embeddings, index, encoded.embeddings)?;
                    store.write(ResultKind::Attention, index, encoded.attentions)?;
                }
            }

            counters.records_encoded = counters.records_encoded.saturating_add(count(kept.len()));
            counters.batches_written = counters.batches_written.saturating_add(1);
            info!(
                batch = %index,
                records = kept.len(),
                line = next_cursor.line(),
                "batch processed"
            );

            index = index.next();
            cursor = next_cursor;
            if self.config.persist_batches {
                checkpoints.persist(&Checkpoint::new(input, index, cursor, counters))?;
            }
        }

        info!(
            records_read = counters.records_read,
            records_filtered = counters.records_filtered,
            records_encoded = counters.records_encoded,
            batches = counters.batches_written,
            "input exhausted"
        );

        let aggregates = if self.config.persist_batches {
            self.aggregate_all(&store, &checkpoints, start.resumed)?
        } else {
            Vec::new()
        };

        Ok(RunSummary {
            output_dir: layout.output_dir,
            counters,
            next_batch: index,
            resumed: start.resumed,
            aggregates,
            in_memory,
        })
    }

    fn prepare_start(
        &self,
        input: &Path,
        store: &BatchStore,
        checkpoints: &CheckpointStore,
    ) -> Result<StartPoint, AppError> {
        if self.config.resume {
            if let Some(checkpoint) = checkpoints.load()? {
                if !checkpoint.belongs_to(input) {
                    return Err(AppError::Validation(format!(
                        "checkpoint {} was written for {}, not {}",
                        checkpoints.path().display(),
                        checkpoint.source,
                        input.display()
                    )));
                }
                info!(
                    next_batch = %checkpoint.next_batch,
                    line = checkpoint.cursor.line(),
                    records_read = checkpoint.counters.records_read,
                    "resuming from checkpoint"
                );
                return Ok(StartPoint {
                    cursor: checkpoint.cursor,
                    next_batch: checkpoint.next_batch,
                    counters: checkpoint.counters,
                    resumed: true,
                });
            }
            info!("no checkpoint found; starting from the beginning");
        }

        let mut stale = false;
        for kind in ResultKind::ALL {
            if store.has_batches(kind)? {
                stale = true;
                store.remove_kind(kind)?;
            }
        }
        if checkpoints.path().exists() {
            stale = true;
            checkpoints.clear()?;
        }
        if stale {
            warn!(
                output_dir = %store.root().display(),
                "discarded batch files and checkpoint left by an earlier run"
            );
        }
        Ok(StartPoint::fresh())
    }

    /// Encodes one filtered batch, checking alignment and logging the assessment line.
    #[tracing::instrument(skip_all, fields(batch = %index, records = records.len()))]
    async fn encode_batch(
        &self,
        index: BatchIndex,
        records: &[Record],
    ) -> Result<EncodedBatch, AppError> {
        let assess = self.config.enable_length_assessment;
        let memory_before = if assess {
            // Resets the CPU window so the next reading covers only the encoder call.
            let _ = self.monitor.cpu_percent();
            self.monitor.process_memory_mb()
        } else {
            None
        };

        let started = Instant::now();
        let encoded = self.encoder.encode(records).await?;
        let elapsed = started.elapsed();
        encoded.ensure_aligned(records.len())?;

        if assess {
            let memory_delta_mb = memory_before
                .zip(self.monitor.process_memory_mb())
                .map(|(before, after)| after - before);
            let sample = AssessmentSample {
                batch: index,
                residues: records.iter().map(Record::residue_count).sum(),
                elapsed,
                cpu_percent: self.monitor.cpu_percent(),
                device_memory_mb: encoded
                    .peak_device_memory_mb
                    .or_else(|| self.monitor.device_memory_used()),
                memory_delta_mb,
            };
            info!("{}", format_assessment_line(&sample));
        } else {
            debug!(elapsed_ms = duration_millis(elapsed), "batch encoded");
        }

        Ok(encoded)
    }

    fn aggregate_all(
        &self,
        store: &BatchStore,
        checkpoints: &CheckpointStore,
        resumed: bool,
    ) -> Result<Vec<(ResultKind, AggregateOutcome)>, AppError> {
        let aggregator = Aggregator::new(store, self.config.output_encoding);
        let mut outcomes = Vec::with_capacity(ResultKind::ALL.len());

        for kind in ResultKind::ALL {
            let artifact = aggregator.artifact_path(kind);
            if resumed && artifact.is_file() && !store.has_batches(kind)? {
                info!(
                    kind = %kind,
                    path = %artifact.display(),
                    "artifact from the interrupted run is complete; keeping it"
                );
                outcomes.push((kind, AggregateOutcome::AlreadyAggregated(artifact)));
                continue;
            }

            let outcome = match aggregator.aggregate(kind) {
                Ok(report) => AggregateOutcome::Aggregated(report),
                Err(err) => {
                    error!(kind = %kind, error = %err, "aggregation failed; batch files kept");
                    AggregateOutcome::Failed(err)
                }
            };
            outcomes.push((kind, outcome));
        }

        if outcomes.iter().all(|(_, outcome)| outcome.is_settled()) {
            checkpoints.clear()?;
            debug!("all result kinds aggregated; checkpoint cleared");
        } else {
            warn!(
                checkpoint = %checkpoints.path().display(),
                "aggregation incomplete; rerun with resume to retry"
            );
        }
        Ok(outcomes)
    }
}

fn count(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
