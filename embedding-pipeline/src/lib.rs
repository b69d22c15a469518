#![allow(clippy::missing_docs_in_private_items)]

pub mod aggregator;
pub mod encoder;
pub mod filter;
pub mod monitor;
pub mod pipeline;
pub mod reader;
pub mod storage;

pub use aggregator::{AggregateReport, Aggregator};
pub use encoder::{build_encoder, EmbeddingService, EncodedBatch};
pub use monitor::{NoopMonitor, ProcfsMonitor, ResourceMonitor};
pub use pipeline::{AggregateOutcome, EmbeddingPipeline, RunSummary};
pub use reader::{read_batch, Cursor};
