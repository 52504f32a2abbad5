pub mod batch;
pub mod compliance;
pub mod config;
pub mod dataset;
pub mod error;
pub mod ingest;
pub mod kernels;
pub mod levels;
pub mod messages;
pub mod pipeline;
pub mod registry;
pub mod sink;

pub use batch::{run_batch, BatchReport};
pub use config::ControlFile;
pub use dataset::{Dataset, Variable};
pub use error::{ConfigError, CorrectionError, PipelineError};
pub use pipeline::{CancellationFlag, CorrectionPipeline, RunSummary};
pub use sink::{DatasetSink, MemorySink, ParquetSink};
