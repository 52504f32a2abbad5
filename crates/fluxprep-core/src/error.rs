// crates/fluxprep-core/src/error.rs

use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::DatasetError;
use crate::ingest::IngestError;
use crate::kernels::KernelError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read control file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("control file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("'{0}' section not in control file")]
    MissingSection(&'static str),

    #[error("{section}: '{key}' not in section")]
    MissingKey { section: &'static str, key: String },

    #[error("{section}: '{key}' has an unexpected type (expected {expected})")]
    InvalidType {
        section: String,
        key: String,
        expected: &'static str,
    },
}

/// Step-fatal failures. None of these stop a pipeline run.
#[derive(Error, Debug)]
pub enum CorrectionError {
    #[error("no correction named '{0}' is registered")]
    UnknownCorrection(String),

    #[error("none of the requested variables {requested:?} exist in the dataset")]
    EmptySelection { requested: Vec<String> },

    #[error("correction changed data dimensions from {expected:?} to {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("correction returned columns {found:?}, expected {expected:?}")]
    ColumnMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("invalid arguments for {function}: {message}")]
    InvalidArguments {
        function: &'static str,
        message: String,
    },

    #[error("kernel failed: {0}")]
    Kernel(#[from] KernelError),

    #[error("dataset update failed: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Polars operation failed: {0}")]
    Polars(#[from] polars::error::PolarsError),
}

/// Per-file failures surfaced by the batch driver.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("ingestion failed: {0}")]
    Ingest(#[from] IngestError),

    #[error("invalid input file pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("no input file was found using pattern {pattern} in {directory}")]
    NoInputFiles { pattern: String, directory: PathBuf },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
