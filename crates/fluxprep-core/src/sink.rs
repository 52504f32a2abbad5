use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use polars::io::parquet::write::{ParquetCompression, ParquetWriter, StatisticsOptions};
use polars::prelude::PolarsError;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::dataset::{Dataset, DatasetError};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode dataset: {0}")]
    Dataset(#[from] DatasetError),
    #[error("failed to write parquet: {0}")]
    Parquet(#[from] PolarsError),
    #[error("failed to encode attributes: {0}")]
    Attributes(#[from] serde_json::Error),
}

/// Where corrected datasets go. Returns the path actually written.
pub trait DatasetSink {
    fn write(&mut self, requested: &Path, dataset: &Dataset) -> Result<PathBuf, SinkError>;
}

/// Writes the dataset as zstd-compressed parquet next to a JSON file holding the
/// dataset metadata and every variable's attributes.
#[derive(Debug, Clone, Default)]
pub struct ParquetSink;

impl ParquetSink {
    pub fn new() -> Self {
        Self
    }

    /// `site.nc` becomes `site.parquet`.
    pub fn data_path(requested: &Path) -> PathBuf {
        requested.with_extension("parquet")
    }

    pub fn attributes_path(requested: &Path) -> PathBuf {
        requested.with_extension("attributes.json")
    }
}

#[derive(Serialize)]
struct AttributeDocument<'a> {
    metadata: &'a BTreeMap<String, String>,
    variables: BTreeMap<&'a str, &'a BTreeMap<String, String>>,
}

impl DatasetSink for ParquetSink {
    fn write(&mut self, requested: &Path, dataset: &Dataset) -> Result<PathBuf, SinkError> {
        if let Some(parent) = requested.parent() {
            fs::create_dir_all(parent).map_err(|source| SinkError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let path = Self::data_path(requested);
        let mut frame = dataset.to_dataframe()?;
        let file = File::create(&path).map_err(|source| SinkError::Io {
            path: path.clone(),
            source,
        })?;
        ParquetWriter::new(file)
            .with_compression(ParquetCompression::Zstd(None))
            .with_statistics(StatisticsOptions::default())
            .finish(&mut frame)?;

        let attributes = AttributeDocument {
            metadata: dataset.metadata(),
            variables: dataset
                .variables()
                .map(|variable| (variable.name(), &variable.attributes))
                .collect(),
        };
        let attributes_path = Self::attributes_path(requested);
        let encoded = serde_json::to_vec_pretty(&attributes)?;
        fs::write(&attributes_path, encoded).map_err(|source| SinkError::Io {
            path: attributes_path.clone(),
            source,
        })?;

        info!(
            path = %path.display(),
            rows = frame.height(),
            columns = frame.width(),
            "Wrote dataset"
        );
        Ok(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkRecord {
    pub path: PathBuf,
    pub variable_names: Vec<String>,
    pub row_count: usize,
    pub processing_level: Option<String>,
}

/// Records writes without touching the filesystem.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub writes: Vec<SinkRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatasetSink for MemorySink {
    fn write(&mut self, requested: &Path, dataset: &Dataset) -> Result<PathBuf, SinkError> {
        self.writes.push(SinkRecord {
            path: requested.to_path_buf(),
            variable_names: dataset
                .variable_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            row_count: dataset.len(),
            processing_level: dataset.metadata().get("processing_level").cloned(),
        });
        Ok(requested.to_path_buf())
    }
}
