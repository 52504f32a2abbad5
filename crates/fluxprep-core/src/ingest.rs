use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use csv::StringRecord;
use thiserror::Error;
use toml::Value;
use tracing::{debug, info, warn};

use crate::config::{value_as_text, ControlFile};
use crate::dataset::{Dataset, DatasetError, Variable};
use crate::error::ConfigError;

/// Name of the `[Variables.*]` entry that maps the timestamp column.
pub const DATETIME_VARIABLE: &str = "DateTime";

/// Sentinel written by loggers for missing samples.
pub const MISSING_VALUE: f64 = -9999.0;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{path}: only CSV input can be read, spreadsheets are not supported")]
    UnsupportedFormat { path: PathBuf },

    #[error("{path}: CSV error: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Files: '{key}' must be a positive integer, got '{value}'")]
    InvalidRowIndex { key: &'static str, value: String },

    #[error("{path}: header row {row} not found")]
    MissingHeader { path: PathBuf, row: usize },

    #[error("Variables.{variable}: column '{column}' not in input header")]
    MissingColumn { variable: String, column: String },

    #[error("no 'DateTime' variable with a csv.name mapping is declared")]
    NoTimestampColumn,

    #[error("{path}: no data rows could be read")]
    NoData { path: PathBuf },

    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

struct ColumnMapping {
    variable: String,
    index: usize,
    attributes: BTreeMap<String, String>,
}

/// Reads the CSV named by the control file's `Files` section into a [`Dataset`].
pub fn read_csv_dataset(control: &ControlFile) -> Result<Dataset, IngestError> {
    let files = control.files()?;
    let path = files.input_path()?;
    let header_row = row_index("in_headerrow", files.in_headerrow.as_deref(), 1)?;
    let first_data_row = row_index(
        "in_firstdatarow",
        files.in_firstdatarow.as_deref(),
        header_row + 1,
    )?;
    read_csv_file(
        &path,
        control,
        header_row,
        first_data_row,
        &files.in_dateformat,
    )
}

pub fn read_csv_file(
    path: &Path,
    control: &ControlFile,
    header_row: usize,
    first_data_row: usize,
    date_format: &str,
) -> Result<Dataset, IngestError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if matches!(extension.as_deref(), Some("xls") | Some("xlsx")) {
        return Err(IngestError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let content = fs::read_to_string(path).map_err(|source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let csv_error = |source: csv::Error| IngestError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content.as_bytes());

    let mut header: Option<StringRecord> = None;
    let mut data_rows: Vec<(usize, StringRecord)> = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let line = idx + 1;
        let record = record.map_err(csv_error)?;
        if line == header_row {
            header = Some(record);
        } else if line >= first_data_row {
            data_rows.push((line, record));
        }
    }
    let header = header.ok_or_else(|| IngestError::MissingHeader {
        path: path.to_path_buf(),
        row: header_row,
    })?;

    let (time_index, mappings) = column_mappings(control, &header)?;

    let mut timestamps = Vec::with_capacity(data_rows.len());
    let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); mappings.len()];
    let mut skipped = 0usize;
    for (line, record) in &data_rows {
        let Some(raw_time) = record.get(time_index) else {
            skipped += 1;
            continue;
        };
        let Some(timestamp) = parse_timestamp(raw_time, date_format) else {
            warn!(
                line,
                value = raw_time,
                date_format,
                "Skipping row with unparseable timestamp"
            );
            skipped += 1;
            continue;
        };
        timestamps.push(timestamp);
        for (mapping, column) in mappings.iter().zip(columns.iter_mut()) {
            column.push(record.get(mapping.index).and_then(parse_value));
        }
    }

    if timestamps.is_empty() {
        return Err(IngestError::NoData {
            path: path.to_path_buf(),
        });
    }

    let mut dataset = Dataset::new(timestamps);
    for (mapping, values) in mappings.into_iter().zip(columns) {
        let mut variable = Variable::new(mapping.variable, values);
        variable.attributes = mapping.attributes;
        dataset.insert_variable(variable)?;
    }
    if let Some(global) = control.section("Global") {
        for (key, value) in global {
            if let Some(text) = value_as_text(value) {
                dataset.set_metadata(key.clone(), text);
            }
        }
    }

    info!(
        path = %path.display(),
        rows = dataset.len(),
        variables = dataset.variable_count(),
        skipped,
        "Read input file"
    );
    Ok(dataset)
}

fn column_mappings(
    control: &ControlFile,
    header: &StringRecord,
) -> Result<(usize, Vec<ColumnMapping>), IngestError> {
    let position = |column: &str| header.iter().position(|label| label.trim() == column.trim());

    let mut time_index = None;
    let mut mappings = Vec::new();
    let Some(variables) = control.section("Variables") else {
        return Err(IngestError::NoTimestampColumn);
    };
    for (name, entry) in variables {
        let Some(column) = csv_column(entry) else {
            debug!(variable = %name, "No csv.name mapping, not read from input");
            continue;
        };
        let index = position(&column).ok_or_else(|| IngestError::MissingColumn {
            variable: name.clone(),
            column: column.clone(),
        })?;
        if name == DATETIME_VARIABLE {
            time_index = Some(index);
            continue;
        }

        let attributes: BTreeMap<String, String> = entry
            .get("Attr")
            .and_then(Value::as_table)
            .map(|attr| {
                attr.iter()
                    .filter_map(|(key, value)| value_as_text(value).map(|text| (key.clone(), text)))
                    .collect()
            })
            .unwrap_or_default();
        mappings.push(ColumnMapping {
            variable: name.clone(),
            index,
            attributes,
        });
    }

    let time_index = time_index.ok_or(IngestError::NoTimestampColumn)?;
    Ok((time_index, mappings))
}

fn csv_column(entry: &Value) -> Option<String> {
    entry
        .get("csv")
        .and_then(Value::as_table)
        .and_then(|csv| csv.get("name"))
        .and_then(value_as_text)
}

/// 1-based row number; only the first comma-separated item is used.
fn row_index(key: &'static str, raw: Option<&str>, default: usize) -> Result<usize, IngestError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    let first = raw.split(',').next().unwrap_or_default().trim();
    match first.parse::<usize>() {
        Ok(row) if row > 0 => Ok(row),
        _ => Err(IngestError::InvalidRowIndex {
            key,
            value: raw.to_string(),
        }),
    }
}

fn parse_timestamp(raw: &str, format: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim().trim_matches('"');
    NaiveDateTime::parse_from_str(raw, format)
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, format)
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

fn parse_value(raw: &str) -> Option<f64> {
    let value = raw.trim().trim_matches('"').parse::<f64>().ok()?;
    (value.is_finite() && value != MISSING_VALUE).then_some(value)
}
