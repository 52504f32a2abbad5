use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use polars::prelude::*;
use thiserror::Error;

pub const TIMESTAMP_COLUMN: &str = "timestamp";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("variable {name} has {found} values but the time axis has {expected}")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("quality flags for {name} have {found} entries but the time axis has {expected}")]
    FlagLengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("variable {0} not found")]
    UnknownVariable(String),
    #[error("polars operation failed: {0}")]
    Polars(#[from] PolarsError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    name: String,
    pub values: Vec<Option<f64>>,
    pub attributes: BTreeMap<String, String>,
    pub flags: Option<Vec<i32>>,
}

impl Variable {
    pub fn new(name: impl Into<String>, values: Vec<Option<f64>>) -> Self {
        Self {
            name: name.into(),
            values,
            attributes: BTreeMap::new(),
            flags: None,
        }
    }

    pub fn from_values(name: impl Into<String>, values: &[f64]) -> Self {
        Self::new(
            name,
            values
                .iter()
                .map(|v| v.is_finite().then_some(*v))
                .collect(),
        )
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_flags(mut self, flags: Vec<i32>) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn missing_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_none()).count()
    }

    /// Copy of this variable (data, attributes and flags) under another name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Appends `value` to attribute `key`, comma-joining onto any existing text.
    pub fn append_to_attribute(&mut self, key: &str, value: &str) {
        match self.attributes.get_mut(key) {
            Some(existing) if !existing.is_empty() => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            _ => {
                self.attributes.insert(key.to_string(), value.to_string());
            }
        }
    }
}

/// Variables sharing one time axis, plus dataset-level metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    timestamps: Vec<NaiveDateTime>,
    variables: BTreeMap<String, Variable>,
    metadata: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new(timestamps: Vec<NaiveDateTime>) -> Self {
        Self {
            timestamps,
            variables: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn timestamps(&self) -> &[NaiveDateTime] {
        &self.timestamps
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.keys().map(String::as_str).collect()
    }

    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    /// Inserts or replaces a variable. Returns the variable previously stored under that name.
    pub fn insert_variable(&mut self, variable: Variable) -> Result<Option<Variable>, DatasetError> {
        let expected = self.timestamps.len();
        if variable.values.len() != expected {
            return Err(DatasetError::LengthMismatch {
                name: variable.name.clone(),
                expected,
                found: variable.values.len(),
            });
        }
        if let Some(flags) = &variable.flags {
            if flags.len() != expected {
                return Err(DatasetError::FlagLengthMismatch {
                    name: variable.name.clone(),
                    expected,
                    found: flags.len(),
                });
            }
        }
        Ok(self.variables.insert(variable.name.clone(), variable))
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    /// Cuts a WorkingTable holding the requested variables that exist, in request order.
    pub fn working_table(&self, requested: &[String]) -> Result<WorkingTable<'_>, DatasetError> {
        let mut columns: Vec<Column> = Vec::new();
        let mut missing = Vec::new();
        for name in requested {
            match self.variables.get(name) {
                Some(variable) => {
                    columns.push(Series::new(name.as_str().into(), variable.values.as_slice()).into())
                }
                None => missing.push(name.clone()),
            }
        }

        let frame = if columns.is_empty() {
            DataFrame::default()
        } else {
            DataFrame::new(columns)?
        };

        Ok(WorkingTable {
            timestamps: &self.timestamps,
            frame,
            missing,
        })
    }

    /// The whole dataset as one frame: timestamp column first, then every variable.
    pub fn to_dataframe(&self) -> Result<DataFrame, DatasetError> {
        let micros: Vec<i64> = self
            .timestamps
            .iter()
            .map(|ts| ts.and_utc().timestamp_micros())
            .collect();
        let timestamp = Series::new(TIMESTAMP_COLUMN.into(), micros)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))?;

        let mut columns: Vec<Column> = Vec::with_capacity(self.variables.len() + 1);
        columns.push(timestamp.into());
        for variable in self.variables.values() {
            columns.push(Series::new(variable.name.as_str().into(), variable.values.as_slice()).into());
        }
        Ok(DataFrame::new(columns)?)
    }
}

/// Transient per-step sub-table: rows are timestamps, columns are the step's variables.
#[derive(Debug, Clone)]
pub struct WorkingTable<'a> {
    timestamps: &'a [NaiveDateTime],
    frame: DataFrame,
    missing: Vec<String>,
}

impl<'a> WorkingTable<'a> {
    pub fn new(timestamps: &'a [NaiveDateTime], frame: DataFrame) -> Self {
        Self {
            timestamps,
            frame,
            missing: Vec::new(),
        }
    }

    pub fn timestamps(&self) -> &'a [NaiveDateTime] {
        self.timestamps
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    /// Requested variables that were not present in the dataset.
    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    pub fn is_empty(&self) -> bool {
        self.frame.width() == 0
    }

    pub fn shape(&self) -> (usize, usize) {
        self.frame.shape()
    }

    pub fn column_names(&self) -> Vec<String> {
        column_names(&self.frame)
    }

    pub fn values(&self, name: &str) -> Result<Vec<Option<f64>>, PolarsError> {
        column_values(&self.frame, name)
    }
}

pub fn column_names(frame: &DataFrame) -> Vec<String> {
    frame
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

/// Reads a float column, folding NaN and infinities into missing.
pub fn column_values(frame: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, PolarsError> {
    let column = frame.column(name)?.f64()?;
    Ok(column
        .into_iter()
        .map(|value| value.filter(|v| v.is_finite()))
        .collect())
}
