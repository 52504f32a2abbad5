use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use toml::{Table, Value};

use crate::error::ConfigError;
use crate::levels;

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const TIMESTAMP_PLACEHOLDER: &str = "$timestamp$";

/// A parsed control file. Tables keep their declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFile {
    root: Table,
}

impl ControlFile {
    pub fn from_table(root: Table) -> Self {
        Self { root }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let root = text.parse::<Table>()?;
        Ok(Self { root })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn root(&self) -> &Table {
        &self.root
    }

    pub fn section(&self, name: &str) -> Option<&Table> {
        self.root.get(name).and_then(Value::as_table)
    }

    pub fn require_section(&self, name: &'static str) -> Result<&Table, ConfigError> {
        self.section(name).ok_or(ConfigError::MissingSection(name))
    }

    pub fn files(&self) -> Result<FilesSection, ConfigError> {
        let files = self.require_section("Files")?;
        let text = |key: &str| files.get(key).and_then(value_as_text);
        Ok(FilesSection {
            file_path: text("file_path").map(PathBuf::from),
            in_filename: text("in_filename"),
            in_headerrow: text("in_headerrow"),
            in_firstdatarow: text("in_firstdatarow"),
            in_dateformat: text("in_dateformat")
                .filter(|format| !format.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string()),
            out_filepath: text("out_filepath").map(PathBuf::from),
            out_filename: text("out_filename"),
        })
    }

    /// Copy of this control file with `Files.<key>` replaced.
    pub fn with_files_value(&self, key: &str, value: impl Into<String>) -> Self {
        let mut root = self.root.clone();
        let files = root
            .entry("Files".to_string())
            .or_insert(Value::Table(Table::new()));
        if let Value::Table(files) = files {
            files.insert(key.to_string(), Value::String(value.into()));
        }
        Self { root }
    }

    /// Snapshots every `[Corrections.<id>]` entry, in declaration order.
    pub fn correction_steps(&self) -> Result<Vec<CorrectionStep>, ConfigError> {
        let corrections = self.require_section("Corrections")?;
        let files = self.files().ok();

        corrections
            .iter()
            .enumerate()
            .map(|(step_index, (step_id, entry))| {
                let entry = entry.as_table().ok_or_else(|| ConfigError::InvalidType {
                    section: "Corrections".to_string(),
                    key: step_id.clone(),
                    expected: "table",
                })?;
                CorrectionStep::from_entry(step_index, step_id, entry, files.as_ref())
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilesSection {
    pub file_path: Option<PathBuf>,
    pub in_filename: Option<String>,
    pub in_headerrow: Option<String>,
    pub in_firstdatarow: Option<String>,
    pub in_dateformat: String,
    pub out_filepath: Option<PathBuf>,
    pub out_filename: Option<String>,
}

impl FilesSection {
    /// Comma-separated `in_filename` entries, trimmed, empties dropped.
    pub fn input_names(&self) -> Vec<String> {
        self.in_filename
            .as_deref()
            .map(split_list)
            .unwrap_or_default()
    }

    /// `file_path` joined with the first input name.
    pub fn input_path(&self) -> Result<PathBuf, ConfigError> {
        let directory = self.file_path.as_ref().ok_or_else(|| ConfigError::MissingKey {
            section: "Files",
            key: "file_path".to_string(),
        })?;
        let name = self
            .input_names()
            .into_iter()
            .next()
            .ok_or_else(|| ConfigError::MissingKey {
                section: "Files",
                key: "in_filename".to_string(),
            })?;
        Ok(directory.join(name))
    }

    /// `<out_filepath>/<level_folder>/<out_filename>`, when both parts are configured.
    pub fn output_path(&self, level_folder: &str) -> Option<PathBuf> {
        let directory = self.out_filepath.as_ref()?;
        let name = self.out_filename.as_ref()?;
        Some(directory.join(level_folder).join(name))
    }
}

/// Immutable snapshot of one `[Corrections.<id>]` entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrectionStep {
    pub step_index: usize,
    pub step_id: String,
    /// `Attr.long_name`
    pub display_name: String,
    pub standard_name: String,
    pub level_folder: String,
    /// Keys of the step's `Variables` table, first occurrence wins.
    pub declared_variables: Vec<String>,
    /// `Attr.func_name` as written; the registry normalizes it.
    pub function_name: String,
    #[serde(skip)]
    pub positional_args: Vec<Value>,
    #[serde(skip)]
    pub keyword_args: Table,
    pub output_path_template: Option<PathBuf>,
    /// `Attr.Saving`
    pub should_persist: bool,
}

impl CorrectionStep {
    fn from_entry(
        step_index: usize,
        step_id: &str,
        entry: &Table,
        files: Option<&FilesSection>,
    ) -> Result<Self, ConfigError> {
        let attr = entry.get("Attr").and_then(Value::as_table);
        let attr_text = |key: &str| {
            attr.and_then(|attr| attr.get(key))
                .and_then(value_as_text)
                .unwrap_or_default()
        };

        let standard_name = attr_text("standard_name");
        let level_folder = levels::level_folder(&standard_name);

        let mut declared_variables: Vec<String> = Vec::new();
        if let Some(variables) = entry.get("Variables") {
            let variables = variables.as_table().ok_or_else(|| ConfigError::InvalidType {
                section: format!("Corrections.{step_id}"),
                key: "Variables".to_string(),
                expected: "table",
            })?;
            for name in variables.keys() {
                if !declared_variables.contains(name) {
                    declared_variables.push(name.clone());
                }
            }
        }

        let positional_args = match entry.get("args") {
            None => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Table(items)) => items.values().cloned().collect(),
            Some(_) => {
                return Err(ConfigError::InvalidType {
                    section: format!("Corrections.{step_id}"),
                    key: "args".to_string(),
                    expected: "array or table",
                })
            }
        };
        let keyword_args = match entry.get("kwargs") {
            None => Table::new(),
            Some(Value::Table(items)) => items.clone(),
            Some(_) => {
                return Err(ConfigError::InvalidType {
                    section: format!("Corrections.{step_id}"),
                    key: "kwargs".to_string(),
                    expected: "table",
                })
            }
        };

        let should_persist = attr
            .and_then(|attr| attr.get("Saving"))
            .map(value_as_flag)
            .unwrap_or(false);

        Ok(Self {
            step_index,
            step_id: step_id.to_string(),
            display_name: attr_text("long_name"),
            output_path_template: files.and_then(|files| files.output_path(&level_folder)),
            standard_name,
            level_folder,
            declared_variables,
            function_name: attr_text("func_name"),
            positional_args,
            keyword_args,
            should_persist,
        })
    }
}

/// Scalars rendered as text; arrays are joined with ", ". Tables have no text form.
pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Integer(number) => Some(number.to_string()),
        Value::Float(number) => Some(number.to_string()),
        Value::Boolean(flag) => Some(flag.to_string()),
        Value::Datetime(datetime) => Some(datetime.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(value_as_text)
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Value::Table(_) => None,
    }
}

/// Numbers may arrive as TOML numbers or as quoted text.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Float(number) => Some(*number),
        Value::Integer(number) => Some(*number as f64),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_flag(value: &Value) -> bool {
    match value {
        Value::Boolean(flag) => *flag,
        Value::Integer(number) => *number != 0,
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "yes" | "y" | "1"
        ),
        _ => false,
    }
}

pub fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
