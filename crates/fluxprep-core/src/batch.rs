//! Runs the correction pipeline over every input file a control file names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::compliance::{check_file_config, ComplianceReport};
use crate::config::{split_list, ControlFile, FilesSection, TIMESTAMP_PLACEHOLDER};
use crate::error::{ConfigError, PipelineError, Result};
use crate::ingest::read_csv_dataset;
use crate::levels::PREPROCESSED_LEVEL;
use crate::pipeline::{error_chain, CancellationFlag, CorrectionPipeline, RunSummary, PROCESSING_LEVEL_KEY};
use crate::sink::DatasetSink;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputFile {
    /// Text matched by `$timestamp$`, when the input name is a pattern.
    pub timestamp: Option<String>,
    /// Path relative to `file_path`.
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileRunReport {
    pub input: InputFile,
    pub file_check: ComplianceReport,
    pub summary: Option<RunSummary>,
    pub error: Option<String>,
}

impl FileRunReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub files: Vec<FileRunReport>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn failed_count(&self) -> usize {
        self.files.iter().filter(|file| !file.succeeded()).count()
    }
}

/// Expands `in_filename` into the files to process, ordered by timestamp when the name
/// is a `$timestamp$` pattern and in declaration order otherwise.
pub fn discover_input_files(files: &FilesSection) -> Result<Vec<InputFile>> {
    let directory = files.file_path.clone().ok_or(ConfigError::MissingKey {
        section: "Files",
        key: "file_path".to_string(),
    })?;
    let in_filename = files.in_filename.clone().ok_or(ConfigError::MissingKey {
        section: "Files",
        key: "in_filename".to_string(),
    })?;

    let found = match in_filename.split_once(TIMESTAMP_PLACEHOLDER) {
        Some((prefix, suffix)) => match_timestamped(&directory, prefix.trim(), suffix.trim())?,
        None => split_list(&in_filename)
            .into_iter()
            .map(|name| InputFile {
                timestamp: None,
                relative_path: PathBuf::from(name),
            })
            .collect(),
    };

    if found.is_empty() {
        return Err(PipelineError::NoInputFiles {
            pattern: in_filename,
            directory,
        });
    }
    Ok(found)
}

fn match_timestamped(directory: &Path, prefix: &str, suffix: &str) -> Result<Vec<InputFile>> {
    let pattern = directory.join("**").join(format!(
        "{}*{}",
        Pattern::escape(prefix),
        Pattern::escape(suffix)
    ));
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::default()
    };

    let mut by_timestamp: BTreeMap<String, PathBuf> = BTreeMap::new();
    for entry in glob::glob_with(&pattern.to_string_lossy(), options)? {
        let path = match entry {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "Could not read path from glob pattern");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(timestamp) = capture_timestamp(name, prefix, suffix) else {
            continue;
        };
        let relative = path
            .strip_prefix(directory)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.clone());
        by_timestamp.insert(timestamp, relative);
    }

    Ok(by_timestamp
        .into_iter()
        .map(|(timestamp, relative_path)| InputFile {
            timestamp: Some(timestamp),
            relative_path,
        })
        .collect())
}

/// The part of `name` between `prefix` and `suffix`, compared case-insensitively.
fn capture_timestamp(name: &str, prefix: &str, suffix: &str) -> Option<String> {
    let lower = name.to_lowercase();
    if name.len() < prefix.len() + suffix.len() + 1
        || lower.len() != name.len()
        || !lower.starts_with(&prefix.to_lowercase())
        || !lower.ends_with(&suffix.to_lowercase())
    {
        return None;
    }
    let captured = &name[prefix.len()..name.len() - suffix.len()];
    (!captured.is_empty()).then(|| captured.to_string())
}

/// The control file as seen by one input: `in_filename` names that file and any
/// `$timestamp$` in `out_filename` is filled in.
pub fn control_for_input(
    control: &ControlFile,
    files: &FilesSection,
    input: &InputFile,
) -> ControlFile {
    let file_control =
        control.with_files_value("in_filename", input.relative_path.to_string_lossy());
    match (&input.timestamp, &files.out_filename) {
        (Some(timestamp), Some(out_filename)) => file_control.with_files_value(
            "out_filename",
            out_filename.replace(TIMESTAMP_PLACEHOLDER, timestamp),
        ),
        _ => file_control,
    }
}

/// Processes every input file in turn. A failing file is recorded and the batch moves
/// on; cancellation is honored between files.
pub fn run_batch(
    control: &ControlFile,
    sink: &mut dyn DatasetSink,
    cancel: &CancellationFlag,
) -> Result<BatchReport> {
    let files = control.files()?;
    let inputs = discover_input_files(&files)?;
    info!(files = inputs.len(), "Started pre processing");

    let mut report = BatchReport::default();
    for input in inputs {
        if cancel.is_cancelled() {
            warn!("Batch cancelled, remaining files not processed");
            report.cancelled = true;
            break;
        }

        let file_label = input.relative_path.display().to_string();
        info!(file = %file_label, "Starting pre processing");
        let mut file_control = control_for_input(control, &files, &input);
        let file_check = check_file_config(&file_control);
        file_check.messages.emit(&file_label);
        if !file_check.ok {
            error!(file = %file_label, "Error occurred checking compliance of control file");
        }
        if files.out_filepath.is_none() {
            if let Some(resolved) = &file_check.resolved_out_filepath {
                file_control =
                    file_control.with_files_value("out_filepath", resolved.to_string_lossy());
            }
        }

        let (summary, error) = match process_file(&file_control, sink, cancel) {
            Ok(summary) => {
                info!(file = %file_label, "Finished pre processing");
                (Some(summary), None)
            }
            Err(err) => {
                let chain = error_chain(&err);
                error!(file = %file_label, error = %chain, "Error occurred during pre processing");
                (None, Some(chain))
            }
        };
        report.files.push(FileRunReport {
            input,
            file_check,
            summary,
            error,
        });
    }

    info!(
        files = report.files.len(),
        failed = report.failed_count(),
        cancelled = report.cancelled,
        "Finished pre processing"
    );
    Ok(report)
}

fn process_file(
    control: &ControlFile,
    sink: &mut dyn DatasetSink,
    cancel: &CancellationFlag,
) -> Result<RunSummary> {
    let pipeline = CorrectionPipeline::new(control.clone())?;
    let mut dataset = read_csv_dataset(control)?;
    dataset.set_metadata(PROCESSING_LEVEL_KEY, PREPROCESSED_LEVEL);
    Ok(pipeline.run(&mut dataset, sink, cancel))
}
