use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::compliance::check_step_config;
use crate::config::{ControlFile, CorrectionStep};
use crate::dataset::{column_names, column_values, Dataset, DatasetError};
use crate::error::{ConfigError, CorrectionError};
use crate::messages::MessageLog;
use crate::registry::{self, CorrectionArgs};
use crate::sink::DatasetSink;

pub const PROCESSING_LEVEL_KEY: &str = "processing_level";

/// Shared stop request, checked between steps and between files.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Idle,
    Validating,
    Resolving,
    Extracting,
    Applying,
    Merging,
    Persisting,
}

impl StepPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepPhase::Idle => "idle",
            StepPhase::Validating => "validating",
            StepPhase::Resolving => "resolving",
            StepPhase::Extracting => "extracting",
            StepPhase::Applying => "applying",
            StepPhase::Merging => "merging",
            StepPhase::Persisting => "persisting",
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Applied {
        corrected: Vec<String>,
        archived: Vec<String>,
        persisted_to: Option<PathBuf>,
    },
    Skipped {
        phase: StepPhase,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub step_id: String,
    pub function_name: String,
    pub level_folder: String,
    pub compliance_ok: bool,
    pub status: StepStatus,
}

impl StepOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self.status, StepStatus::Applied { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub outcomes: Vec<StepOutcome>,
    pub messages: MessageLog,
    pub final_output: Option<PathBuf>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn applied_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_applied()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes.len() - self.applied_count()
    }
}

struct StepFailure {
    phase: StepPhase,
    error: CorrectionError,
}

impl StepFailure {
    fn at(phase: StepPhase) -> impl FnOnce(CorrectionError) -> StepFailure {
        move |error| StepFailure { phase, error }
    }
}

/// Applies the control file's corrections, in order, to one dataset.
#[derive(Debug, Clone)]
pub struct CorrectionPipeline {
    control: ControlFile,
    steps: Vec<CorrectionStep>,
}

impl CorrectionPipeline {
    pub fn new(control: ControlFile) -> Result<Self, ConfigError> {
        let steps = control.correction_steps()?;
        Ok(Self { control, steps })
    }

    pub fn control(&self) -> &ControlFile {
        &self.control
    }

    pub fn steps(&self) -> &[CorrectionStep] {
        &self.steps
    }

    /// Runs every step against `dataset`. A failing step leaves the dataset as it was and
    /// the run moves on; failures are reported in the summary, never returned.
    ///
    /// After the loop the dataset is written once more to the last started step's output
    /// path, even when that step was skipped.
    pub fn run(
        &self,
        dataset: &mut Dataset,
        sink: &mut dyn DatasetSink,
        cancel: &CancellationFlag,
    ) -> RunSummary {
        let run_id = Uuid::new_v4();
        let mut messages = MessageLog::new();
        let mut outcomes = Vec::with_capacity(self.steps.len());
        let mut last_output: Option<Option<PathBuf>> = None;
        let mut cancelled = false;

        info!(%run_id, steps = self.steps.len(), "Starting correction run");
        for step in &self.steps {
            if cancel.is_cancelled() {
                warn!(%run_id, step = %step.step_id, "Run cancelled, remaining steps not started");
                messages.warning(format!("Run cancelled before step {}", step.step_id));
                cancelled = true;
                break;
            }

            let span = info_span!(
                "correction_step",
                step = %step.step_id,
                function = %step.function_name
            );
            let _entered = span.enter();
            last_output = Some(step.output_path_template.clone());
            outcomes.push(self.run_step(step, dataset, sink, &mut messages));
        }
        enter_phase(StepPhase::Idle);

        let mut final_output = None;
        match last_output {
            None => debug!(%run_id, "No step started, skipping final write"),
            Some(None) => {
                warn!(%run_id, "Last step has no output path, skipping final write");
                messages.warning("Files: no output path for final write");
            }
            Some(Some(path)) => match sink.write(&path, dataset) {
                Ok(written) => final_output = Some(written),
                Err(err) => {
                    let chain = error_chain(&err);
                    error!(%run_id, path = %path.display(), error = %chain, "Final write failed");
                    messages.error(format!("Failed to write {}: {chain}", path.display()));
                }
            },
        }

        let summary = RunSummary {
            run_id,
            outcomes,
            messages,
            final_output,
            cancelled,
        };
        info!(
            %run_id,
            applied = summary.applied_count(),
            skipped = summary.skipped_count(),
            cancelled,
            "Finished correction run"
        );
        summary
    }

    fn run_step(
        &self,
        step: &CorrectionStep,
        dataset: &mut Dataset,
        sink: &mut dyn DatasetSink,
        messages: &mut MessageLog,
    ) -> StepOutcome {
        enter_phase(StepPhase::Validating);
        let report = check_step_config(&self.control, step);
        report.messages.emit(&step.step_id);
        let compliance_ok = report.ok;
        messages.extend(report.messages);
        if !compliance_ok {
            error!("Error occurred checking compliance of correction step");
            messages.error(format!(
                "{}: compliance check failed, continuing",
                step.step_id
            ));
        }

        info!("Starting pre processing with {}", step.display_name);
        let status = match apply_step(step, dataset, messages) {
            Ok((corrected, archived)) => {
                let persisted_to = if step.should_persist {
                    persist(step, dataset, sink, messages)
                } else {
                    None
                };
                StepStatus::Applied {
                    corrected,
                    archived,
                    persisted_to,
                }
            }
            Err(StepFailure { phase, error }) => {
                let chain = error_chain(&error);
                error!(%phase, error = %chain, "Correction step aborted");
                messages.error(format!(
                    "{}: error while {phase} {}: {chain}",
                    step.step_id, step.display_name
                ));
                StepStatus::Skipped {
                    phase,
                    reason: chain,
                }
            }
        };

        StepOutcome {
            step_id: step.step_id.clone(),
            function_name: step.function_name.clone(),
            level_folder: step.level_folder.clone(),
            compliance_ok,
            status,
        }
    }
}

/// Resolve, extract, apply and merge. The dataset is only touched once every check
/// on the correction's output has passed.
fn apply_step(
    step: &CorrectionStep,
    dataset: &mut Dataset,
    messages: &mut MessageLog,
) -> Result<(Vec<String>, Vec<String>), StepFailure> {
    enter_phase(StepPhase::Resolving);
    let correction =
        registry::resolve(&step.function_name).map_err(StepFailure::at(StepPhase::Resolving))?;

    enter_phase(StepPhase::Extracting);
    let corrected = {
        let table = dataset
            .working_table(&step.declared_variables)
            .map_err(|err| StepFailure::at(StepPhase::Extracting)(err.into()))?;
        for name in table.missing() {
            warn!(variable = %name, "Requested variable not in dataset");
            messages.warning(format!(
                "{}: variable {name} not found, continuing without it",
                step.step_id
            ));
        }
        if table.is_empty() {
            return Err(StepFailure {
                phase: StepPhase::Extracting,
                error: CorrectionError::EmptySelection {
                    requested: step.declared_variables.clone(),
                },
            });
        }

        enter_phase(StepPhase::Applying);
        let args = CorrectionArgs::from_step(step);
        let output = correction
            .apply(&table, &args)
            .map_err(StepFailure::at(StepPhase::Applying))?;

        let expected_names = table.column_names();
        if output.shape() != table.shape() {
            return Err(StepFailure {
                phase: StepPhase::Applying,
                error: CorrectionError::ShapeMismatch {
                    expected: table.shape(),
                    found: output.shape(),
                },
            });
        }
        let mut found = column_names(&output);
        let mut wanted = expected_names.clone();
        found.sort();
        wanted.sort();
        if found != wanted {
            return Err(StepFailure {
                phase: StepPhase::Applying,
                error: CorrectionError::ColumnMismatch {
                    expected: expected_names,
                    found: column_names(&output),
                },
            });
        }

        expected_names
            .into_iter()
            .map(|name| -> Result<_, CorrectionError> {
                let values = column_values(&output, &name)?;
                Ok((name, values))
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(StepFailure::at(StepPhase::Applying))?
    };

    enter_phase(StepPhase::Merging);
    let description_key = format!("description_{}", step.standard_name);
    let description = format!("{} applied", step.display_name);
    let mut updates = Vec::with_capacity(corrected.len() * 2);
    for (name, values) in corrected {
        let Some(current) = dataset.variable(&name) else {
            return Err(StepFailure {
                phase: StepPhase::Merging,
                error: DatasetError::UnknownVariable(name).into(),
            });
        };
        let archived = current.renamed(format!("{name}b4{}", step.level_folder));
        let mut updated = current.clone();
        updated.values = values;
        updated.append_to_attribute(&description_key, &description);
        updates.push(archived);
        updates.push(updated);
    }

    let mut corrected_names = Vec::new();
    let mut archived_names = Vec::new();
    for (idx, variable) in updates.into_iter().enumerate() {
        if idx % 2 == 0 {
            archived_names.push(variable.name().to_string());
        } else {
            corrected_names.push(variable.name().to_string());
        }
        dataset
            .insert_variable(variable)
            .map_err(|err| StepFailure::at(StepPhase::Merging)(err.into()))?;
    }
    dataset.set_metadata(PROCESSING_LEVEL_KEY, step.level_folder.clone());
    info!(
        corrected = corrected_names.len(),
        level = %step.level_folder,
        "Finished pre processing with {}",
        step.display_name
    );
    Ok((corrected_names, archived_names))
}

fn persist(
    step: &CorrectionStep,
    dataset: &Dataset,
    sink: &mut dyn DatasetSink,
    messages: &mut MessageLog,
) -> Option<PathBuf> {
    enter_phase(StepPhase::Persisting);
    let Some(path) = &step.output_path_template else {
        warn!("Saving requested but no output path is configured");
        messages.warning(format!(
            "{}: Saving requested but Files has no out_filepath/out_filename",
            step.step_id
        ));
        return None;
    };
    match sink.write(path, dataset) {
        Ok(written) => Some(written),
        Err(err) => {
            let chain = error_chain(&err);
            error!(path = %path.display(), error = %chain, "Failed to save step output");
            messages.error(format!(
                "{}: failed to write {}: {chain}",
                step.step_id,
                path.display()
            ));
            None
        }
    }
}

fn enter_phase(phase: StepPhase) {
    debug!(phase = phase.as_str(), "Entering phase");
}

/// `error: cause: root cause`
pub(crate) fn error_chain(err: &dyn StdError) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !chain.ends_with(&text) {
            chain.push_str(": ");
            chain.push_str(&text);
        }
        source = cause.source();
    }
    chain
}
