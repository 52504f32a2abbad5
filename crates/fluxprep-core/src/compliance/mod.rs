//! Control-file compliance checks.
//!
//! Both gates are advisory: they collect messages and a pass/fail verdict, and the only
//! side effect they have is creating missing output folders. Nothing in here returns an
//! error to the caller; internal failures are recorded and turn the verdict to fail.

mod files;
mod schema;
mod variables;

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::config::{ControlFile, CorrectionStep};

pub use crate::messages::{MessageLog, Severity};
pub use schema::{GlobalSchema, InstrumentKind, InstrumentSchema, ReferenceSchema, VariableSchema};

#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("reference schema is not valid: {0}")]
    Schema(#[from] toml::de::Error),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ComplianceReport {
    pub messages: MessageLog,
    pub ok: bool,
    /// Output folder after defaults were applied (`file_path` when `out_filepath` is
    /// missing; the level folder for step checks).
    pub resolved_out_filepath: Option<PathBuf>,
}

impl ComplianceReport {
    fn finish(
        mut messages: MessageLog,
        outcome: Result<Option<PathBuf>, ComplianceError>,
        context: &str,
    ) -> Self {
        match outcome {
            Ok(resolved_out_filepath) => Self {
                ok: messages.is_ok(),
                messages,
                resolved_out_filepath,
            },
            Err(err) => {
                error!(context, error = %err, "Error checking control file");
                messages.error(format!("Error checking control file: {err}"));
                Self {
                    messages,
                    ok: false,
                    resolved_out_filepath: None,
                }
            }
        }
    }
}

/// File-level gate, run before raw ingestion, against the bundled reference schema.
pub fn check_file_config(control: &ControlFile) -> ComplianceReport {
    match ReferenceSchema::standard() {
        Ok(schema) => check_file_config_with(control, &schema),
        Err(err) => ComplianceReport::finish(MessageLog::new(), Err(err), "file"),
    }
}

pub fn check_file_config_with(control: &ControlFile, schema: &ReferenceSchema) -> ComplianceReport {
    let mut messages = MessageLog::new();
    let resolved = files::check_input_files(control, &mut messages);
    variables::check_global(control, schema, &mut messages);
    variables::check_variables(control, schema, &mut messages);
    ComplianceReport::finish(messages, Ok(resolved), "file")
}

/// Step-level gate, run before each correction.
pub fn check_step_config(control: &ControlFile, step: &CorrectionStep) -> ComplianceReport {
    let mut messages = MessageLog::new();
    let resolved = files::check_step_output(control, step, &mut messages);
    check_step_attributes(step, &mut messages);
    ComplianceReport::finish(messages, Ok(resolved), &step.step_id)
}

fn check_step_attributes(step: &CorrectionStep, messages: &mut MessageLog) {
    let section = format!("Corrections.{}", step.step_id);
    for (key, value) in [
        ("long_name", &step.display_name),
        ("standard_name", &step.standard_name),
        ("func_name", &step.function_name),
    ] {
        if value.trim().is_empty() {
            messages.error(format!("{section}: '{key}' not in Attr"));
        }
    }
    if step.declared_variables.is_empty() {
        messages.warning(format!("{section}: no variables requested"));
    }
}
