use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;
use fluxprep_core::config::ControlFile;
use fluxprep_core::dataset::{Dataset, Variable};
use fluxprep_core::pipeline::{
    CancellationFlag, CorrectionPipeline, StepPhase, StepStatus, PROCESSING_LEVEL_KEY,
};
use fluxprep_core::sink::MemorySink;
use tempfile::TempDir;

fn wind_dataset(n: usize) -> Result<Dataset> {
    let start = NaiveDate::from_ymd_opt(2023, 10, 1)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap();
    let axis = (0..n)
        .map(|i| start + chrono::Duration::milliseconds(100 * i as i64))
        .collect();
    let mut ds = Dataset::new(axis);

    let mut u: Vec<f64> = (0..n).map(|i| 3.0 + 0.1 * (i % 5) as f64).collect();
    u[17] = 40.0;
    let v: Vec<f64> = (0..n).map(|i| 1.0 + 0.2 * (0.7 * i as f64).cos()).collect();
    let w: Vec<f64> = (0..n).map(|i| 0.2 + 0.1 * (1.1 * i as f64).sin()).collect();
    ds.insert_variable(
        Variable::from_values("u", &u).with_attribute("long_name", "streamwise wind"),
    )?;
    ds.insert_variable(Variable::from_values("v", &v))?;
    ds.insert_variable(Variable::from_values("w", &w))?;
    ds.set_metadata(PROCESSING_LEVEL_KEY, "PP");
    Ok(ds)
}

fn control(out: &Path, corrections: &str) -> Result<ControlFile> {
    let text = format!(
        r#"
[Files]
file_path = "{out}"
in_filename = "unused.csv"
out_filepath = "{out}"
out_filename = "site.nc"

{corrections}
"#,
        out = out.display()
    );
    Ok(ControlFile::from_toml_str(&text)?)
}

const DESPIKE: &str = r#"
[Corrections.despike]
[Corrections.despike.Attr]
long_name = "Despiking"
standard_name = "Despike"
func_name = "Despike_Mauder_2013"
Saving = true
[Corrections.despike.Variables]
u = {}
"#;

const TILT: &str = r#"
[Corrections.tilt]
[Corrections.tilt.Attr]
long_name = "Double rotation"
standard_name = "Tilt"
func_name = "Tilt_2_rotation"
[Corrections.tilt.Variables]
u = {}
v = {}
w = {}
"#;

const UNKNOWN: &str = r#"
[Corrections.mystery]
[Corrections.mystery.Attr]
long_name = "Mystery correction"
standard_name = "Detrend"
func_name = "Detrend_mystery"
[Corrections.mystery.Variables]
u = {}
"#;

#[test]
fn applied_step_archives_and_records_provenance() -> Result<()> {
    let dir = TempDir::new()?;
    let pipeline = CorrectionPipeline::new(control(dir.path(), DESPIKE)?)?;
    let mut ds = wind_dataset(100)?;
    let before = ds.variable("u").unwrap().clone();
    let count_before = ds.variable_count();
    let mut sink = MemorySink::new();

    let summary = pipeline.run(&mut ds, &mut sink, &CancellationFlag::new());

    assert_eq!(summary.applied_count(), 1);
    assert_eq!(ds.variable_count(), count_before + 1);
    let archived = ds.variable("ub4level_2").expect("original kept");
    assert_eq!(archived.values, before.values);
    let corrected = ds.variable("u").unwrap();
    assert_ne!(corrected.values[17], Some(40.0));
    assert_eq!(
        corrected.attributes.get("description_Despike").map(String::as_str),
        Some("Despiking applied")
    );
    assert_eq!(
        corrected.attributes.get("long_name").map(String::as_str),
        Some("streamwise wind")
    );
    assert_eq!(
        ds.metadata().get(PROCESSING_LEVEL_KEY).map(String::as_str),
        Some("level_2")
    );

    let expected = dir.path().join("level_2").join("site.nc");
    assert_eq!(sink.writes.len(), 2, "saved step plus final write");
    assert!(sink.writes.iter().all(|write| write.path == expected));
    assert_eq!(summary.final_output, Some(expected));
    Ok(())
}

#[test]
fn unknown_function_is_skipped_and_run_continues() -> Result<()> {
    let dir = TempDir::new()?;
    let corrections = format!("{UNKNOWN}\n{TILT}");
    let pipeline = CorrectionPipeline::new(control(dir.path(), &corrections)?)?;
    let mut ds = wind_dataset(100)?;
    let mut sink = MemorySink::new();

    let summary = pipeline.run(&mut ds, &mut sink, &CancellationFlag::new());

    assert_eq!(summary.outcomes.len(), 2);
    match &summary.outcomes[0].status {
        StepStatus::Skipped { phase, reason } => {
            assert_eq!(*phase, StepPhase::Resolving);
            assert!(reason.contains("Detrend_mystery"), "{reason}");
        }
        other => panic!("expected a skipped step, got {other:?}"),
    }
    assert!(!ds.contains("ub4level_7"));
    assert!(summary.outcomes[1].is_applied());
    assert!(ds.contains("wb4level_5"));
    assert_eq!(ds.variable_count(), 6);
    assert_eq!(
        ds.metadata().get(PROCESSING_LEVEL_KEY).map(String::as_str),
        Some("level_5")
    );
    assert!(!summary.messages.is_ok());
    Ok(())
}

#[test]
fn final_write_follows_last_step_even_when_it_fails() -> Result<()> {
    let dir = TempDir::new()?;
    let corrections = format!("{DESPIKE}\n{UNKNOWN}");
    let pipeline = CorrectionPipeline::new(control(dir.path(), &corrections)?)?;
    let mut ds = wind_dataset(100)?;
    let mut sink = MemorySink::new();

    let summary = pipeline.run(&mut ds, &mut sink, &CancellationFlag::new());

    assert_eq!(summary.applied_count(), 1);
    assert_eq!(summary.skipped_count(), 1);
    let last = sink.writes.last().expect("final write");
    assert_eq!(last.path, dir.path().join("level_7").join("site.nc"));
    assert_eq!(last.processing_level.as_deref(), Some("level_2"));
    Ok(())
}

#[test]
fn missing_variables_are_dropped_with_a_warning() -> Result<()> {
    let dir = TempDir::new()?;
    let corrections = r#"
[Corrections.despike]
[Corrections.despike.Attr]
long_name = "Despiking"
standard_name = "Despike"
func_name = "Despike_Mauder_2013"
[Corrections.despike.Variables]
u = {}
CO2 = {}
"#;
    let pipeline = CorrectionPipeline::new(control(dir.path(), corrections)?)?;
    let mut ds = wind_dataset(100)?;
    let mut sink = MemorySink::new();

    let summary = pipeline.run(&mut ds, &mut sink, &CancellationFlag::new());

    assert_eq!(summary.applied_count(), 1);
    assert!(summary
        .messages
        .warnings()
        .iter()
        .any(|message| message.contains("CO2 not found")));
    assert!(!ds.contains("CO2"));
    Ok(())
}

#[test]
fn step_with_no_existing_variables_is_skipped() -> Result<()> {
    let dir = TempDir::new()?;
    let corrections = r#"
[Corrections.despike]
[Corrections.despike.Attr]
long_name = "Despiking"
standard_name = "Despike"
func_name = "Despike_Mauder_2013"
[Corrections.despike.Variables]
CO2 = {}
"#;
    let pipeline = CorrectionPipeline::new(control(dir.path(), corrections)?)?;
    let mut ds = wind_dataset(50)?;
    let before = ds.clone();
    let mut sink = MemorySink::new();

    let summary = pipeline.run(&mut ds, &mut sink, &CancellationFlag::new());

    assert!(matches!(
        summary.outcomes[0].status,
        StepStatus::Skipped {
            phase: StepPhase::Extracting,
            ..
        }
    ));
    assert_eq!(ds, before);
    Ok(())
}

#[test]
fn cancelled_run_starts_no_steps_and_writes_nothing() -> Result<()> {
    let dir = TempDir::new()?;
    let corrections = format!("{DESPIKE}\n{TILT}");
    let pipeline = CorrectionPipeline::new(control(dir.path(), &corrections)?)?;
    let mut ds = wind_dataset(50)?;
    let mut sink = MemorySink::new();
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let summary = pipeline.run(&mut ds, &mut sink, &cancel);

    assert!(summary.cancelled);
    assert!(summary.outcomes.is_empty());
    assert!(sink.writes.is_empty());
    assert_eq!(summary.final_output, None);
    Ok(())
}

fn assert_aborted_while_applying(corrections: &str, mut ds: Dataset) -> Result<()> {
    let dir = TempDir::new()?;
    let pipeline = CorrectionPipeline::new(control(dir.path(), corrections)?)?;
    let before = ds.clone();
    let mut sink = MemorySink::new();

    let summary = pipeline.run(&mut ds, &mut sink, &CancellationFlag::new());

    assert_eq!(summary.applied_count(), 0);
    match &summary.outcomes[0].status {
        StepStatus::Skipped { phase, .. } => assert_eq!(*phase, StepPhase::Applying),
        other => panic!("expected a skipped step, got {other:?}"),
    }
    assert_eq!(ds, before);
    Ok(())
}

#[test]
fn kernel_failure_leaves_dataset_untouched() -> Result<()> {
    let corrections = r#"
[Corrections.tilt]
[Corrections.tilt.Attr]
long_name = "Planar fit"
standard_name = "Tilt"
func_name = "Tilt_planar_fit"
[Corrections.tilt.Variables]
u = {}
v = {}
w = {}
"#;
    let mut ds = wind_dataset(50)?;
    ds.insert_variable(Variable::from_values("u", &[3.0; 50]))?;
    ds.insert_variable(Variable::from_values("v", &[1.0; 50]))?;
    assert_aborted_while_applying(corrections, ds)
}

#[test]
fn rotation_without_vertical_wind_leaves_dataset_untouched() -> Result<()> {
    let corrections = r#"
[Corrections.tilt]
[Corrections.tilt.Attr]
long_name = "Double rotation"
standard_name = "Tilt"
func_name = "Tilt_2_rotation"
[Corrections.tilt.Variables]
u = {}
v = {}
"#;
    assert_aborted_while_applying(corrections, wind_dataset(50)?)
}
