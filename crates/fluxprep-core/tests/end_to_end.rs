use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use fluxprep_core::batch::{discover_input_files, run_batch};
use fluxprep_core::config::ControlFile;
use fluxprep_core::error::PipelineError;
use fluxprep_core::ingest::read_csv_dataset;
use fluxprep_core::pipeline::{CancellationFlag, CorrectionPipeline, PROCESSING_LEVEL_KEY};
use fluxprep_core::sink::{MemorySink, ParquetSink};
use tempfile::TempDir;

const ROWS: usize = 600;

/// 10 Hz sonic record pitched 10 degrees off the mean streamline.
fn write_raw(dir: &Path, stamp: &str, header: &[&str]) -> Result<()> {
    let start = NaiveDate::from_ymd_opt(2023, 10, 1)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap();
    let pitch = 10f64.to_radians();
    let mut text = header.join(",");
    text.push('\n');
    for i in 0..ROWS {
        let x = i as f64;
        let ts = start + Duration::milliseconds(100 * i as i64);
        let u0 = 4.0 + 0.5 * (0.37 * x).sin();
        let v0 = 1.0 + 0.3 * (0.71 * x).cos();
        let w0 = 0.1 * (1.3 * x).sin();
        let u = if i == 25 {
            -9999.0
        } else {
            u0 * pitch.cos() - w0 * pitch.sin()
        };
        let w = if i == 100 {
            25.0
        } else {
            u0 * pitch.sin() + w0 * pitch.cos()
        };
        let values = [u, v0, w];
        write!(text, "{}", ts.format("%Y-%m-%d %H:%M:%S%.3f"))?;
        for value in values.iter().take(header.len() - 1) {
            write!(text, ",{value:.6}")?;
        }
        text.push('\n');
    }
    fs::write(dir.join(format!("site_{stamp}.csv")), text)?;
    Ok(())
}

fn control(root: &Path) -> Result<ControlFile> {
    let text = format!(
        r#"
[Files]
file_path = "{raw}"
in_filename = "site_$timestamp$.csv"
in_headerrow = 1
in_firstdatarow = 2
in_dateformat = "%Y-%m-%d %H:%M:%S%.f"
out_filepath = "{out}"
out_filename = "site_$timestamp$.nc"

[Global]
site_name = "Test site"
time_step = 0.1
latitude = 38.5
longitude = -121.7
sonic_type = "CSAT3"

[Variables.DateTime.csv]
name = "TIMESTAMP"

[Variables.u.csv]
name = "Ux"
[Variables.u.Attr]
long_name = "streamwise wind"
units = "m/s"

[Variables.v.csv]
name = "Uy"
[Variables.v.Attr]
long_name = "cross wind"
units = "m/s"

[Variables.w.csv]
name = "Uz"
[Variables.w.Attr]
long_name = "vertical wind"
units = "m/s"

[Corrections.despike]
kwargs = {{ q = 7.0 }}
[Corrections.despike.Attr]
long_name = "Despiking"
standard_name = "Despike"
func_name = "Despike_Mauder_2013"
[Corrections.despike.Variables]
u = {{}}
v = {{}}
w = {{}}

[Corrections.tilt]
kwargs = {{ u = "u", v = "v", w = "w" }}
[Corrections.tilt.Attr]
long_name = "Double rotation"
standard_name = "Tilt"
func_name = "Tilt_2_rotation(u, v, w)"
Saving = "True"
[Corrections.tilt.Variables]
u = {{}}
v = {{}}
w = {{}}
"#,
        raw = root.join("raw").display(),
        out = root.join("out").display(),
    );
    Ok(ControlFile::from_toml_str(&text)?)
}

fn mean(values: &[Option<f64>]) -> f64 {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    present.iter().sum::<f64>() / present.len() as f64
}

#[test]
fn despike_then_double_rotation_levels_the_wind() -> Result<()> {
    let dir = TempDir::new()?;
    let raw = dir.path().join("raw");
    fs::create_dir_all(&raw)?;
    write_raw(&raw, "202310011200", &["TIMESTAMP", "Ux", "Uy", "Uz"])?;
    let control = control(dir.path())?.with_files_value("in_filename", "site_202310011200.csv");

    let mut ds = read_csv_dataset(&control)?;
    assert_eq!(ds.len(), ROWS);
    assert_eq!(ds.variable("u").unwrap().values[25], None);
    assert_eq!(
        ds.variable("u").unwrap().attributes.get("units").map(String::as_str),
        Some("m/s")
    );
    assert_eq!(ds.metadata().get("site_name").map(String::as_str), Some("Test site"));

    let pipeline = CorrectionPipeline::new(control)?;
    let mut sink = MemorySink::new();
    let summary = pipeline.run(&mut ds, &mut sink, &CancellationFlag::new());

    assert_eq!(summary.applied_count(), 2, "{:?}", summary.messages);
    let v = &ds.variable("v").unwrap().values;
    let w = &ds.variable("w").unwrap().values;
    assert!(mean(v).abs() < 1e-6, "mean v = {}", mean(v));
    assert!(mean(w).abs() < 1e-6, "mean w = {}", mean(w));
    assert_eq!(ds.variable("wb4level_2").unwrap().values[100], Some(25.0));
    let despiked = ds.variable("wb4level_5").unwrap().values[100].expect("outlier interpolated");
    assert!(despiked.abs() < 2.0, "outlier survived despiking: {despiked}");
    assert!(ds.contains("ub4level_2"));
    assert_eq!(
        ds.metadata().get(PROCESSING_LEVEL_KEY).map(String::as_str),
        Some("level_5")
    );
    let description = ds.variable("w").unwrap().attributes.get("description_Tilt");
    assert_eq!(description.map(String::as_str), Some("Double rotation applied"));
    Ok(())
}

#[test]
fn batch_processes_each_timestamped_file_and_survives_failures() -> Result<()> {
    let dir = TempDir::new()?;
    let raw = dir.path().join("raw");
    fs::create_dir_all(&raw)?;
    write_raw(&raw, "202310011230", &["TIMESTAMP", "Ux", "Uy", "Uz"])?;
    write_raw(&raw, "202310011200", &["TIMESTAMP", "Ux", "Uy", "Uz"])?;
    write_raw(&raw, "202310011300", &["TIMESTAMP", "Ux", "Uy"])?;
    let control = control(dir.path())?;

    let inputs = discover_input_files(&control.files()?)?;
    let stamps: Vec<&str> = inputs
        .iter()
        .filter_map(|input| input.timestamp.as_deref())
        .collect();
    assert_eq!(stamps, ["202310011200", "202310011230", "202310011300"]);

    let mut sink = ParquetSink::new();
    let report = run_batch(&control, &mut sink, &CancellationFlag::new())?;

    assert_eq!(report.files.len(), 3);
    assert_eq!(report.failed_count(), 1);
    assert!(report.files[2]
        .error
        .as_deref()
        .is_some_and(|error| error.contains("Uz")));

    let level = dir.path().join("out").join("level_5");
    for stamp in ["202310011200", "202310011230"] {
        assert!(level.join(format!("site_{stamp}.parquet")).is_file());
        let attributes = fs::read_to_string(level.join(format!("site_{stamp}.attributes.json")))?;
        let document: serde_json::Value = serde_json::from_str(&attributes)?;
        assert_eq!(document["metadata"]["processing_level"], "level_5");
        assert_eq!(
            document["variables"]["u"]["description_Despike"],
            "Despiking applied"
        );
    }
    assert!(!level.join("site_202310011300.parquet").exists());
    Ok(())
}

#[test]
fn batch_without_matching_files_is_an_error() -> Result<()> {
    let dir = TempDir::new()?;
    fs::create_dir_all(dir.path().join("raw"))?;
    let control = control(dir.path())?;

    let err = run_batch(&control, &mut MemorySink::new(), &CancellationFlag::new())
        .err()
        .expect("nothing to process");
    assert!(matches!(err, PipelineError::NoInputFiles { .. }));
    Ok(())
}

#[test]
fn cancelled_batch_stops_before_the_first_file() -> Result<()> {
    let dir = TempDir::new()?;
    let raw = dir.path().join("raw");
    fs::create_dir_all(&raw)?;
    write_raw(&raw, "202310011200", &["TIMESTAMP", "Ux", "Uy", "Uz"])?;
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let mut sink = MemorySink::new();
    let report = run_batch(&control(dir.path())?, &mut sink, &cancel)?;

    assert!(report.cancelled);
    assert!(report.files.is_empty());
    assert!(sink.writes.is_empty());
    Ok(())
}
