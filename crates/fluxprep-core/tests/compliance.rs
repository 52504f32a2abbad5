use std::fs;
use std::path::Path;

use anyhow::Result;
use fluxprep_core::compliance::{
    check_file_config, check_file_config_with, check_step_config, ReferenceSchema,
};
use fluxprep_core::config::ControlFile;
use tempfile::TempDir;

fn control_for(root: &Path, global: &str, variables: &str) -> Result<ControlFile> {
    let raw = root.join("raw");
    fs::create_dir_all(&raw)?;
    fs::write(raw.join("site_20231001.csv"), "DateTime,u\n")?;
    let text = format!(
        r#"
[Files]
file_path = "{raw}"
in_filename = "site_20231001.csv"
in_headerrow = 1
in_firstdatarow = 2
out_filepath = "{out}"
out_filename = "site_20231001.nc"

{global}

{variables}

[Corrections.despike]
[Corrections.despike.Attr]
long_name = "Despiking"
standard_name = "Despike"
func_name = "Despike_Mauder_2013"
[Corrections.despike.Variables]
u = {{}}
"#,
        raw = raw.display(),
        out = root.join("out").display(),
    );
    Ok(ControlFile::from_toml_str(&text)?)
}

const GLOBAL: &str = r#"
[Global]
site_name = "Test site"
time_step = 0.1
latitude = 38.5
longitude = -121.7
sonic_type = "CSAT3"
"#;

const VARIABLES: &str = r#"
[Variables.DateTime.csv]
name = "DateTime"

[Variables.u.csv]
name = "u"
[Variables.u.Attr]
long_name = "streamwise wind"
units = "m/s"
"#;

#[test]
fn complete_control_file_passes_with_warnings_only() -> Result<()> {
    let dir = TempDir::new()?;
    let control = control_for(dir.path(), GLOBAL, VARIABLES)?;

    let report = check_file_config(&control);

    assert!(report.ok, "unexpected errors: {:?}", report.messages.errors());
    assert!(report
        .messages
        .warnings()
        .iter()
        .any(|message| message.contains("institution")));
    assert!(dir.path().join("out").is_dir());
    assert_eq!(report.resolved_out_filepath, Some(dir.path().join("out")));
    Ok(())
}

#[test]
fn every_problem_is_reported_in_one_pass() -> Result<()> {
    let dir = TempDir::new()?;
    let global = r#"
[Global]
site_name = "Test site"
time_step = 0.5
latitude = 95.0
irga_type = "Li-9999"
"#;
    let variables = r#"
[Variables.DateTime.csv]
name = "DateTime"

[Variables.u.csv]
name = "u"
[Variables.u.Attr]
units = "m/s"

[Variables.U.csv]
name = "u"
[Variables.U.Attr]
long_name = "duplicate"
units = "m/s"

[Variables.CO2.Attr]
long_name = "carbon dioxide"
units = "mmol/m^3"
"#;
    let control = control_for(dir.path(), global, variables)?;

    let report = check_file_config(&control);
    let errors = report.messages.errors().join("\n");

    assert!(!report.ok);
    assert!(errors.contains("longitude not in section"), "{errors}");
    assert!(errors.contains("'time_step' must be one of"), "{errors}");
    assert!(errors.contains("'latitude' must be between"), "{errors}");
    assert!(errors.contains("irga_type 'Li-9999'"), "{errors}");
    assert!(errors.contains("Variables.u: 'long_name' not in Attr"), "{errors}");
    assert!(errors.contains("Variables.u: needs Global 'sonic_type'"), "{errors}");
    assert!(errors.contains("duplicate output variable names"), "{errors}");
    assert!(errors.contains("input column 'u'"), "{errors}");
    Ok(())
}

#[test]
fn missing_output_folder_falls_back_to_input_folder() -> Result<()> {
    let dir = TempDir::new()?;
    let control = control_for(dir.path(), GLOBAL, VARIABLES)?;
    let mut root = control.root().clone();
    if let Some(files) = root.get_mut("Files").and_then(|files| files.as_table_mut()) {
        files.remove("out_filepath");
    }
    let control = ControlFile::from_table(root);

    let report = check_file_config(&control);

    assert!(!report.ok);
    assert_eq!(report.resolved_out_filepath, Some(dir.path().join("raw")));
    Ok(())
}

#[test]
fn missing_input_file_is_an_error() -> Result<()> {
    let dir = TempDir::new()?;
    let control = control_for(dir.path(), GLOBAL, VARIABLES)?
        .with_files_value("in_filename", "absent.csv");

    let report = check_file_config(&control);

    assert!(report
        .messages
        .errors()
        .iter()
        .any(|message| message == "Files: absent.csv not found"));
    Ok(())
}

#[test]
fn custom_schema_can_relax_requirements() -> Result<()> {
    let dir = TempDir::new()?;
    let schema = ReferenceSchema::from_toml_str(
        r#"
[Global]
required = ["site_name"]
recommended = []
time_steps = [0.1]

[Instruments]
irga = []
sonic = ["CSAT3"]
"#,
    )?;
    let global = "[Global]\nsite_name = \"Test site\"\n";
    let control = control_for(dir.path(), global, VARIABLES)?;

    let report = check_file_config_with(&control, &schema);

    assert!(report.ok, "unexpected errors: {:?}", report.messages.errors());
    assert!(report.messages.warnings().is_empty());
    Ok(())
}

#[test]
fn step_check_creates_level_folder() -> Result<()> {
    let dir = TempDir::new()?;
    let control = control_for(dir.path(), GLOBAL, VARIABLES)?;
    let steps = control.correction_steps()?;

    let report = check_step_config(&control, &steps[0]);

    assert!(report.ok, "unexpected errors: {:?}", report.messages.errors());
    let folder = dir.path().join("out").join("level_2");
    assert!(folder.is_dir());
    assert_eq!(report.resolved_out_filepath, Some(folder));
    Ok(())
}

#[test]
fn unwritable_output_folder_does_not_stop_other_checks() -> Result<()> {
    let dir = TempDir::new()?;
    let global = r#"
[Global]
site_name = "Test site"
time_step = 0.1
latitude = 123.0
longitude = -121.7
sonic_type = "CSAT3"
"#;
    let control = control_for(dir.path(), global, VARIABLES)?;
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "not a folder")?;
    let control = control
        .with_files_value("out_filepath", blocker.join("sub").to_string_lossy())
        .with_files_value("out_filename", "bad.txt");

    let report = check_file_config(&control);
    let errors = report.messages.errors().join("\n");

    assert!(!report.ok);
    assert!(errors.contains("failed to create output folder"), "{errors}");
    assert!(errors.contains("'latitude' must be between"), "{errors}");
    assert!(errors.contains("bad.txt doesn't end with .nc"), "{errors}");
    Ok(())
}

#[test]
fn prefixed_labels_are_checked_once_and_exact_matches_win() -> Result<()> {
    let dir = TempDir::new()?;
    let schema = ReferenceSchema::from_toml_str(
        r#"
[Global]
required = ["site_name"]

[Variables.u]
required = ["long_name"]

[Variables.u_2]
required = ["units"]
"#,
    )?;
    let variables = r#"
[Variables.DateTime.csv]
name = "DateTime"

[Variables.u_2.csv]
name = "u"
[Variables.u_2.Attr]
units = "m/s"

[Variables.u_3.csv]
name = "u3"
[Variables.u_3.Attr]
units = "m/s"
"#;
    let control = control_for(dir.path(), "[Global]\nsite_name = \"Test site\"\n", variables)?;

    let report = check_file_config_with(&control, &schema);
    let errors = report.messages.errors();

    assert!(
        !errors.iter().any(|message| message.contains("Variables.u_2")),
        "{errors:?}"
    );
    let u3_errors: Vec<_> = errors
        .iter()
        .filter(|message| message.contains("Variables.u_3: 'long_name' not in Attr"))
        .collect();
    assert_eq!(u3_errors.len(), 1, "{errors:?}");
    Ok(())
}
