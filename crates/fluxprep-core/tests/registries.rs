use anyhow::Result;
use chrono::NaiveDate;
use fluxprep_core::dataset::{Dataset, Variable};
use fluxprep_core::error::CorrectionError;
use fluxprep_core::levels::{
    all_processing_levels, level_by_key, level_folder, level_for_standard_name,
    UNRECOGNIZED_LEVEL_FOLDER,
};
use fluxprep_core::registry::{
    all_correction_descriptors, all_corrections, apply_by_name, normalize_function_name, resolve,
    CorrectionArgs, CorrectionFunction, CorrectionKind,
};
use toml::{Table, Value};

fn dataset(n: usize) -> Result<Dataset> {
    let start = NaiveDate::from_ymd_opt(2023, 10, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let axis = (0..n)
        .map(|i| start + chrono::Duration::seconds(i as i64))
        .collect();
    let mut ds = Dataset::new(axis);
    let u: Vec<f64> = (0..n).map(|i| 3.0 + (0.3 * i as f64).sin()).collect();
    let v: Vec<f64> = (0..n).map(|i| 1.0 + (0.7 * i as f64).cos()).collect();
    let w: Vec<f64> = (0..n).map(|i| 0.2 + 0.1 * (1.1 * i as f64).sin()).collect();
    ds.insert_variable(Variable::from_values("u", &u))?;
    ds.insert_variable(Variable::from_values("v", &v))?;
    ds.insert_variable(Variable::from_values("w", &w))?;
    Ok(ds)
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| name.to_string()).collect()
}

#[test]
fn registries_are_populated() {
    assert_eq!(all_correction_descriptors().len(), all_corrections().len());
    assert!(
        all_correction_descriptors()
            .iter()
            .any(|descriptor| descriptor.function_name == "Despike_Mauder_2013"),
        "expected despiking to be registered"
    );
    assert!(
        all_processing_levels().iter().any(|level| level.key == "X"),
        "expected the non-standard level to be registered"
    );
}

#[test]
fn resolves_names_written_as_calls() -> Result<()> {
    assert_eq!(
        normalize_function_name("\"Tilt_2_rotation(u, v, w)\""),
        "Tilt_2_rotation"
    );
    assert_eq!(resolve("tilt_3_rotation")?.kind(), CorrectionKind::TripleRotation);
    assert_eq!(resolve("'planar_fit'")?.kind(), CorrectionKind::PlanarFit);
    assert_eq!(
        resolve("Despike_Mauder_2013(q=7)")?.kind(),
        CorrectionKind::DespikeMauder2013
    );

    let err = resolve("Despike_Vickers_1997").err().expect("unknown name");
    assert!(matches!(err, CorrectionError::UnknownCorrection(name) if name == "Despike_Vickers_1997"));
    Ok(())
}

#[test]
fn rotation_keeps_column_order_and_shape() -> Result<()> {
    let ds = dataset(60)?;
    let table = ds.working_table(&names(&["w", "u", "v"]))?;

    let output = apply_by_name("Tilt_2_rotation", &table, &CorrectionArgs::default())?;

    assert_eq!(output.shape(), table.shape());
    let columns: Vec<String> = output
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    assert_eq!(columns, names(&["w", "u", "v"]));
    Ok(())
}

#[test]
fn rotation_rejects_tables_without_the_wind_triple() -> Result<()> {
    let ds = dataset(20)?;
    let table = ds.working_table(&names(&["u", "v"]))?;

    let err = apply_by_name("Tilt_2_rotation", &table, &CorrectionArgs::default())
        .err()
        .expect("two components are not enough");
    assert!(matches!(err, CorrectionError::InvalidArguments { .. }));
    Ok(())
}

#[test]
fn unknown_keywords_are_rejected() -> Result<()> {
    let ds = dataset(20)?;
    let table = ds.working_table(&names(&["u"]))?;
    let mut keyword = Table::new();
    keyword.insert("window".to_string(), Value::Integer(5));

    let err = apply_by_name(
        "Despike_Mauder_2013",
        &table,
        &CorrectionArgs::new(Vec::new(), keyword),
    )
    .err()
    .expect("window is not a despike argument");
    assert!(matches!(err, CorrectionError::InvalidArguments { .. }));
    Ok(())
}

#[test]
fn despike_accepts_sensitivity_positionally() -> Result<()> {
    let ds = dataset(40)?;
    let table = ds.working_table(&names(&["u", "w"]))?;

    let output = apply_by_name(
        "despike",
        &table,
        &CorrectionArgs::new(vec![Value::Float(5.0)], Table::new()),
    )?;

    assert_eq!(output.shape(), (40, 2));
    Ok(())
}

#[test]
fn segmented_rotation_processes_each_block() -> Result<()> {
    let ds = dataset(120)?;
    let table = ds.working_table(&names(&["u", "v", "w"]))?;
    let mut keyword = Table::new();
    keyword.insert("segment_minutes".to_string(), Value::Float(0.5));

    let output = apply_by_name(
        "Tilt_2_rotation",
        &table,
        &CorrectionArgs::new(Vec::new(), keyword),
    )?;

    let v: Vec<f64> = output.column("v")?.f64()?.into_no_null_iter().collect();
    for block in v.chunks(30) {
        let mean = block.iter().sum::<f64>() / block.len() as f64;
        assert!(mean.abs() < 1e-9, "block mean v = {mean}");
    }
    Ok(())
}

#[test]
fn levels_match_names_loosely() {
    assert_eq!(level_folder("Despike"), "level_2");
    assert_eq!(level_folder("tilt"), "level_5");
    assert_eq!(level_folder("Time-Lag"), "level_6");
    assert_eq!(level_folder("angle of attack"), "level_4");
    assert_eq!(level_folder("Spectral"), UNRECOGNIZED_LEVEL_FOLDER);
    assert!(level_for_standard_name("  ").is_none());
    assert_eq!(level_by_key("7").map(|level| level.short_name), Some("level_7"));
}
