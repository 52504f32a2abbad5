use std::collections::{BTreeMap, BTreeSet};

use toml::{Table, Value};

use super::schema::{InstrumentKind, ReferenceSchema, VariableSchema};
use crate::config::{value_as_f64, value_as_text, ControlFile};
use crate::messages::MessageLog;

pub(super) fn check_global(control: &ControlFile, schema: &ReferenceSchema, messages: &mut MessageLog) {
    let Some(global) = control.section("Global") else {
        messages.error("'Global' section not in control file");
        return;
    };

    for key in &schema.global.required {
        if !global.contains_key(key) {
            messages.error(format!("Global: {key} not in section (required)"));
        }
    }
    for key in &schema.global.recommended {
        if !global.contains_key(key) {
            messages.warning(format!("Global: {key} not in section (recommended)"));
        }
    }

    if let Some(value) = global.get("time_step") {
        match value_as_f64(value) {
            None => messages.error("Global: 'time_step' is not a number"),
            Some(step) if !schema.accepts_time_step(step) => {
                let allowed: Vec<String> = schema
                    .global
                    .time_steps
                    .iter()
                    .map(f64::to_string)
                    .collect();
                messages.error(format!(
                    "Global: 'time_step' must be one of {}",
                    allowed.join(", ")
                ));
            }
            Some(_) => {}
        }
    }
    check_range(global, "latitude", 90.0, messages);
    check_range(global, "longitude", 180.0, messages);

    for kind in [InstrumentKind::Irga, InstrumentKind::Sonic] {
        let key = kind.global_key();
        if let Some(name) = global.get(key).and_then(value_as_text) {
            if !schema.recognizes_instrument(kind, &name) {
                messages.error(format!("Global: {key} '{name}' is not a recognized type"));
            }
        }
    }
}

fn check_range(global: &Table, key: &str, limit: f64, messages: &mut MessageLog) {
    let Some(value) = global.get(key) else {
        return;
    };
    match value_as_f64(value) {
        Some(number) if (-limit..=limit).contains(&number) => {}
        Some(_) => messages.error(format!("Global: '{key}' must be between -{limit} and {limit}")),
        None => messages.error(format!("Global: '{key}' is not a number")),
    }
}

pub(super) fn check_variables(
    control: &ControlFile,
    schema: &ReferenceSchema,
    messages: &mut MessageLog,
) {
    let Some(variables) = control.section("Variables") else {
        messages.error("'Variables' section not in control file");
        return;
    };
    let global = control.section("Global");

    let mut labels: Vec<&String> = variables.keys().collect();
    labels.sort();

    let mut done: BTreeSet<&str> = BTreeSet::new();
    for label in &labels {
        if let Some(expected) = schema.variables.get(label.as_str()) {
            check_variable(label, variables.get(label.as_str()), expected, global, messages);
            done.insert(label.as_str());
        }
    }
    for (std_label, expected) in &schema.variables {
        for label in &labels {
            if done.contains(label.as_str()) || !label.starts_with(std_label.as_str()) {
                continue;
            }
            check_variable(label, variables.get(label.as_str()), expected, global, messages);
            done.insert(label.as_str());
        }
    }

    check_duplicate_names(&labels, messages);
    check_duplicate_inputs(variables, messages);
}

fn check_variable(
    label: &str,
    entry: Option<&Value>,
    expected: &VariableSchema,
    global: Option<&Table>,
    messages: &mut MessageLog,
) {
    let Some(attr) = entry
        .and_then(Value::as_table)
        .and_then(|entry| entry.get("Attr"))
        .and_then(Value::as_table)
    else {
        messages.error(format!("Variables.{label}: 'Attr' section not found"));
        return;
    };

    for key in &expected.required {
        if !attr.contains_key(key) {
            messages.error(format!("Variables.{label}: '{key}' not in Attr (required)"));
        }
    }

    if let (Some(wanted), Some(found)) = (&expected.units, attr.get("units").and_then(value_as_text)) {
        if found.trim() != wanted.as_str() {
            messages.warning(format!(
                "Variables.{label}: units '{found}' differ from expected '{wanted}'"
            ));
        }
    }

    if let Some(kind) = expected.instrument {
        let key = kind.global_key();
        let global_type = global.and_then(|global| global.get(key)).and_then(value_as_text);
        match global_type {
            None => messages.error(format!("Variables.{label}: needs Global '{key}'")),
            Some(global_type) => {
                if let Some(own) = attr.get("instrument").and_then(value_as_text) {
                    if !own.trim().eq_ignore_ascii_case(global_type.trim()) {
                        messages.warning(format!(
                            "Variables.{label}: instrument '{own}' differs from Global {key} '{global_type}'"
                        ));
                    }
                }
            }
        }
    }
}

fn check_duplicate_names(labels: &[&String], messages: &mut MessageLog) {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for label in labels {
        if let Some(first) = seen.insert(label.to_lowercase(), label.as_str()) {
            messages.error(format!(
                "Variables: duplicate output variable names '{first}' and '{label}'"
            ));
        }
    }
}

fn check_duplicate_inputs(variables: &Table, messages: &mut MessageLog) {
    let mut seen: BTreeMap<String, &str> = BTreeMap::new();
    for (label, entry) in variables {
        let column = entry
            .as_table()
            .and_then(|entry| entry.get("csv"))
            .and_then(Value::as_table)
            .and_then(|csv| csv.get("name"))
            .and_then(value_as_text);
        let Some(column) = column else {
            continue;
        };
        if let Some(first) = seen.insert(column.clone(), label.as_str()) {
            messages.error(format!(
                "Variables: input column '{column}' used by both '{first}' and '{label}'"
            ));
        }
    }
}
