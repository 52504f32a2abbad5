use std::fs;
use std::path::{Path, PathBuf};

use toml::Table;
use tracing::warn;

use crate::config::{split_list, value_as_text, ControlFile, CorrectionStep};
use crate::messages::MessageLog;

const INPUT_EXTENSIONS: [&str; 3] = ["xls", "xlsx", "csv"];

/// Checks the `Files` section ahead of ingestion. Returns the output folder to use.
pub(super) fn check_input_files(control: &ControlFile, messages: &mut MessageLog) -> Option<PathBuf> {
    let Some(files) = control.section("Files") else {
        messages.error("'Files' section not in control file");
        return None;
    };

    let file_path = text(files, "file_path").map(PathBuf::from);
    match &file_path {
        Some(path) if path.is_dir() => {}
        Some(path) => messages.error(format!("Files: {} is not a directory", path.display())),
        None => messages.error("Files: 'file_path' not in section"),
    }

    match text(files, "in_filename") {
        Some(names) => {
            for name in split_list(&names) {
                if !has_extension(&name, &INPUT_EXTENSIONS) {
                    messages.error(format!(
                        "Files: {name} doesn't end with .xls, .xlsx or .csv"
                    ));
                    continue;
                }
                if let Some(directory) = &file_path {
                    if !directory.join(&name).is_file() {
                        messages.error(format!("Files: {name} not found"));
                    }
                }
            }
        }
        None => messages.error("Files: 'in_filename' not in section"),
    }

    for key in ["in_firstdatarow", "in_headerrow"] {
        if let Some(rows) = text(files, key) {
            if rows.split(',').any(|item| item.trim().parse::<i64>().is_err()) {
                messages.error(format!("Files: '{key}' is not an integer"));
            }
        }
    }

    let resolved = match text(files, "out_filepath").map(PathBuf::from) {
        Some(out_filepath) => {
            ensure_directory(&out_filepath, messages);
            Some(out_filepath)
        }
        None => {
            messages.error("Files: 'out_filepath' not in section, using file_path as output folder");
            file_path
        }
    };

    match text(files, "out_filename") {
        Some(name) if has_extension(&name, &["nc"]) => {}
        Some(name) => messages.error(format!("Files: {name} doesn't end with .nc")),
        None => messages.error("Files: 'out_filename' not in section"),
    }

    resolved
}

/// Checks the step can write its output and creates `<out_filepath>/<level_folder>`.
pub(super) fn check_step_output(
    control: &ControlFile,
    step: &CorrectionStep,
    messages: &mut MessageLog,
) -> Option<PathBuf> {
    let Some(files) = control.section("Files") else {
        messages.error("'Files' section not in control file");
        return None;
    };

    let out_filepath = text(files, "out_filepath");
    let out_filename = text(files, "out_filename");
    if out_filepath.is_none() {
        messages.error("Files: 'out_filepath' not in section");
    }
    if out_filename.is_none() {
        messages.error("Files: 'out_filename' not in section");
    }
    let (Some(out_filepath), Some(_)) = (out_filepath, out_filename) else {
        return None;
    };

    let folder = Path::new(&out_filepath).join(&step.level_folder);
    ensure_directory(&folder, messages).then_some(folder)
}

/// Creates `path` if needed. A failure is recorded as an error, not returned.
fn ensure_directory(path: &Path, messages: &mut MessageLog) -> bool {
    if path.is_dir() {
        return true;
    }
    messages.info(format!("Files: {} doesn't exist, creating ...", path.display()));
    match fs::create_dir_all(path) {
        Ok(()) => true,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to create output folder");
            messages.error(format!(
                "Files: failed to create output folder {}: {err}",
                path.display()
            ));
            false
        }
    }
}

fn text(files: &Table, key: &str) -> Option<String> {
    files
        .get(key)
        .and_then(value_as_text)
        .filter(|value| !value.trim().is_empty())
}

fn has_extension(name: &str, allowed: &[&str]) -> bool {
    Path::new(name.trim())
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| allowed.iter().any(|a| ext.eq_ignore_ascii_case(a)))
}
