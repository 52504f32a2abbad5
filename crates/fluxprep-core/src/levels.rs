use once_cell::sync::Lazy;
use serde::Serialize;

/// Output folder for corrections whose standard name matches no known level.
pub const UNRECOGNIZED_LEVEL_FOLDER: &str = "level_unrecognized";

/// Value written to `processing_level` for freshly ingested raw data.
pub const PREPROCESSED_LEVEL: &str = "PP";

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingLevel {
    /// "1".."7", or "X" for the non-standard bucket.
    pub key: &'static str,
    pub long_name: &'static str,
    pub short_name: &'static str,
    pub aka: &'static str,
    pub correction_prefix: &'static str,
}

impl ProcessingLevel {
    /// Folder name under `out_filepath` that collects this level's outputs.
    pub fn folder(&self) -> String {
        self.short_name.to_string()
    }

    fn matches(&self, normalized: &str) -> bool {
        [
            self.short_name,
            self.aka,
            self.correction_prefix.trim_matches('_'),
        ]
        .iter()
        .any(|candidate| !candidate.is_empty() && normalize(candidate) == normalized)
    }
}

static PROCESSING_LEVELS: Lazy<Vec<ProcessingLevel>> = Lazy::new(|| {
    vec![
        level("1", "Level 1 (unprocessed)", "level_1", "Unprocessed", ""),
        level("2", "Level 2 (after despiking)", "level_2", "Despike", "Despike_"),
        level("3", "Level 3 (after cross-wind correction)", "level_3", "Cross-wind", ""),
        level("4", "Level 4 (after angle-of-attack correction)", "level_4", "Angle-of-Attack", ""),
        level("5", "Level 5 (after tilt correction)", "level_5", "Tilt", "Tilt_"),
        level("6", "Level 6 (after time lag compensation)", "level_6", "Time Lag", "TimeLag_"),
        level("7", "Level 7 (after detrending)", "level_7", "Detrend", "Detrend_"),
        level("X", "Non-standard correction (unrecognized)", "non-standard", "", ""),
    ]
});

fn level(
    key: &'static str,
    long_name: &'static str,
    short_name: &'static str,
    aka: &'static str,
    correction_prefix: &'static str,
) -> ProcessingLevel {
    ProcessingLevel {
        key,
        long_name,
        short_name,
        aka,
        correction_prefix,
    }
}

pub fn all_processing_levels() -> &'static [ProcessingLevel] {
    PROCESSING_LEVELS.as_slice()
}

pub fn level_by_key(key: &str) -> Option<&'static ProcessingLevel> {
    let key = key.trim();
    PROCESSING_LEVELS
        .iter()
        .find(|level| level.key.eq_ignore_ascii_case(key))
}

/// Case-insensitive lookup by short name, alias or correction prefix.
/// Spaces and hyphens count as underscores.
pub fn level_for_standard_name(standard_name: &str) -> Option<&'static ProcessingLevel> {
    let normalized = normalize(standard_name);
    if normalized.is_empty() {
        return None;
    }
    PROCESSING_LEVELS
        .iter()
        .find(|level| level.matches(&normalized))
}

/// The output sub-folder for a correction's standard name.
pub fn level_folder(standard_name: &str) -> String {
    level_for_standard_name(standard_name)
        .map(ProcessingLevel::folder)
        .unwrap_or_else(|| UNRECOGNIZED_LEVEL_FOLDER.to_string())
}

fn normalize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            ' ' | '-' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}
