use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::ComplianceError;

const STANDARD_SCHEMA: &str = include_str!("../../standard/reference_schema.toml");

/// What a control file is checked against: required globals, known instruments and
/// the attributes each standard variable must carry.
#[derive(Debug, Clone, Deserialize)]
pub struct ReferenceSchema {
    #[serde(rename = "Global")]
    pub global: GlobalSchema,
    #[serde(rename = "Instruments", default)]
    pub instruments: InstrumentSchema,
    #[serde(rename = "Variables", default)]
    pub variables: BTreeMap<String, VariableSchema>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalSchema {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub recommended: Vec<String>,
    #[serde(default)]
    pub time_steps: Vec<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstrumentSchema {
    #[serde(default)]
    pub irga: Vec<String>,
    #[serde(default)]
    pub sonic: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Irga,
    Sonic,
}

impl InstrumentKind {
    /// The `Global` key naming this instrument.
    pub fn global_key(&self) -> &'static str {
        match self {
            InstrumentKind::Irga => "irga_type",
            InstrumentKind::Sonic => "sonic_type",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariableSchema {
    #[serde(default)]
    pub required: Vec<String>,
    pub units: Option<String>,
    pub instrument: Option<InstrumentKind>,
}

impl ReferenceSchema {
    /// The schema bundled with the crate.
    pub fn standard() -> Result<Self, ComplianceError> {
        Self::from_toml_str(STANDARD_SCHEMA)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ComplianceError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ComplianceError> {
        let text = fs::read_to_string(path).map_err(|source| ComplianceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn recognizes_instrument(&self, kind: InstrumentKind, name: &str) -> bool {
        let known = match kind {
            InstrumentKind::Irga => &self.instruments.irga,
            InstrumentKind::Sonic => &self.instruments.sonic,
        };
        known
            .iter()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(name.trim()))
    }

    pub fn accepts_time_step(&self, time_step: f64) -> bool {
        self.global
            .time_steps
            .iter()
            .any(|allowed| (allowed - time_step).abs() < 1e-9)
    }
}
