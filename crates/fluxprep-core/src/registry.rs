use chrono::NaiveDateTime;
use once_cell::sync::Lazy;
use polars::prelude::*;
use serde::Serialize;
use toml::{Table, Value};
use tracing::{debug, info};

use crate::config::{value_as_f64, CorrectionStep};
use crate::dataset::WorkingTable;
use crate::error::CorrectionError;
use crate::kernels::{despike, rotate, KernelError, RotationAngles, RotationMode, DEFAULT_SENSITIVITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CorrectionKind {
    DespikeMauder2013,
    DoubleRotation,
    TripleRotation,
    PlanarFit,
}

impl CorrectionKind {
    pub fn function_name(&self) -> &'static str {
        match self {
            CorrectionKind::DespikeMauder2013 => "Despike_Mauder_2013",
            CorrectionKind::DoubleRotation => "Tilt_2_rotation",
            CorrectionKind::TripleRotation => "Tilt_3_rotation",
            CorrectionKind::PlanarFit => "Tilt_planar_fit",
        }
    }
}

/// A correction callable by name from a control file.
///
/// Implementations receive the step's working table and must return a frame with the
/// same height and the same column names; the pipeline rejects anything else.
pub trait CorrectionFunction: Send + Sync {
    fn kind(&self) -> CorrectionKind;
    fn aliases(&self) -> &'static [&'static str];
    fn apply(
        &self,
        table: &WorkingTable<'_>,
        args: &CorrectionArgs,
    ) -> Result<DataFrame, CorrectionError>;

    fn function_name(&self) -> &'static str {
        self.kind().function_name()
    }
}

#[derive(Debug, Clone)]
pub struct CorrectionDescriptor {
    pub function_name: &'static str,
    pub aliases: &'static [&'static str],
    pub standard_name: &'static str,
    pub description: &'static str,
}

static CORRECTIONS: Lazy<Vec<CorrectionDescriptor>> = Lazy::new(|| {
    vec![
        CorrectionDescriptor {
            function_name: CorrectionKind::DespikeMauder2013.function_name(),
            aliases: DESPIKE_ALIASES,
            standard_name: "Despike",
            description: "Absurd-value screening plus MAD spike removal (Mauder et al., 2013)",
        },
        CorrectionDescriptor {
            function_name: CorrectionKind::DoubleRotation.function_name(),
            aliases: DOUBLE_ALIASES,
            standard_name: "Tilt",
            description: "Double rotation of u, v, w (Wilczak et al., 2001)",
        },
        CorrectionDescriptor {
            function_name: CorrectionKind::TripleRotation.function_name(),
            aliases: TRIPLE_ALIASES,
            standard_name: "Tilt",
            description: "Triple rotation of u, v, w (Wilczak et al., 2001)",
        },
        CorrectionDescriptor {
            function_name: CorrectionKind::PlanarFit.function_name(),
            aliases: PLANAR_FIT_ALIASES,
            standard_name: "Tilt",
            description: "Planar-fit rotation of u, v, w (Wilczak et al., 2001)",
        },
    ]
});

pub fn all_correction_descriptors() -> &'static [CorrectionDescriptor] {
    CORRECTIONS.as_slice()
}

static CORRECTION_IMPLEMENTATIONS: Lazy<Vec<&'static dyn CorrectionFunction>> = Lazy::new(|| {
    vec![
        &DespikeMauder2013 as &dyn CorrectionFunction,
        &TiltRotation(RotationMode::Double) as &dyn CorrectionFunction,
        &TiltRotation(RotationMode::Triple) as &dyn CorrectionFunction,
        &TiltRotation(RotationMode::PlanarFit) as &dyn CorrectionFunction,
    ]
});

pub fn all_corrections() -> &'static [&'static dyn CorrectionFunction] {
    CORRECTION_IMPLEMENTATIONS.as_slice()
}

/// Strips quotes and drops any call syntax: `"Tilt_2_rotation(u, v, w)"` -> `Tilt_2_rotation`.
pub fn normalize_function_name(raw: &str) -> String {
    let unquoted: String = raw.chars().filter(|c| *c != '"' && *c != '\'').collect();
    let bare = match unquoted.find('(') {
        Some(idx) => &unquoted[..idx],
        None => unquoted.as_str(),
    };
    bare.trim().to_string()
}

pub fn resolve(raw: &str) -> Result<&'static dyn CorrectionFunction, CorrectionError> {
    let name = normalize_function_name(raw);
    all_corrections()
        .iter()
        .copied()
        .find(|correction| {
            correction.function_name().eq_ignore_ascii_case(&name)
                || correction
                    .aliases()
                    .iter()
                    .any(|alias| alias.eq_ignore_ascii_case(&name))
        })
        .ok_or(CorrectionError::UnknownCorrection(name))
}

/// Positional and keyword arguments from a step's `args` / `kwargs`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionArgs {
    positional: Vec<Value>,
    keyword: Table,
}

impl CorrectionArgs {
    pub fn new(positional: Vec<Value>, keyword: Table) -> Self {
        Self {
            positional,
            keyword,
        }
    }

    pub fn from_step(step: &CorrectionStep) -> Self {
        Self::new(step.positional_args.clone(), step.keyword_args.clone())
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn keyword(&self) -> &Table {
        &self.keyword
    }

    fn reject_unknown_keywords(
        &self,
        function: &'static str,
        accepted: &[&str],
        max_positional: usize,
    ) -> Result<(), CorrectionError> {
        if let Some(key) = self.keyword.keys().find(|key| !accepted.contains(&key.as_str())) {
            return Err(CorrectionError::InvalidArguments {
                function,
                message: format!("unexpected keyword '{key}'"),
            });
        }
        if self.positional.len() > max_positional {
            return Err(CorrectionError::InvalidArguments {
                function,
                message: format!(
                    "takes at most {max_positional} positional arguments, got {}",
                    self.positional.len()
                ),
            });
        }
        Ok(())
    }

    fn lookup(&self, names: &[&str], position: Option<usize>) -> Option<&Value> {
        names
            .iter()
            .find_map(|name| self.keyword.get(*name))
            .or_else(|| position.and_then(|idx| self.positional.get(idx)))
    }

    fn number(
        &self,
        function: &'static str,
        names: &[&str],
        position: Option<usize>,
    ) -> Result<Option<f64>, CorrectionError> {
        match self.lookup(names, position) {
            None => Ok(None),
            Some(value) => value_as_f64(value).map(Some).ok_or_else(|| {
                CorrectionError::InvalidArguments {
                    function,
                    message: format!("'{}' must be a number, got {value}", names[0]),
                }
            }),
        }
    }

    fn text(
        &self,
        function: &'static str,
        names: &[&str],
        position: Option<usize>,
    ) -> Result<Option<String>, CorrectionError> {
        match self.lookup(names, position) {
            None => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(other) => Err(CorrectionError::InvalidArguments {
                function,
                message: format!("'{}' must be a string, got {other}", names[0]),
            }),
        }
    }
}

const DESPIKE_ALIASES: &[&str] = &["despike"];
const DOUBLE_ALIASES: &[&str] = &["double_rotation"];
const TRIPLE_ALIASES: &[&str] = &["triple_rotation"];
const PLANAR_FIT_ALIASES: &[&str] = &["planar_fit"];

struct DespikeMauder2013;

impl CorrectionFunction for DespikeMauder2013 {
    fn kind(&self) -> CorrectionKind {
        CorrectionKind::DespikeMauder2013
    }

    fn aliases(&self) -> &'static [&'static str] {
        DESPIKE_ALIASES
    }

    fn apply(
        &self,
        table: &WorkingTable<'_>,
        args: &CorrectionArgs,
    ) -> Result<DataFrame, CorrectionError> {
        let function = self.function_name();
        args.reject_unknown_keywords(function, &["q", "sensitivity", "method"], 1)?;
        if let Some(method) = args.text(function, &["method"], None)? {
            if !method.eq_ignore_ascii_case("mauder2013") {
                return Err(CorrectionError::InvalidArguments {
                    function,
                    message: format!("despike method '{method}' not found; choose mauder2013"),
                });
            }
        }
        let sensitivity = args
            .number(function, &["q", "sensitivity"], Some(0))?
            .unwrap_or(DEFAULT_SENSITIVITY);

        let mut columns: Vec<Column> = Vec::with_capacity(table.frame().width());
        for name in table.column_names() {
            let values = table.values(&name)?;
            let output = despike(&values, sensitivity)?;
            let report = output.report;
            if report.absurd_discarded > 0 {
                if let Some((lower, upper)) = report.absurd_bounds {
                    info!(
                        variable = %name,
                        count = report.absurd_discarded,
                        lower,
                        upper,
                        "Ignoring absurd values outside bounds"
                    );
                }
            }
            debug!(
                variable = %name,
                spikes = report.spikes_removed,
                preexisting_gaps = report.preexisting_gaps,
                "Despiked variable"
            );
            columns.push(Series::new(name.as_str().into(), output.values).into());
        }
        Ok(DataFrame::new(columns)?)
    }
}

struct TiltRotation(RotationMode);

impl TiltRotation {
    fn accepted_keywords(&self) -> &'static [&'static str] {
        match self.0 {
            RotationMode::Double => &[
                "u",
                "v",
                "w",
                "theta",
                "_theta",
                "phi",
                "_phi",
                "segment_minutes",
            ],
            RotationMode::Triple => &[
                "u",
                "v",
                "w",
                "theta",
                "_theta",
                "phi",
                "_phi",
                "psi",
                "_psi",
                "segment_minutes",
            ],
            RotationMode::PlanarFit => &["u", "v", "w"],
        }
    }

    fn component_names(
        &self,
        table: &WorkingTable<'_>,
        args: &CorrectionArgs,
    ) -> Result<[String; 3], CorrectionError> {
        let function = self.function_name();
        let name = |key: &str, position: usize| -> Result<String, CorrectionError> {
            Ok(args
                .text(function, &[key], Some(position))?
                .unwrap_or_else(|| key.to_string()))
        };
        let names = [name("u", 0)?, name("v", 1)?, name("w", 2)?];

        let mut present = table.column_names();
        present.sort();
        let mut wanted = names.to_vec();
        wanted.sort();
        wanted.dedup();
        if wanted.len() != 3 || present != wanted {
            return Err(CorrectionError::InvalidArguments {
                function,
                message: format!(
                    "needs exactly the wind components {names:?}, table holds {present:?}"
                ),
            });
        }
        Ok(names)
    }
}

impl CorrectionFunction for TiltRotation {
    fn kind(&self) -> CorrectionKind {
        match self.0 {
            RotationMode::Double => CorrectionKind::DoubleRotation,
            RotationMode::Triple => CorrectionKind::TripleRotation,
            RotationMode::PlanarFit => CorrectionKind::PlanarFit,
        }
    }

    fn aliases(&self) -> &'static [&'static str] {
        match self.0 {
            RotationMode::Double => DOUBLE_ALIASES,
            RotationMode::Triple => TRIPLE_ALIASES,
            RotationMode::PlanarFit => PLANAR_FIT_ALIASES,
        }
    }

    fn apply(
        &self,
        table: &WorkingTable<'_>,
        args: &CorrectionArgs,
    ) -> Result<DataFrame, CorrectionError> {
        let function = self.function_name();
        args.reject_unknown_keywords(function, self.accepted_keywords(), 3)?;
        let [u_name, v_name, w_name] = self.component_names(table, args)?;

        let overrides = RotationAngles {
            theta: args.number(function, &["theta", "_theta"], None)?,
            phi: args.number(function, &["phi", "_phi"], None)?,
            psi: args.number(function, &["psi", "_psi"], None)?,
        };
        let segment_minutes = args.number(function, &["segment_minutes"], None)?;
        if let Some(minutes) = segment_minutes {
            if !minutes.is_finite() || minutes <= 0.0 {
                return Err(CorrectionError::InvalidArguments {
                    function,
                    message: format!("segment_minutes must be positive, got {minutes}"),
                });
            }
        }

        let u = table.values(&u_name)?;
        let v = table.values(&v_name)?;
        let w = table.values(&w_name)?;

        let rotated = match segment_minutes {
            Some(minutes) => {
                rotate_segments(table.timestamps(), &u, &v, &w, self.0, overrides, minutes)?
            }
            None => {
                let rotated = rotate(&u, &v, &w, self.0, overrides)?;
                debug!(function, parameters = ?rotated.parameters, "Rotation applied");
                [rotated.u, rotated.v, rotated.w]
            }
        };

        let [u_out, v_out, w_out] = rotated;
        let mut by_name = [(u_name, u_out), (v_name, v_out), (w_name, w_out)];
        let columns: Vec<Column> = table
            .column_names()
            .into_iter()
            .filter_map(|name| {
                by_name
                    .iter_mut()
                    .find(|(candidate, _)| *candidate == name)
                    .map(|(_, values)| {
                        Series::new(name.as_str().into(), std::mem::take(values)).into()
                    })
            })
            .collect();
        Ok(DataFrame::new(columns)?)
    }
}

/// Rotates each consecutive `minutes`-long block on its own. Blocks without a single
/// complete (u, v, w) row stay missing.
fn rotate_segments(
    timestamps: &[NaiveDateTime],
    u: &[Option<f64>],
    v: &[Option<f64>],
    w: &[Option<f64>],
    mode: RotationMode,
    overrides: RotationAngles,
    minutes: f64,
) -> Result<[Vec<Option<f64>>; 3], CorrectionError> {
    let len = u.len();
    let mut out = [vec![None; len], vec![None; len], vec![None; len]];
    let Some(first) = timestamps.first() else {
        return Ok(out);
    };
    let block_millis = minutes * 60_000.0;
    let block_of = |ts: &NaiveDateTime| {
        ((*ts - *first).num_milliseconds() as f64 / block_millis).floor() as i64
    };

    let mut start = 0;
    while start < len {
        let block = block_of(&timestamps[start]);
        let mut end = start + 1;
        while end < len && block_of(&timestamps[end]) == block {
            end += 1;
        }

        match rotate(&u[start..end], &v[start..end], &w[start..end], mode, overrides) {
            Ok(rotated) => {
                out[0][start..end].clone_from_slice(&rotated.u);
                out[1][start..end].clone_from_slice(&rotated.v);
                out[2][start..end].clone_from_slice(&rotated.w);
            }
            Err(KernelError::InsufficientData { .. }) => {
                debug!(block, rows = end - start, "No complete wind rows in segment");
            }
            Err(err) => return Err(err.into()),
        }
        start = end;
    }
    Ok(out)
}

/// Convenience used by tests and callers outside a pipeline run.
pub fn apply_by_name(
    function_name: &str,
    table: &WorkingTable<'_>,
    args: &CorrectionArgs,
) -> Result<DataFrame, CorrectionError> {
    resolve(function_name)?.apply(table, args)
}
