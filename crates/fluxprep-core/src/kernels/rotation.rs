//! Sonic anemometer tilt correction (Wilczak et al., 2001).
//!
//! Double and triple rotation are meant to be recomputed for every short averaging block
//! (typically 30 minutes); planar fit is fit once over a long record and the resulting
//! matrix is reused for every sub-period via [`rotate_with`]. Segmentation is the caller's
//! business.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::stats::{mat_mul, mat_vec, mean, mean_product, solve_3x3, transpose, Matrix3};
use super::KernelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    Double,
    Triple,
    PlanarFit,
}

impl RotationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationMode::Double => "double",
            RotationMode::Triple => "triple",
            RotationMode::PlanarFit => "planar_fit",
        }
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "double" | "2r" => Ok(RotationMode::Double),
            "triple" | "3r" => Ok(RotationMode::Triple),
            "planar_fit" | "planarfit" | "pf" => Ok(RotationMode::PlanarFit),
            other => Err(format!(
                "unknown rotation mode '{other}'; choose double (2r), triple (3r) or planar_fit (pf)"
            )),
        }
    }
}

/// Externally supplied angles (radians). Any angle left `None` is computed from the data.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RotationAngles {
    pub theta: Option<f64>,
    pub phi: Option<f64>,
    pub psi: Option<f64>,
}

/// Least-squares plane `w = b0 + b1 u + b2 v` and the rotation derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PlanarFit {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    /// Yaw angle applied after the tilt, radians.
    pub alpha: f64,
    /// Combined rotation `R1ᵀ R3ᵀ R2ᵀ`, applied to `(u, v, w - b0)`.
    pub matrix: [[f64; 3]; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RotationParameters {
    Double { theta: f64, phi: f64 },
    Triple { theta: f64, phi: f64, psi: f64 },
    PlanarFit(PlanarFit),
}

impl RotationParameters {
    pub fn mode(&self) -> RotationMode {
        match self {
            RotationParameters::Double { .. } => RotationMode::Double,
            RotationParameters::Triple { .. } => RotationMode::Triple,
            RotationParameters::PlanarFit(_) => RotationMode::PlanarFit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rotated {
    pub u: Vec<Option<f64>>,
    pub v: Vec<Option<f64>>,
    pub w: Vec<Option<f64>>,
    pub parameters: RotationParameters,
}

/// Rotates the wind components, computing whatever angles `overrides` leaves open.
///
/// Statistics use rows where all three components are present; rows with any
/// missing component stay missing in the output.
pub fn rotate(
    u: &[Option<f64>],
    v: &[Option<f64>],
    w: &[Option<f64>],
    mode: RotationMode,
    overrides: RotationAngles,
) -> Result<Rotated, KernelError> {
    let samples = Samples::collect(u, v, w)?;
    let parameters = match mode {
        RotationMode::Double => {
            let (theta, phi) = double_angles(&samples, overrides)?;
            RotationParameters::Double { theta, phi }
        }
        RotationMode::Triple => {
            let (theta, phi) = double_angles(&samples, overrides)?;
            let psi = match overrides.psi {
                Some(psi) => psi,
                None => third_angle(&samples, theta, phi)?,
            };
            RotationParameters::Triple { theta, phi, psi }
        }
        RotationMode::PlanarFit => RotationParameters::PlanarFit(fit_plane(u, v, w)?),
    };
    Ok(samples.apply(&parameters))
}

/// Reapplies previously computed rotation parameters to another segment.
pub fn rotate_with(
    u: &[Option<f64>],
    v: &[Option<f64>],
    w: &[Option<f64>],
    parameters: &RotationParameters,
) -> Result<Rotated, KernelError> {
    let samples = Samples::collect(u, v, w)?;
    Ok(samples.apply(parameters))
}

/// Fits the mean-wind plane and derives the planar-fit rotation matrix.
pub fn fit_plane(
    u: &[Option<f64>],
    v: &[Option<f64>],
    w: &[Option<f64>],
) -> Result<PlanarFit, KernelError> {
    let samples = Samples::collect(u, v, w)?;
    samples.require("planar_fit", 3)?;

    let mu = samples.mean_u();
    let mv = samples.mean_v();
    let mw = samples.mean_w();
    let muu = mean_product(&samples.u, &samples.u).unwrap_or(0.0);
    let mvv = mean_product(&samples.v, &samples.v).unwrap_or(0.0);
    let muv = mean_product(&samples.u, &samples.v).unwrap_or(0.0);
    let muw = mean_product(&samples.u, &samples.w).unwrap_or(0.0);
    let mvw = mean_product(&samples.v, &samples.w).unwrap_or(0.0);

    let normal_matrix = [[1.0, mu, mv], [mu, muu, muv], [mv, muv, mvv]];
    let [b0, b1, b2] =
        solve_3x3(normal_matrix, [mw, muw, mvw]).ok_or_else(|| KernelError::Degenerate {
            kernel: "planar_fit",
            reason: "normal equations are singular; u and v need independent variation"
                .to_string(),
        })?;

    let denominator = (1.0 + b1 * b1 + b2 * b2).sqrt();
    let p31 = -b1 / denominator;
    let p32 = -b2 / denominator;
    let p33 = 1.0 / denominator;

    let cos_beta = (p32 * p32 + p33 * p33).sqrt();
    let sin_beta = p31;
    let cos_gamma = p33 / cos_beta;
    let sin_gamma = -p32 / cos_beta;

    let r2: Matrix3 = [
        [1.0, 0.0, 0.0],
        [0.0, cos_gamma, -sin_gamma],
        [0.0, sin_gamma, cos_gamma],
    ];
    let r3: Matrix3 = [
        [cos_beta, 0.0, sin_beta],
        [0.0, 1.0, 0.0],
        [-sin_beta, 0.0, cos_beta],
    ];
    let tilt = mat_mul(&transpose(&r3), &transpose(&r2));

    let tilted_mean = mat_vec(&tilt, [mu, mv, mw - b0]);
    let alpha = tilted_mean[1].atan2(tilted_mean[0]);
    let (sin_alpha, cos_alpha) = alpha.sin_cos();
    let r1: Matrix3 = [
        [cos_alpha, -sin_alpha, 0.0],
        [sin_alpha, cos_alpha, 0.0],
        [0.0, 0.0, 1.0],
    ];

    Ok(PlanarFit {
        b0,
        b1,
        b2,
        alpha,
        matrix: mat_mul(&transpose(&r1), &tilt),
    })
}

fn double_angles(samples: &Samples, overrides: RotationAngles) -> Result<(f64, f64), KernelError> {
    if overrides.theta.is_none() || overrides.phi.is_none() {
        samples.require("double_rotation", 1)?;
    }
    let theta = overrides
        .theta
        .unwrap_or_else(|| samples.mean_v().atan2(samples.mean_u()));
    let phi = match overrides.phi {
        Some(phi) => phi,
        None => {
            let (u1, _, w1) = samples.first_rotation(theta);
            mean(&w1)
                .unwrap_or(0.0)
                .atan2(mean(&u1).unwrap_or(0.0))
        }
    };
    Ok((theta, phi))
}

fn third_angle(samples: &Samples, theta: f64, phi: f64) -> Result<f64, KernelError> {
    samples.require("triple_rotation", 1)?;
    let (_, v2, w2) = samples.second_rotation(theta, phi);
    let cross = mean_product(&v2, &w2).unwrap_or(0.0);
    let vv = mean_product(&v2, &v2).unwrap_or(0.0);
    let ww = mean_product(&w2, &w2).unwrap_or(0.0);
    Ok(0.5 * (2.0 * cross).atan2(vv - ww))
}

/// Complete (u, v, w) rows and where they came from.
struct Samples {
    len: usize,
    rows: Vec<usize>,
    u: Vec<f64>,
    v: Vec<f64>,
    w: Vec<f64>,
}

impl Samples {
    fn collect(u: &[Option<f64>], v: &[Option<f64>], w: &[Option<f64>]) -> Result<Self, KernelError> {
        if u.len() != v.len() || u.len() != w.len() {
            return Err(KernelError::LengthMismatch {
                u: u.len(),
                v: v.len(),
                w: w.len(),
            });
        }

        let mut samples = Samples {
            len: u.len(),
            rows: Vec::with_capacity(u.len()),
            u: Vec::with_capacity(u.len()),
            v: Vec::with_capacity(u.len()),
            w: Vec::with_capacity(u.len()),
        };
        for (idx, ((a, b), c)) in u.iter().zip(v).zip(w).enumerate() {
            if let (Some(a), Some(b), Some(c)) = (a, b, c) {
                if a.is_finite() && b.is_finite() && c.is_finite() {
                    samples.rows.push(idx);
                    samples.u.push(*a);
                    samples.v.push(*b);
                    samples.w.push(*c);
                }
            }
        }
        Ok(samples)
    }

    fn require(&self, kernel: &'static str, required: usize) -> Result<(), KernelError> {
        if self.rows.len() < required {
            return Err(KernelError::InsufficientData {
                kernel,
                required,
                found: self.rows.len(),
            });
        }
        Ok(())
    }

    fn mean_u(&self) -> f64 {
        mean(&self.u).unwrap_or(0.0)
    }

    fn mean_v(&self) -> f64 {
        mean(&self.v).unwrap_or(0.0)
    }

    fn mean_w(&self) -> f64 {
        mean(&self.w).unwrap_or(0.0)
    }

    /// Yaw about the vertical axis.
    fn first_rotation(&self, theta: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let (sin_t, cos_t) = theta.sin_cos();
        let u1 = self
            .u
            .iter()
            .zip(&self.v)
            .map(|(u, v)| u * cos_t + v * sin_t)
            .collect();
        let v1 = self
            .u
            .iter()
            .zip(&self.v)
            .map(|(u, v)| -u * sin_t + v * cos_t)
            .collect();
        (u1, v1, self.w.clone())
    }

    /// Yaw, then pitch about the new transverse axis.
    fn second_rotation(&self, theta: f64, phi: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
        let (u1, v1, w1) = self.first_rotation(theta);
        let (sin_p, cos_p) = phi.sin_cos();
        let u2 = u1
            .iter()
            .zip(&w1)
            .map(|(u, w)| u * cos_p + w * sin_p)
            .collect();
        let w2 = u1
            .iter()
            .zip(&w1)
            .map(|(u, w)| -u * sin_p + w * cos_p)
            .collect();
        (u2, v1, w2)
    }

    fn apply(&self, parameters: &RotationParameters) -> Rotated {
        let (u, v, w) = match *parameters {
            RotationParameters::Double { theta, phi } => self.second_rotation(theta, phi),
            RotationParameters::Triple { theta, phi, psi } => {
                let (u2, v2, w2) = self.second_rotation(theta, phi);
                let (sin_s, cos_s) = psi.sin_cos();
                let v3 = v2
                    .iter()
                    .zip(&w2)
                    .map(|(v, w)| v * cos_s + w * sin_s)
                    .collect();
                let w3 = v2
                    .iter()
                    .zip(&w2)
                    .map(|(v, w)| -v * sin_s + w * cos_s)
                    .collect();
                (u2, v3, w3)
            }
            RotationParameters::PlanarFit(fit) => {
                let mut u = Vec::with_capacity(self.rows.len());
                let mut v = Vec::with_capacity(self.rows.len());
                let mut w = Vec::with_capacity(self.rows.len());
                for i in 0..self.rows.len() {
                    let [a, b, c] =
                        mat_vec(&fit.matrix, [self.u[i], self.v[i], self.w[i] - fit.b0]);
                    u.push(a);
                    v.push(b);
                    w.push(c);
                }
                (u, v, w)
            }
        };

        Rotated {
            u: self.scatter(&u),
            v: self.scatter(&v),
            w: self.scatter(&w),
            parameters: *parameters,
        }
    }

    fn scatter(&self, values: &[f64]) -> Vec<Option<f64>> {
        let mut out = vec![None; self.len];
        for (row, value) in self.rows.iter().zip(values) {
            out[*row] = Some(*value);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mode_aliases() {
        assert_eq!("2r".parse::<RotationMode>(), Ok(RotationMode::Double));
        assert_eq!("Triple".parse::<RotationMode>(), Ok(RotationMode::Triple));
        assert_eq!("pf".parse::<RotationMode>(), Ok(RotationMode::PlanarFit));
        assert!("sideways".parse::<RotationMode>().is_err());
    }

    #[test]
    fn rows_with_missing_components_stay_missing() {
        let u = [Some(2.0), None, Some(3.0)];
        let v = [Some(1.0), Some(1.0), Some(0.5)];
        let w = [Some(0.1), Some(0.2), None];
        let rotated = rotate(&u, &v, &w, RotationMode::Double, RotationAngles::default()).unwrap();
        assert!(rotated.u[0].is_some());
        assert_eq!(rotated.u[1], None);
        assert_eq!(rotated.w[2], None);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = rotate(
            &[Some(1.0)],
            &[Some(1.0), Some(2.0)],
            &[Some(0.0)],
            RotationMode::Double,
            RotationAngles::default(),
        )
        .unwrap_err();
        assert_eq!(err, KernelError::LengthMismatch { u: 1, v: 2, w: 1 });
    }
}
