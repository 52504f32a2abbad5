//! Robust despiking after Mauder et al. (2013): absurd-value screening around the
//! 1st/99th percentiles, median-absolute-deviation spike bounds, and linear gap filling
//! for the samples those two filters removed.

use super::stats::{median_sorted, quantile_sorted};
use super::KernelError;

pub const DEFAULT_SENSITIVITY: f64 = 7.0;

/// MAD of a normal distribution relative to its standard deviation.
const MAD_NORMAL_CONSISTENCY: f64 = 0.6745;
const ABSURD_ORDERS_OF_MAGNITUDE: i32 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DespikeReport {
    pub absurd_discarded: usize,
    pub spikes_removed: usize,
    pub absurd_bounds: Option<(f64, f64)>,
    pub spike_bounds: Option<(f64, f64)>,
    pub preexisting_gaps: usize,
}

impl DespikeReport {
    pub fn total_removed(&self) -> usize {
        self.absurd_discarded + self.spikes_removed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DespikeOutput {
    pub values: Vec<Option<f64>>,
    pub report: DespikeReport,
}

pub fn despike(series: &[Option<f64>], sensitivity: f64) -> Result<DespikeOutput, KernelError> {
    if !sensitivity.is_finite() || sensitivity <= 0.0 {
        return Err(KernelError::InvalidArgument {
            kernel: "despike",
            message: format!("sensitivity must be finite and positive, got {sensitivity}"),
        });
    }

    let original_gap: Vec<bool> = series
        .iter()
        .map(|value| !matches!(value, Some(v) if v.is_finite()))
        .collect();
    let mut working: Vec<Option<f64>> = series
        .iter()
        .zip(&original_gap)
        .map(|(value, &gap)| if gap { None } else { *value })
        .collect();

    let mut report = DespikeReport {
        preexisting_gaps: original_gap.iter().filter(|&&gap| gap).count(),
        ..DespikeReport::default()
    };

    let mut present: Vec<f64> = working.iter().flatten().copied().collect();
    if present.is_empty() {
        return Ok(DespikeOutput {
            values: working,
            report,
        });
    }

    present.sort_by(|a, b| a.total_cmp(b));
    let (min_bound, max_bound) = absurdity_bounds(&present);
    report.absurd_bounds = Some((min_bound, max_bound));
    report.absurd_discarded = discard_outside(&mut working, min_bound, max_bound);

    // `present` is sorted, so the values that survived screening are one contiguous run.
    let kept = &present[present.partition_point(|v| *v < min_bound)
        ..present.partition_point(|v| *v <= max_bound)];
    if let Some(center) = median_sorted(kept) {
        let mut deviations: Vec<f64> = kept.iter().map(|v| (v - center).abs()).collect();
        deviations.sort_by(|a, b| a.total_cmp(b));
        let mad = median_sorted(&deviations).unwrap_or(0.0);
        let half_width = sensitivity * mad / MAD_NORMAL_CONSISTENCY;
        let (lower, upper) = (center - half_width, center + half_width);
        report.spike_bounds = Some((lower, upper));
        report.spikes_removed = discard_outside(&mut working, lower, upper);
    }

    let values = fill_new_gaps(&working, &original_gap).ok_or(KernelError::InsufficientData {
        kernel: "despike",
        required: 1,
        found: 0,
    })?;

    Ok(DespikeOutput { values, report })
}

/// Bounds three orders of magnitude beyond the 1st and 99th percentiles.
fn absurdity_bounds(sorted: &[f64]) -> (f64, f64) {
    let p1 = quantile_sorted(sorted, 0.01).unwrap_or(f64::NEG_INFINITY);
    let p99 = quantile_sorted(sorted, 0.99).unwrap_or(f64::INFINITY);
    let scale = 10f64.powi(ABSURD_ORDERS_OF_MAGNITUDE);
    let min_bound = if p1 > 0.0 { p1 / scale } else { p1 * scale };
    let max_bound = if p99 > 0.0 { p99 * scale } else { p99 / scale };
    (min_bound, max_bound)
}

fn discard_outside(values: &mut [Option<f64>], lower: f64, upper: f64) -> usize {
    let mut discarded = 0;
    for slot in values.iter_mut() {
        if let Some(v) = *slot {
            if v < lower || v > upper {
                *slot = None;
                discarded += 1;
            }
        }
    }
    discarded
}

/// Linear interpolation across gaps opened by the filters, holding the edge value past
/// the first/last valid sample. Gaps that were already in the input stay missing.
/// Returns `None` when nothing valid is left to interpolate from.
fn fill_new_gaps(values: &[Option<f64>], original_gap: &[bool]) -> Option<Vec<Option<f64>>> {
    let valid: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(idx, value)| value.map(|v| (idx, v)))
        .collect();
    if valid.is_empty() {
        return if original_gap.iter().all(|&gap| gap) {
            Some(values.to_vec())
        } else {
            None
        };
    }

    let mut filled = Vec::with_capacity(values.len());
    let mut next = 0usize;
    for (idx, value) in values.iter().enumerate() {
        if original_gap[idx] {
            filled.push(None);
            continue;
        }
        if let Some(v) = value {
            filled.push(Some(*v));
            continue;
        }

        while next < valid.len() && valid[next].0 < idx {
            next += 1;
        }
        let interpolated = match (next.checked_sub(1).map(|i| valid[i]), valid.get(next)) {
            (Some((x0, y0)), Some(&(x1, y1))) => {
                let t = (idx - x0) as f64 / (x1 - x0) as f64;
                y0 + (y1 - y0) * t
            }
            (Some((_, y0)), None) => y0,
            (None, Some(&(_, y1))) => y1,
            (None, None) => return None,
        };
        filled.push(Some(interpolated));
    }
    Some(filled)
}
