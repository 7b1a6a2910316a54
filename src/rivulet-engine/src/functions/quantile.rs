//! Quantile interpolation.
//!
//! Pure functions over sorted samples; the aggregate node only collects
//! values per group and calls into here when it emits.

use serde::{Deserialize, Serialize};

/// How to pick a value when the quantile falls between two samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Interpolation {
    /// `lower + (higher - lower) * fraction`
    #[default]
    Linear,
    /// The lower sample.
    Lower,
    /// The higher sample.
    Higher,
    /// The closer sample; ties go to the even index.
    Nearest,
    /// Mean of the two samples.
    Midpoint,
}

/// Quantile `q` of `sorted` (ascending, no NaN ordering assumptions).
///
/// Returns `None` for empty input.
pub fn quantile_sorted(sorted: &[f64], q: f64, interpolation: Interpolation) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let position = q * (sorted.len() - 1) as f64;
    let lower_index = position.floor() as usize;
    let higher_index = position.ceil() as usize;
    let fraction = position - lower_index as f64;
    let lower = sorted[lower_index];
    let higher = sorted[higher_index];

    let value = match interpolation {
        Interpolation::Linear => lower + (higher - lower) * fraction,
        Interpolation::Lower => lower,
        Interpolation::Higher => higher,
        Interpolation::Nearest => {
            if fraction < 0.5 {
                lower
            } else if fraction > 0.5 {
                higher
            } else if lower_index % 2 == 0 {
                lower
            } else {
                higher
            }
        }
        Interpolation::Midpoint => lower + (higher - lower) / 2.0,
    };
    Some(value)
}

/// Sort samples and compute their quantile.
pub fn quantile(mut values: Vec<f64>, q: f64, interpolation: Interpolation) -> Option<f64> {
    values.sort_by(f64::total_cmp);
    quantile_sorted(&values, q, interpolation)
}
