use itertools::Itertools;
use ndarray::{Array2, ArrayView1};

use crate::data::{mean, quantile_sorted};
use crate::error::{ModelError, Result};

/// Highest density interval of a unimodal sample: the narrowest window of
/// sorted draws holding `prob` of the mass.
pub fn hdi(samples: &[f64], prob: f64) -> (f64, f64) {
    let sorted: Vec<f64> = samples.iter().copied().sorted_by(f64::total_cmp).collect();
    let n = sorted.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let width = (prob * n as f64).floor() as usize;
    let n_intervals = n - width;
    if width == 0 || n_intervals == 0 {
        return (sorted[0], sorted[n - 1]);
    }
    let start = (0..n_intervals)
        .min_by(|&a, &b| {
            let wa = sorted[a + width] - sorted[a];
            let wb = sorted[b + width] - sorted[b];
            wa.total_cmp(&wb)
        })
        .unwrap_or(0);
    (sorted[start], sorted[start + width])
}

/// Equal tailed interval between the `lower` and `upper` quantiles.
pub fn quantile_interval(samples: &[f64], lower: f64, upper: f64) -> (f64, f64) {
    let sorted: Vec<f64> = samples.iter().copied().sorted_by(f64::total_cmp).collect();
    (quantile_sorted(&sorted, lower), quantile_sorted(&sorted, upper))
}

/// Credible interval settings and the names of the summary columns they
/// produce.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Interval {
    prob: f64,
    use_hdi: bool,
    lower: f64,
    upper: f64,
}

impl Interval {
    pub(crate) fn new(prob: f64, use_hdi: bool) -> Result<Self> {
        if !(prob > 0.0 && prob < 1.0) {
            return Err(ModelError::Probability(prob));
        }
        let lower = ((1.0 - prob) / 2.0 * 1e4).round() / 1e4;
        Ok(Self {
            prob,
            use_hdi,
            lower,
            upper: 1.0 - lower,
        })
    }

    pub(crate) fn lower_name(&self) -> String {
        format!("lower_{:?}%", self.lower * 100.0)
    }

    pub(crate) fn upper_name(&self) -> String {
        format!("upper_{:?}%", self.upper * 100.0)
    }

    pub(crate) fn bounds(&self, samples: &[f64]) -> (f64, f64) {
        if self.use_hdi {
            hdi(samples, self.prob)
        } else {
            quantile_interval(samples, self.lower, self.upper)
        }
    }

    /// Mean and interval of every column of (samples, cells) draws.
    pub(crate) fn summarize(&self, draws: &Array2<f64>) -> Summary {
        let mut summary = Summary::default();
        for column in draws.columns() {
            summary.push(self, column);
        }
        summary
    }
}

/// Estimates and interval bounds, one entry per summarized cell.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Summary {
    pub(crate) estimate: Vec<f64>,
    pub(crate) lower: Vec<f64>,
    pub(crate) upper: Vec<f64>,
}

impl Summary {
    pub(crate) fn push(&mut self, interval: &Interval, column: ArrayView1<f64>) {
        let values = column.to_vec();
        let (lower, upper) = interval.bounds(&values);
        self.estimate.push(mean(&values));
        self.lower.push(lower);
        self.upper.push(upper);
    }

    pub(crate) fn extend(&mut self, other: Summary) {
        self.estimate.extend(other.estimate);
        self.lower.extend(other.lower);
        self.upper.extend(other.upper);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn hdi_picks_the_narrowest_window() {
        let samples = [0.0, 1.0, 1.1, 1.2, 1.3, 5.0];
        // floor(0.5 * 6) = 3 steps wide
        assert_eq!(hdi(&samples, 0.5), (1.0, 1.3));
    }

    #[test]
    fn interval_column_names() {
        let interval = Interval::new(0.94, true).unwrap();
        assert_eq!(interval.lower_name(), "lower_3.0%");
        assert_eq!(interval.upper_name(), "upper_97.0%");
        let interval = Interval::new(0.5, false).unwrap();
        assert_eq!(interval.lower_name(), "lower_25.0%");
        assert_eq!(interval.upper_name(), "upper_75.0%");
    }

    #[test]
    fn probability_must_be_inside_the_unit_interval() {
        assert!(matches!(Interval::new(1.0, true), Err(ModelError::Probability(_))));
        assert!(matches!(Interval::new(0.0, false), Err(ModelError::Probability(_))));
    }

    #[test]
    fn summary_by_column() {
        let draws = array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0]];
        let summary = Interval::new(0.5, false).unwrap().summarize(&draws);
        assert_eq!(summary.estimate, vec![2.0, 20.0]);
        assert_relative_eq!(summary.lower[0], 1.5);
        assert_relative_eq!(summary.upper[1], 25.0);
    }

    proptest! {
        #[test]
        fn intervals_are_ordered_and_inside_the_sample(
            samples in prop::collection::vec(-100f64..100f64, 1..200),
            prob in 0.05f64..0.95,
        ) {
            let lo = samples.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            for (a, b) in [hdi(&samples, prob), quantile_interval(&samples, 0.1, 0.9)] {
                prop_assert!(a <= b);
                prop_assert!(a >= lo && b <= hi);
            }
        }
    }
}
