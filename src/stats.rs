use serde::{Deserialize, Serialize};

/// Running mean and variance (Welford's algorithm).
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    n_vals: usize,
    mean: f64,
    diff_2_sum: f64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorReport {
    pub n_vals: usize,
    /// Undefined without values.
    pub mean: Option<f64>,
    /// Undefined with fewer than two values.
    pub std_dev: Option<f64>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, val: f64) {
        self.n_vals += 1;

        let diff_a = val - self.mean;
        self.mean += diff_a / self.n_vals as f64;

        let diff_b = val - self.mean;
        self.diff_2_sum += diff_a * diff_b;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.n_vals > 0).then_some(self.mean)
    }

    pub fn report(&self) -> AccumulatorReport {
        AccumulatorReport {
            n_vals: self.n_vals,
            mean: self.mean(),
            std_dev: (self.n_vals > 1)
                .then(|| (self.diff_2_sum / (self.n_vals as f64 - 1.0)).sqrt()),
        }
    }
}

/// Distribution of an observable over an ensemble of runs.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub n_vals: usize,
    pub mean: f64,
    pub median: f64,
    pub q_0025: f64,
    pub q_0250: f64,
    pub q_0750: f64,
    pub q_0975: f64,
    pub std_dev: Option<f64>,
}

impl Summary {
    /// Summarize a set of values. Returns `None` without values.
    pub fn from_values(vals: &[f64]) -> Option<Self> {
        if vals.is_empty() {
            return None;
        }

        let mut sorted = vals.to_vec();
        sorted.sort_by(f64::total_cmp);

        let mut acc = Accumulator::new();
        vals.iter().for_each(|&val| acc.add(val));
        let report = acc.report();

        Some(Self {
            n_vals: vals.len(),
            mean: report.mean?,
            median: quantile(&sorted, 0.5),
            q_0025: quantile(&sorted, 0.025),
            q_0250: quantile(&sorted, 0.25),
            q_0750: quantile(&sorted, 0.75),
            q_0975: quantile(&sorted, 0.975),
            std_dev: report.std_dev,
        })
    }
}

/// Quantile of sorted, non-empty values with linear interpolation between ranks.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}
