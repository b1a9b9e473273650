/// Mean of a series of runs, with the spread of the runs around it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spread {
    pub mean: f64,
    /// Population standard deviation, relative to the mean, in percent.
    pub stddev_percent: f64,
}

/// Computes the mean, then the population variance `Σ(x-mean)²/N`,
/// and reports the standard deviation as a percentage of the mean.
///
/// Every quantity of the report (energy, EDP, wall time) goes through this function.
pub fn mean_and_stddev_percent(values: &[f64]) -> Spread {
    if values.is_empty() {
        return Spread {
            mean: 0.0,
            stddev_percent: 0.0,
        };
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    let stddev_percent = if mean == 0.0 { 0.0 } else { stddev / mean * 100.0 };
    Spread { mean, stddev_percent }
}
