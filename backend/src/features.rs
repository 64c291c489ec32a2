//! Window features for the external fall model.
//!
//! Layout (38 values):
//! `[ax, ay, az, gx, gy, gz] × [mean, std, min, max, mean_abs, energy]`
//! followed by `[max resultant acc, std resultant acc]`.
//! Standard deviations are population (divide by N).

use crate::model::ImuSample;

pub const AXES: [&str; 6] = ["ax", "ay", "az", "gx", "gy", "gz"];
pub const STATS: [&str; 6] = ["mean", "std", "min", "max", "mean_abs", "energy"];
pub const FEATURE_COUNT: usize = AXES.len() * STATS.len() + 2;

pub type FeatureVector = [f64; FEATURE_COUNT];

/// Column names in output order.
pub fn feature_names() -> Vec<String> {
    let mut names: Vec<String> = AXES
        .iter()
        .flat_map(|axis| STATS.iter().map(move |stat| format!("{}_{}", axis, stat)))
        .collect();
    names.push("resultant_max".to_string());
    names.push("resultant_std".to_string());
    names
}

/// Empty input yields zeros.
pub fn extract_features(window: &[ImuSample]) -> FeatureVector {
    let mut out = [0.0; FEATURE_COUNT];
    if window.is_empty() {
        return out;
    }

    let columns: [fn(&ImuSample) -> f64; 6] = [
        |s| s.ax,
        |s| s.ay,
        |s| s.az,
        |s| s.gx,
        |s| s.gy,
        |s| s.gz,
    ];

    let mut column = Vec::with_capacity(window.len());
    for (i, get) in columns.iter().enumerate() {
        column.clear();
        column.extend(window.iter().map(get));
        out[i * 6..i * 6 + 6].copy_from_slice(&axis_stats(&column));
    }

    let resultant: Vec<f64> = window.iter().map(ImuSample::acc_magnitude).collect();
    out[36] = resultant.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    out[37] = population_std(&resultant);
    out
}

fn axis_stats(values: &[f64]) -> [f64; 6] {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = population_std(values);
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean_abs = values.iter().map(|v| v.abs()).sum::<f64>() / n;
    let energy = values.iter().map(|v| v * v).sum::<f64>() / n;
    [mean, std, min, max, mean_abs, energy]
}

fn population_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn vector_has_38_named_columns() {
        assert_eq!(FEATURE_COUNT, 38);
        let names = feature_names();
        assert_eq!(names.len(), 38);
        assert_eq!(names[0], "ax_mean");
        assert_eq!(names[7], "ay_std");
        assert_eq!(names[35], "gz_energy");
        assert_eq!(names[37], "resultant_std");
    }

    #[test]
    fn stats_are_population_statistics() {
        // ax = [1, 3]; everything else constant
        let window = [
            ImuSample::new([1.0, 0.0, 0.0], [-2.0, 0.0, 5.0]),
            ImuSample::new([3.0, 0.0, 0.0], [-2.0, 0.0, 5.0]),
        ];
        let f = extract_features(&window);
        assert!(close(f[0], 2.0)); // mean
        assert!(close(f[1], 1.0)); // population std, not sqrt(2)
        assert!(close(f[2], 1.0));
        assert!(close(f[3], 3.0));
        assert!(close(f[4], 2.0));
        assert!(close(f[5], 5.0)); // (1 + 9) / 2

        // gx block starts at 18
        assert!(close(f[18], -2.0));
        assert!(close(f[19], 0.0));
        assert!(close(f[22], 2.0)); // mean_abs
        assert!(close(f[23], 4.0));

        // resultant = |ax| here
        assert!(close(f[36], 3.0));
        assert!(close(f[37], 1.0));
    }

    #[test]
    fn full_window_is_finite() {
        let window: Vec<ImuSample> = (0..100)
            .map(|i| {
                let t = i as f64 / 50.0;
                ImuSample::new([t.sin(), t.cos(), 9.81], [10.0 * t, 0.0, -3.0])
            })
            .collect();
        let f = extract_features(&window);
        assert_eq!(f.len(), 38);
        assert!(f.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn empty_window_is_all_zero() {
        assert!(extract_features(&[]).iter().all(|v| *v == 0.0));
    }
}
