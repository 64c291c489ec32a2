//! Rule-based fall detection.
//!
//! A fall looks like: optional free-fall dip, an impact spike with an angular
//! jolt, then the wearer lying still in a new orientation. `FallDetector`
//! checks those stages over the last second of derived samples kept in a
//! device's `DeviceAnalysisState`.

use crate::buffer::DeviceAnalysisState;
use crate::model::G;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub sample_rate_hz: u32,
    /// Length of the derived-series window (seconds).
    pub window_secs: f64,

    pub freefall_acc: f64,
    pub impact_acc: f64,
    /// Max |mean_acc - 1g| after impact, in m/s².
    pub still_acc_eps: f64,
    pub gyro_spike_dps: f64,
    pub gyro_still_dps: f64,
    pub orient_delta_deg: f64,
    /// Extra peak above `impact_acc` that substitutes for a free-fall dip.
    pub impact_margin: f64,

    pub impact_neighbor_ms: u32,
    pub post_still_ms: u32,
    pub orient_window_ms: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 50,
            window_secs: 1.0,
            freefall_acc: 0.5 * G,
            impact_acc: 2.6 * G,
            still_acc_eps: 0.9,
            gyro_spike_dps: 200.0,
            gyro_still_dps: 20.0,
            orient_delta_deg: 45.0,
            impact_margin: 0.4 * G,
            impact_neighbor_ms: 200,
            post_still_ms: 600,
            orient_window_ms: 300,
        }
    }
}

impl DetectorConfig {
    pub fn with_sample_rate(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz: sample_rate_hz.max(1),
            ..Default::default()
        }
    }

    fn samples_for_ms(&self, ms: u32) -> usize {
        (f64::from(ms) / 1000.0 * f64::from(self.sample_rate_hz)).round() as usize
    }

    /// Derived-series window length in samples.
    pub fn window_samples(&self) -> usize {
        ((self.window_secs * f64::from(self.sample_rate_hz)).round() as usize).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoFallReason {
    WarmingUp,
    NoImpact,
    PatternNotMet,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FallStats {
    pub max_acc: f64,
    pub pre_min_acc: f64,
    pub has_free_fall: bool,
    pub max_gyro: f64,
    pub mean_acc_post: f64,
    pub mean_gyro_post: f64,
    pub delta_orient: f64,
    pub impact_index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallVerdict {
    pub fall: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NoFallReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FallStats>,
}

impl FallVerdict {
    fn no_fall(reason: NoFallReason, stats: Option<FallStats>) -> Self {
        Self {
            fall: false,
            reason: Some(reason),
            stats,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FallDetector {
    config: DetectorConfig,
}

impl FallDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Classifies the device's current window. Does not mutate `state`.
    pub fn classify(&self, state: &DeviceAnalysisState) -> FallVerdict {
        if !state.detector_ready() {
            return FallVerdict::no_fall(NoFallReason::WarmingUp, None);
        }
        let w = state.derived();
        self.classify_series(&w.acc, &w.gyro, &w.pitch, &w.roll)
    }

    /// Same as `classify` over already chronological series of equal length.
    pub fn classify_series(&self, acc: &[f64], gyro: &[f64], pitch: &[f64], roll: &[f64]) -> FallVerdict {
        let c = &self.config;
        let n = acc.len().min(gyro.len()).min(pitch.len()).min(roll.len());
        if n == 0 {
            return FallVerdict::no_fall(NoFallReason::WarmingUp, None);
        }
        let last = n - 1;

        // 1) impact peak
        let mut max_acc = f64::NEG_INFINITY;
        let mut impact = None;
        for (k, &a) in acc[..n].iter().enumerate() {
            if a > max_acc {
                max_acc = a;
                impact = Some(k);
            }
        }
        let impact = match impact {
            Some(k) if max_acc >= c.impact_acc => k,
            _ => return FallVerdict::no_fall(NoFallReason::NoImpact, None),
        };

        let neighbor = c.samples_for_ms(c.impact_neighbor_ms);
        let post_still = c.samples_for_ms(c.post_still_ms);
        let orient = c.samples_for_ms(c.orient_window_ms);

        // 2) free-fall dip just before impact
        let pre_start = impact.saturating_sub(neighbor);
        let pre_end = impact.saturating_sub(1);
        let pre_min_acc = acc[pre_start..=pre_end]
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let has_free_fall = pre_min_acc < c.freefall_acc;

        // 3) angular jolt around impact
        let g_end = (impact + neighbor).min(last);
        let max_gyro = gyro[pre_start..=g_end]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        let has_gyro_spike = max_gyro > c.gyro_spike_dps;

        // 4) stillness after impact
        let post_start = (impact + 1).min(last);
        let post_end = (impact + post_still).min(last);
        let mean_acc_post = mean(&acc[post_start..=post_end]).unwrap_or(f64::INFINITY);
        let mean_gyro_post = mean(&gyro[post_start..=post_end]).unwrap_or(f64::INFINITY);
        let acc_is_still = (mean_acc_post - G).abs() < c.still_acc_eps;
        let gyro_is_still = mean_gyro_post < c.gyro_still_dps;

        // 5) orientation before vs after
        let pre_orient_start = impact.saturating_sub(orient);
        let post_orient_end = (impact + orient).min(last);
        let pre_pitch = mean_or_zero(pitch, pre_orient_start, pre_end);
        let pre_roll = mean_or_zero(roll, pre_orient_start, pre_end);
        let post_pitch = mean_or_zero(pitch, post_start, post_orient_end);
        let post_roll = mean_or_zero(roll, post_start, post_orient_end);
        let delta_orient = (post_pitch - pre_pitch).abs().max((post_roll - pre_roll).abs());
        let has_orient_change = delta_orient >= c.orient_delta_deg;

        let stats = FallStats {
            max_acc,
            pre_min_acc,
            has_free_fall,
            max_gyro,
            mean_acc_post,
            mean_gyro_post,
            delta_orient,
            impact_index: impact,
        };

        let fall = has_gyro_spike
            && acc_is_still
            && gyro_is_still
            && has_orient_change
            && (has_free_fall || max_acc > c.impact_acc + c.impact_margin);

        if fall {
            FallVerdict {
                fall: true,
                reason: None,
                stats: Some(stats),
            }
        } else {
            FallVerdict::no_fall(NoFallReason::PatternNotMet, Some(stats))
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Mean of `buf[a..=b]`, 0 for an empty range.
fn mean_or_zero(buf: &[f64], a: usize, b: usize) -> f64 {
    if b < a {
        return 0.0;
    }
    mean(&buf[a..=b]).unwrap_or(0.0)
}
