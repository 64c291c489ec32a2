//! Vital-sign sanity clamping and threshold rules.

use crate::model::{AlertRule, VitalFlags, VitalsReading};
use std::collections::{BTreeSet, HashMap};

pub const HR_VALID: (f64, f64) = (30.0, 220.0);
pub const SPO2_VALID: (f64, f64) = (70.0, 100.0);

/// Clamps out-of-range (or missing) vitals to 0, meaning "no reading".
pub fn sanitize_vitals(hr: Option<f64>, spo2: Option<f64>, flags: Option<VitalFlags>) -> VitalsReading {
    let clamp = |v: Option<f64>, (lo, hi): (f64, f64)| match v {
        Some(v) if v >= lo && v <= hi => v,
        _ => 0.0,
    };
    VitalsReading {
        hr: clamp(hr, HR_VALID),
        spo2: clamp(spo2, SPO2_VALID),
        flags: flags.unwrap_or_default(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VitalBounds {
    pub hr_low: f64,
    pub hr_high: f64,
    pub spo2_low: f64,
    pub spo2_high: Option<f64>,
}

impl Default for VitalBounds {
    fn default() -> Self {
        Self {
            hr_low: 50.0,
            hr_high: 120.0,
            spo2_low: 92.0,
            spo2_high: None,
        }
    }
}

/// A rule that fired, with the reading that fired it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleTrigger {
    pub rule: AlertRule,
    pub value: f64,
}

impl Eq for RuleTrigger {}

impl Ord for RuleTrigger {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rule
            .cmp(&other.rule)
            .then(self.value.total_cmp(&other.value))
    }
}

impl PartialOrd for RuleTrigger {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default)]
pub struct VitalsEvaluator {
    defaults: VitalBounds,
    per_device: HashMap<String, VitalBounds>,
}

impl VitalsEvaluator {
    pub fn new(defaults: VitalBounds) -> Self {
        Self {
            defaults,
            per_device: HashMap::new(),
        }
    }

    pub fn with_device_bounds(mut self, device_id: impl Into<String>, bounds: VitalBounds) -> Self {
        self.per_device.insert(device_id.into(), bounds);
        self
    }

    pub fn bounds_for(&self, device_id: &str) -> VitalBounds {
        self.per_device.get(device_id).copied().unwrap_or(self.defaults)
    }

    /// Triggers for one sanitised reading. Device flags are honoured, but a
    /// zero (absent) value never triggers anything.
    pub fn evaluate(&self, device_id: &str, reading: &VitalsReading) -> BTreeSet<RuleTrigger> {
        let b = self.bounds_for(device_id);
        let mut out = BTreeSet::new();

        if reading.hr > 0.0 {
            if reading.hr < b.hr_low || reading.flags.hr_low {
                out.insert(RuleTrigger { rule: AlertRule::HrLow, value: reading.hr });
            }
            if reading.hr > b.hr_high || reading.flags.hr_high {
                out.insert(RuleTrigger { rule: AlertRule::HrHigh, value: reading.hr });
            }
        }
        if reading.spo2 > 0.0 {
            if reading.spo2 < b.spo2_low || reading.flags.spo2_low {
                out.insert(RuleTrigger { rule: AlertRule::Spo2Low, value: reading.spo2 });
            }
            if matches!(b.spo2_high, Some(hi) if reading.spo2 > hi) {
                out.insert(RuleTrigger { rule: AlertRule::Spo2High, value: reading.spo2 });
            }
        }
        out
    }
}
