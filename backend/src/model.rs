use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Standard gravity (m/s²).
pub const G: f64 = 9.81;

// 1. INPUT: one IMU sample (accel in m/s², gyro in deg/s)
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq)]
pub struct ImuSample {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
}

impl ImuSample {
    pub fn new(accel: [f64; 3], gyro: [f64; 3]) -> Self {
        Self {
            ax: accel[0],
            ay: accel[1],
            az: accel[2],
            gx: gyro[0],
            gy: gyro[1],
            gz: gyro[2],
        }
    }

    /// Resultant acceleration (m/s²).
    pub fn acc_magnitude(&self) -> f64 {
        mag3(self.ax, self.ay, self.az)
    }

    /// Resultant angular rate (deg/s).
    pub fn gyro_magnitude(&self) -> f64 {
        mag3(self.gx, self.gy, self.gz)
    }

    /// Pitch and roll in degrees, estimated from the gravity vector.
    pub fn pitch_roll(&self) -> (f64, f64) {
        let (ax, ay, az) = (self.ax, self.ay, self.az);
        let pitch = ay.atan2((ax * ax + az * az).sqrt()).to_degrees();
        let roll = (-ax).atan2(az).to_degrees();
        (pitch, roll)
    }
}

pub fn mag3(x: f64, y: f64, z: f64) -> f64 {
    (x * x + y * y + z * z).sqrt()
}

// 2. INPUT: device batch posted to /api/readings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ReadingBatch {
    pub device_id: String,
    /// Device clock, epoch milliseconds.
    pub ts: i64,
    #[serde(default)]
    pub hr: Option<f64>,
    #[serde(default)]
    pub spo2: Option<f64>,
    #[serde(default)]
    pub flags: Option<VitalFlags>,
    #[serde(default)]
    pub imu: Option<Vec<ImuSample>>,
}

/// Threshold flags computed on the device itself.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VitalFlags {
    #[serde(default)]
    pub hr_low: bool,
    #[serde(default)]
    pub hr_high: bool,
    #[serde(default)]
    pub spo2_low: bool,
}

/// Sanitised vitals. A value of 0 means "no reading".
#[derive(Debug, Serialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VitalsReading {
    pub hr: f64,
    pub spo2: f64,
    pub flags: VitalFlags,
}

// 3. ALERTS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertRule {
    Fall,
    HrLow,
    HrHigh,
    Spo2Low,
    Spo2High,
    Custom,
}

impl AlertRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertRule::Fall => "fall",
            AlertRule::HrLow => "hrLow",
            AlertRule::HrHigh => "hrHigh",
            AlertRule::Spo2Low => "spo2Low",
            AlertRule::Spo2High => "spo2High",
            AlertRule::Custom => "custom",
        }
    }

    /// Label used in email subjects and headings.
    pub fn label(&self) -> &'static str {
        match self {
            AlertRule::Fall => "FALL",
            AlertRule::HrLow => "LOW HEART RATE",
            AlertRule::HrHigh => "HIGH HEART RATE",
            AlertRule::Spo2Low => "LOW SpO₂",
            AlertRule::Spo2High => "HIGH SpO₂",
            AlertRule::Custom => "ALERT",
        }
    }
}

impl fmt::Display for AlertRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fall" => Ok(AlertRule::Fall),
            "hrLow" => Ok(AlertRule::HrLow),
            "hrHigh" => Ok(AlertRule::HrHigh),
            "spo2Low" => Ok(AlertRule::Spo2Low),
            "spo2High" => Ok(AlertRule::Spo2High),
            "custom" => Ok(AlertRule::Custom),
            other => Err(format!("unknown alert rule '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Free-form context attached to an alert and echoed into emails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// "rule" | "ml" | "device" | "button"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryChannel {
    Email,
}

/// Per-channel delivery state, written once after the attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DeliveryRecord {
    pub fn is_settled(&self) -> bool {
        self.sent || self.error.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Sent { at: DateTime<Utc> },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub device_id: String,
    pub rule: AlertRule,
    pub value: Option<f64>,
    pub severity: Severity,
    pub message: String,
    /// Event time as reported by the producer.
    pub ts: DateTime<Utc>,
    pub meta: AlertMeta,
    /// Server receipt time; the dedup cooldown is keyed on this.
    pub created_at: DateTime<Utc>,
    pub email: DeliveryRecord,
}

/// An alert that has not yet been through dedup.
#[derive(Debug, Clone)]
pub struct CandidateAlert {
    pub device_id: String,
    pub rule: AlertRule,
    pub value: Option<f64>,
    pub ts: DateTime<Utc>,
    pub meta: AlertMeta,
}

impl CandidateAlert {
    pub fn new(device_id: impl Into<String>, rule: AlertRule, value: Option<f64>) -> Self {
        Self {
            device_id: device_id.into(),
            rule,
            value,
            ts: Utc::now(),
            meta: AlertMeta::default(),
        }
    }

    pub fn at(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }

    pub fn with_meta(mut self, meta: AlertMeta) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FanoutOutcome {
    pub ok: bool,
    pub deduped: bool,
    pub id: Uuid,
}

// 4. OUTPUT: realtime events pushed to dashboard subscribers
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum RealtimeEvent {
    #[serde(rename_all = "camelCase")]
    Reading {
        device_id: String,
        ts: DateTime<Utc>,
        hr: f64,
        spo2: f64,
        flags: VitalFlags,
    },
    #[serde(rename_all = "camelCase")]
    Inference {
        device_id: String,
        fall_prob: f64,
        is_fall: bool,
        ts: DateTime<Utc>,
    },
}

impl RealtimeEvent {
    pub fn device_id(&self) -> &str {
        match self {
            RealtimeEvent::Reading { device_id, .. } => device_id,
            RealtimeEvent::Inference { device_id, .. } => device_id,
        }
    }
}

// 5. DATABASE: inference log row
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRecord {
    pub device_id: String,
    pub fall_prob: f64,
    pub is_fall: bool,
    pub ts: DateTime<Utc>,
    pub model_version: String,
    pub source: String,
}

// 6. INPUT: client command (dashboard websocket)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCommand {
    pub action: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

// 7. INPUT: emergency button
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyRequest {
    pub device_id: String,
    pub ts: i64,
    #[serde(default)]
    pub note: Option<String>,
}

/// Converts device epoch milliseconds, falling back to now for nonsense values.
pub fn ts_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}
