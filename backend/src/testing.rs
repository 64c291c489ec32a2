//! In-memory collaborators for tests.

use crate::alerts::AlertStore;
use crate::email::EmailSender;
use crate::error::{AppError, DeliveryError, InferenceError};
use crate::features::FeatureVector;
use crate::ml::{FallPredictor, Prediction};
use crate::model::{
    Alert, AlertRule, DeliveryChannel, DeliveryOutcome, ImuSample, InferenceRecord, VitalsReading,
};
use crate::store::ReadingStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryAlertStore {
    alerts: Mutex<Vec<Alert>>,
    latency: Option<Duration>,
}

impl MemoryAlertStore {
    /// Each call yields for `latency`, widening any check-then-act window.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            latency: Some(latency),
        }
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn get(&self, id: Uuid) -> Option<Alert> {
        self.alerts.lock().iter().find(|a| a.id == id).cloned()
    }

    async fn pause(&self) {
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn find_recent(
        &self,
        device_id: &str,
        rule: AlertRule,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>, AppError> {
        self.pause().await;
        Ok(self
            .alerts
            .lock()
            .iter()
            .filter(|a| a.device_id == device_id && a.rule == rule && a.created_at >= since)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn create(&self, alert: &Alert) -> Result<Alert, AppError> {
        self.pause().await;
        self.alerts.lock().push(alert.clone());
        Ok(alert.clone())
    }

    async fn mark_delivery(
        &self,
        id: Uuid,
        _channel: DeliveryChannel,
        outcome: &DeliveryOutcome,
    ) -> Result<(), AppError> {
        let mut alerts = self.alerts.lock();
        if let Some(a) = alerts.iter_mut().find(|a| a.id == id) {
            if a.email.is_settled() {
                return Ok(());
            }
            match outcome {
                DeliveryOutcome::Sent { at } => {
                    a.email.sent = true;
                    a.email.sent_at = Some(*at);
                }
                DeliveryOutcome::Failed { error } => a.email.error = Some(error.clone()),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
    attempts: Mutex<usize>,
    fail_with: Option<String>,
}

impl RecordingMailer {
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_string()),
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().clone()
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send(&self, to: &[String], subject: &str, html: &str) -> Result<(), DeliveryError> {
        *self.attempts.lock() += 1;
        if let Some(reason) = &self.fail_with {
            return Err(DeliveryError::Transport(reason.clone()));
        }
        self.sent.lock().push(SentMail {
            to: to.to_vec(),
            subject: subject.to_string(),
            html: html.to_string(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryReadingStore {
    pub readings: Mutex<Vec<(String, VitalsReading)>>,
    pub imu: Mutex<Vec<(String, ImuSample)>>,
    pub inferences: Mutex<Vec<InferenceRecord>>,
    imu_fails: bool,
}

impl MemoryReadingStore {
    /// IMU inserts fail as if the pool were exhausted.
    pub fn failing_imu() -> Self {
        Self {
            imu_fails: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ReadingStore for MemoryReadingStore {
    async fn insert_reading(
        &self,
        device_id: &str,
        _ts: DateTime<Utc>,
        reading: &VitalsReading,
    ) -> Result<(), AppError> {
        self.readings.lock().push((device_id.to_string(), *reading));
        Ok(())
    }

    async fn insert_imu(&self, device_id: &str, samples: &[ImuSample]) -> Result<(), AppError> {
        if self.imu_fails {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }
        self.imu
            .lock()
            .extend(samples.iter().map(|s| (device_id.to_string(), *s)));
        Ok(())
    }

    async fn insert_inference(&self, record: &InferenceRecord) -> Result<(), AppError> {
        self.inferences.lock().push(record.clone());
        Ok(())
    }
}

/// Returns a fixed probability, or an HTTP status error when `prob` is None.
pub struct StubPredictor {
    pub prob: Option<f64>,
    pub calls: Mutex<usize>,
}

impl StubPredictor {
    pub fn returning(prob: f64) -> Self {
        Self {
            prob: Some(prob),
            calls: Mutex::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            prob: None,
            calls: Mutex::new(0),
        }
    }
}

#[async_trait]
impl FallPredictor for StubPredictor {
    async fn predict(&self, features: &FeatureVector) -> Result<Prediction, InferenceError> {
        *self.calls.lock() += 1;
        assert_eq!(features.len(), 38);
        match self.prob {
            Some(p) => Ok(Prediction {
                fall_prob: p,
                label: if p > 0.5 { "fall" } else { "no_fall" }.to_string(),
            }),
            None => Err(InferenceError::Status(503)),
        }
    }
}

/// Synthetic fall: upright, one 3.2 g / 250 °/s hit at index 40, then lying
/// still tilted 60° in pitch. 71 samples.
pub fn synthetic_fall() -> Vec<ImuSample> {
    use crate::model::G;
    let mut samples = Vec::with_capacity(71);
    for _ in 0..40 {
        samples.push(ImuSample::new([0.0, 0.0, G], [2.0, 1.0, 0.0]));
    }
    samples.push(ImuSample::new([0.0, 0.0, 3.2 * G], [250.0, 0.0, 0.0]));
    let tilt = 60f64.to_radians();
    for _ in 41..=70 {
        samples.push(ImuSample::new([0.0, G * tilt.sin(), G * tilt.cos()], [3.0, 2.0, 1.0]));
    }
    samples
}
