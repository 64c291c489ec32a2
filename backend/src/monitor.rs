//! Ingestion and evaluation pipeline.
//!
//! `Monitor` ties the pieces together: readings go in, buffers and the rule
//! detector update, threshold and fall alerts go through the fan-out engine,
//! and realtime events go out on the broadcast channel.

use crate::alerts::AlertEngine;
use crate::buffer::DeviceRegistry;
use crate::detector::{FallDetector, FallVerdict};
use crate::error::AppError;
use crate::features::extract_features;
use crate::ml::FallPredictor;
use crate::model::{
    ts_from_millis, AlertMeta, AlertRule, CandidateAlert, EmergencyRequest, FanoutOutcome,
    InferenceRecord, ReadingBatch, RealtimeEvent, VitalsReading, G,
};
use crate::store::ReadingStore;
use crate::vitals::{sanitize_vitals, VitalsEvaluator};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const EMERGENCY_NOTE: &str = "EMERGENCY Button Pressed";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub ok: bool,
    pub alerts: Vec<FanoutOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fall: Option<FallVerdict>,
    pub delivery_failures: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fall_prob: Option<f64>,
    pub is_fall: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<FallVerdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert: Option<FanoutOutcome>,
}

impl Evaluation {
    fn not_ready() -> Self {
        Self {
            ready: false,
            message: Some("Not enough IMU data".to_string()),
            fall_prob: None,
            is_fall: false,
            rule: None,
            alert: None,
        }
    }
}

pub struct Monitor {
    registry: DeviceRegistry,
    detector: FallDetector,
    vitals: VitalsEvaluator,
    alerts: AlertEngine,
    readings: Arc<dyn ReadingStore>,
    predictor: Arc<dyn FallPredictor>,
    events: broadcast::Sender<RealtimeEvent>,
    fall_prob_threshold: f64,
}

impl Monitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: DeviceRegistry,
        detector: FallDetector,
        vitals: VitalsEvaluator,
        alerts: AlertEngine,
        readings: Arc<dyn ReadingStore>,
        predictor: Arc<dyn FallPredictor>,
        events: broadcast::Sender<RealtimeEvent>,
        fall_prob_threshold: f64,
    ) -> Self {
        Self {
            registry,
            detector,
            vitals,
            alerts,
            readings,
            predictor,
            events,
            fall_prob_threshold,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub async fn ingest(&self, batch: ReadingBatch) -> Result<IngestOutcome, AppError> {
        let device_id = batch.device_id.trim().to_string();
        if device_id.is_empty() {
            return Err(AppError::BadRequest("deviceId required".to_string()));
        }
        let ts = ts_from_millis(batch.ts);
        let reading = sanitize_vitals(batch.hr, batch.spo2, batch.flags);

        self.readings.insert_reading(&device_id, ts, &reading).await?;

        // Persist before buffering; a failed insert leaves the window untouched.
        let samples = batch.imu.unwrap_or_default();
        let fall = if samples.is_empty() {
            None
        } else {
            self.readings.insert_imu(&device_id, &samples).await?;
            let mut batch_verdict: Option<FallVerdict> = None;
            self.registry.push_each(&device_id, &samples, |state| {
                let verdict = self.detector.classify(state);
                batch_verdict = Some(match batch_verdict.take() {
                    Some(best) => strongest(best, verdict),
                    None => verdict,
                });
            });
            batch_verdict
        };

        let _ = self.events.send(RealtimeEvent::Reading {
            device_id: device_id.clone(),
            ts,
            hr: reading.hr,
            spo2: reading.spo2,
            flags: reading.flags,
        });

        let mut outcome = IngestOutcome {
            ok: true,
            alerts: Vec::new(),
            fall: None,
            delivery_failures: 0,
        };

        for trigger in self.vitals.evaluate(&device_id, &reading) {
            let candidate = CandidateAlert::new(device_id.as_str(), trigger.rule, Some(trigger.value))
                .at(ts)
                .with_meta(vitals_meta(&reading, "device"));
            self.raise(candidate, &mut outcome).await?;
        }

        if let Some(verdict) = &fall {
            if verdict.fall {
                let peak_g = verdict.stats.map(|s| s.max_acc / G);
                tracing::warn!(device_id = %device_id, peak_g = ?peak_g, "🔴 rule detector: fall");
                let candidate = CandidateAlert::new(device_id.as_str(), AlertRule::Fall, peak_g)
                    .at(ts)
                    .with_meta(vitals_meta(&reading, "rule"));
                self.raise(candidate, &mut outcome).await?;
            }
        }
        outcome.fall = fall;
        Ok(outcome)
    }

    /// Model evaluation over the device's current window. The rule detector
    /// runs regardless of model health.
    pub async fn evaluate(&self, device_id: &str) -> Result<Evaluation, AppError> {
        let snapshot = self.registry.inspect(device_id, |state| {
            (
                state.latest_window(),
                state.window_capacity(),
                self.detector.classify(state),
            )
        });
        let (window, capacity, verdict) = match snapshot {
            Some((window, capacity, verdict)) if window.len() >= capacity => (window, capacity, verdict),
            _ => return Ok(Evaluation::not_ready()),
        };
        tracing::debug!(device_id, samples = window.len(), capacity, "evaluating window");

        let features = extract_features(&window);
        let now = Utc::now();

        let prediction = match self.predictor.predict(&features).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "fall model unavailable; rule detector only");
                if verdict.fall {
                    let candidate = CandidateAlert::new(device_id, AlertRule::Fall, None)
                        .at(now)
                        .with_meta(AlertMeta {
                            source: Some("rule".to_string()),
                            ..Default::default()
                        });
                    self.raise_reported(candidate).await?;
                }
                return Err(AppError::Inference(e));
            }
        };

        let is_fall = prediction.fall_prob > self.fall_prob_threshold;
        tracing::info!(
            device_id,
            fall_prob = prediction.fall_prob,
            label = %prediction.label,
            is_fall,
            rule_fall = verdict.fall,
            "inference"
        );

        let _ = self.events.send(RealtimeEvent::Inference {
            device_id: device_id.to_string(),
            fall_prob: prediction.fall_prob,
            is_fall,
            ts: now,
        });

        let record = InferenceRecord {
            device_id: device_id.to_string(),
            fall_prob: prediction.fall_prob,
            is_fall,
            ts: now,
            model_version: self.predictor.model_version().to_string(),
            source: "ml".to_string(),
        };
        if let Err(e) = self.readings.insert_inference(&record).await {
            tracing::error!(device_id, error = %e, "failed to save inference");
        }

        let alert = if is_fall || verdict.fall {
            let source = if is_fall { "ml" } else { "rule" };
            let candidate = CandidateAlert::new(device_id, AlertRule::Fall, Some(prediction.fall_prob))
                .at(now)
                .with_meta(AlertMeta {
                    source: Some(source.to_string()),
                    ..Default::default()
                });
            Some(self.raise_reported(candidate).await?)
        } else {
            None
        };

        Ok(Evaluation {
            ready: true,
            message: None,
            fall_prob: Some(prediction.fall_prob),
            is_fall,
            rule: Some(verdict),
            alert,
        })
    }

    /// Panic button: always stored and emailed, regardless of any fall
    /// cooldown. Delivery errors go to the caller.
    pub async fn emergency(&self, req: EmergencyRequest) -> Result<FanoutOutcome, AppError> {
        let device_id = req.device_id.trim();
        if device_id.is_empty() {
            return Err(AppError::BadRequest("deviceId & ts required".to_string()));
        }
        tracing::warn!(device_id, "🚑 emergency button pressed");
        let note = req.note.unwrap_or_else(|| EMERGENCY_NOTE.to_string());
        let candidate = CandidateAlert::new(device_id, AlertRule::Fall, None)
            .at(ts_from_millis(req.ts))
            .with_meta(AlertMeta {
                note: Some(note),
                source: Some("button".to_string()),
                ..Default::default()
            });
        self.alerts.fanout_immediate(candidate).await
    }

    async fn raise(&self, candidate: CandidateAlert, outcome: &mut IngestOutcome) -> Result<(), AppError> {
        let fanout = self.raise_reported(candidate).await?;
        if !fanout.ok {
            outcome.delivery_failures += 1;
        }
        outcome.alerts.push(fanout);
        Ok(())
    }

    /// Fans out, turning a delivery failure into a non-ok outcome.
    async fn raise_reported(&self, candidate: CandidateAlert) -> Result<FanoutOutcome, AppError> {
        let device_id = candidate.device_id.clone();
        let rule = candidate.rule;
        match self.alerts.fanout(candidate).await {
            Ok(o) => Ok(o),
            Err(AppError::Delivery { alert_id, source }) => {
                tracing::debug!(device_id = %device_id, rule = %rule, alert_id = %alert_id, error = %source, "alert stored but not delivered");
                Ok(FanoutOutcome {
                    ok: false,
                    deduped: false,
                    id: alert_id,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Batch summary of per-sample verdicts: the fall with the highest peak,
/// otherwise the latest verdict.
fn strongest(best: FallVerdict, next: FallVerdict) -> FallVerdict {
    let peak = |v: &FallVerdict| v.stats.map_or(f64::NEG_INFINITY, |s| s.max_acc);
    match (best.fall, next.fall) {
        (true, true) if peak(&next) > peak(&best) => next,
        (true, _) => best,
        _ => next,
    }
}

fn vitals_meta(reading: &VitalsReading, source: &str) -> AlertMeta {
    let present = |v: f64| if v > 0.0 { Some(v) } else { None };
    AlertMeta {
        hr: present(reading.hr),
        spo2: present(reading.spo2),
        note: None,
        source: Some(source.to_string()),
    }
}
