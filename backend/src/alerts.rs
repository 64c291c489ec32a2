//! Alert deduplication and fan-out.
//!
//! A candidate alert for `(device, rule)` is either folded into an alert
//! raised within the cooldown, or persisted and emailed. The persisted row is
//! the dedup key, so a failed email still suppresses repeats until the
//! cooldown expires.

use crate::email::{AlertEmail, EmailSender};
use crate::error::{AppError, DeliveryError};
use crate::model::{
    Alert, AlertRule, CandidateAlert, DeliveryChannel, DeliveryOutcome, DeliveryRecord,
    FanoutOutcome, Severity,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use uuid::Uuid;

pub const DEFAULT_COOLDOWN_MS: i64 = 120_000;

pub fn compute_severity(rule: AlertRule, value: Option<f64>) -> Severity {
    match (rule, value) {
        (AlertRule::Fall, _) => Severity::Critical,
        (AlertRule::Spo2Low, Some(v)) if v <= 88.0 => Severity::Critical,
        (AlertRule::Spo2Low, _) => Severity::High,
        (AlertRule::HrHigh, Some(v)) if v >= 150.0 => Severity::High,
        (AlertRule::HrHigh, _) => Severity::Low,
        (AlertRule::HrLow, Some(v)) if v <= 45.0 => Severity::High,
        (AlertRule::HrLow, _) => Severity::Low,
        _ => Severity::High,
    }
}

pub fn build_message(device_id: &str, rule: AlertRule, value: Option<f64>, severity: Severity) -> String {
    let v = value.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_string());
    let body = match rule {
        AlertRule::Fall => "Fall detected".to_string(),
        AlertRule::HrLow => format!("Low heart rate: {} bpm", v),
        AlertRule::HrHigh => format!("High heart rate: {} bpm", v),
        AlertRule::Spo2Low => format!("Low SpO₂: {}%", v),
        AlertRule::Spo2High => format!("High SpO₂: {}%", v),
        AlertRule::Custom => format!("Alert value: {}", v),
    };
    format!("[{}] {} for {}", severity.as_str().to_uppercase(), body, device_id)
}

/// Result of an atomic find-or-create.
#[derive(Debug, Clone)]
pub enum Recorded {
    Created(Alert),
    Existing(Uuid),
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Newest alert for `(device_id, rule)` created at or after `since`.
    async fn find_recent(
        &self,
        device_id: &str,
        rule: AlertRule,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>, AppError>;

    async fn create(&self, alert: &Alert) -> Result<Alert, AppError>;

    /// Records the outcome for one channel; later calls for the same
    /// alert and channel are ignored.
    async fn mark_delivery(
        &self,
        id: Uuid,
        channel: DeliveryChannel,
        outcome: &DeliveryOutcome,
    ) -> Result<(), AppError>;

    /// Inserts `alert` unless one for the same key exists since `since`.
    ///
    /// The default is only atomic under the engine's in-process key lock;
    /// stores shared between processes should override it.
    async fn create_unless_recent(
        &self,
        alert: &Alert,
        since: DateTime<Utc>,
    ) -> Result<Recorded, AppError> {
        if let Some(existing) = self.find_recent(&alert.device_id, alert.rule, since).await? {
            return Ok(Recorded::Existing(existing.id));
        }
        Ok(Recorded::Created(self.create(alert).await?))
    }
}

/// Async mutex per key. Entries are dropped once nobody holds or waits on them.
pub struct KeyedLocks<K> {
    map: parking_lot::Mutex<HashMap<K, LockSlot>>,
}

struct LockSlot {
    cell: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters, only changed under the map lock.
    users: usize,
}

pub struct KeyGuard<'a, K: Eq + Hash> {
    locks: &'a KeyedLocks<K>,
    key: K,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub fn new() -> Self {
        Self {
            map: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub async fn lock(&self, key: K) -> KeyGuard<'_, K> {
        let cell = {
            let mut map = self.map.lock();
            let slot = map.entry(key.clone()).or_insert_with(|| LockSlot {
                cell: Arc::default(),
                users: 0,
            });
            slot.users += 1;
            slot.cell.clone()
        };
        // Registered before the await: a cancelled waiter still deregisters.
        let mut held = KeyGuard {
            locks: self,
            key,
            guard: None,
        };
        held.guard = Some(cell.lock_owned().await);
        held
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> Drop for KeyGuard<'_, K> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.map.lock();
        if let Some(slot) = map.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                map.remove(&self.key);
            }
        }
    }
}

pub struct AlertEngine {
    store: Arc<dyn AlertStore>,
    mailer: Arc<dyn EmailSender>,
    recipients: Vec<String>,
    cooldown: Duration,
    locks: KeyedLocks<(String, AlertRule)>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn AlertStore>,
        mailer: Arc<dyn EmailSender>,
        recipients: Vec<String>,
        cooldown_ms: i64,
    ) -> Self {
        Self {
            store,
            mailer,
            recipients,
            cooldown: Duration::milliseconds(cooldown_ms.max(0)),
            locks: KeyedLocks::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub async fn fanout(&self, candidate: CandidateAlert) -> Result<FanoutOutcome, AppError> {
        self.fanout_at(candidate, Utc::now()).await
    }

    /// `now` is the server receipt time; cooldowns are measured against it.
    pub async fn fanout_at(
        &self,
        candidate: CandidateAlert,
        now: DateTime<Utc>,
    ) -> Result<FanoutOutcome, AppError> {
        let key = (candidate.device_id.clone(), candidate.rule);
        let since = now - self.cooldown;

        let recorded = {
            let _guard = self.locks.lock(key).await;
            let alert = new_alert(candidate, now);
            self.store.create_unless_recent(&alert, since).await?
        };

        match recorded {
            Recorded::Existing(id) => {
                tracing::debug!(alert_id = %id, "alert suppressed by cooldown");
                Ok(FanoutOutcome {
                    ok: true,
                    deduped: true,
                    id,
                })
            }
            Recorded::Created(alert) => self.notify(alert).await,
        }
    }

    /// Persists and emails without the cooldown check. Later candidates for
    /// the same key still dedup against the stored row.
    pub async fn fanout_immediate(&self, candidate: CandidateAlert) -> Result<FanoutOutcome, AppError> {
        let alert = new_alert(candidate, Utc::now());
        let alert = self.store.create(&alert).await?;
        self.notify(alert).await
    }

    async fn notify(&self, alert: Alert) -> Result<FanoutOutcome, AppError> {
        tracing::info!(
            alert_id = %alert.id,
            device_id = %alert.device_id,
            rule = %alert.rule,
            severity = %alert.severity,
            "alert raised"
        );

        match self.deliver(&alert).await {
            Ok(()) => {
                self.store
                    .mark_delivery(alert.id, DeliveryChannel::Email, &DeliveryOutcome::Sent { at: Utc::now() })
                    .await?;
                Ok(FanoutOutcome {
                    ok: true,
                    deduped: false,
                    id: alert.id,
                })
            }
            Err(e) => {
                tracing::warn!(alert_id = %alert.id, error = %e, "alert email failed");
                let failed = DeliveryOutcome::Failed { error: e.to_string() };
                if let Err(mark_err) = self.store.mark_delivery(alert.id, DeliveryChannel::Email, &failed).await {
                    tracing::error!(alert_id = %alert.id, error = %mark_err, "could not record delivery failure");
                }
                Err(AppError::Delivery {
                    alert_id: alert.id,
                    source: e,
                })
            }
        }
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), DeliveryError> {
        if self.recipients.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }
        let email = AlertEmail::render(alert);
        self.mailer.send(&self.recipients, &email.subject, &email.html).await
    }

    #[cfg(test)]
    pub(crate) fn pending_locks(&self) -> usize {
        self.locks.len()
    }
}

fn new_alert(candidate: CandidateAlert, now: DateTime<Utc>) -> Alert {
    let severity = compute_severity(candidate.rule, candidate.value);
    Alert {
        id: Uuid::new_v4(),
        message: build_message(&candidate.device_id, candidate.rule, candidate.value, severity),
        device_id: candidate.device_id,
        rule: candidate.rule,
        value: candidate.value,
        severity,
        ts: candidate.ts,
        meta: candidate.meta,
        created_at: now,
        email: DeliveryRecord::default(),
    }
}
