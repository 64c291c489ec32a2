//! Runtime settings, read from the environment (after `.env` is loaded).

use crate::error::ConfigError;
use std::collections::HashMap;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub bind_addr: String,
    pub port: u16,

    /// Raw IMU window handed to the feature extractor (100 ≈ 2 s at 50 Hz).
    pub imu_window: usize,
    pub sample_rate_hz: u32,
    pub max_devices: usize,
    pub device_idle_secs: u64,

    pub alert_cooldown_ms: i64,
    pub broadcast_capacity: usize,

    pub ml_service_url: String,
    pub ml_timeout_ms: u64,
    pub fall_prob_threshold: f64,

    pub smtp: SmtpSettings,

    pub hr_low: f64,
    pub hr_high: f64,
    pub spo2_low: f64,
}

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    /// Full `From` header, e.g. `AuraLink <alerts@example.com>`.
    pub from: String,
    pub password: String,
    pub recipients: Vec<String>,
}

impl SmtpSettings {
    /// Login user: the address inside `<...>` of `from`, or `from` itself.
    pub fn username(&self) -> &str {
        match (self.from.find('<'), self.from.rfind('>')) {
            (Some(open), Some(close)) if open < close => self.from[open + 1..close].trim(),
            _ => self.from.trim(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&vars)
    }

    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let database_url = get("DATABASE_URL")
            .ok_or(ConfigError::Missing("DATABASE_URL"))?
            .to_string();

        Ok(Self {
            database_url,
            bind_addr: get("BIND_ADDR").unwrap_or("0.0.0.0").to_string(),
            port: parse_or(vars, "PORT", 8080)?,
            imu_window: parse_or(vars, "IMU_WINDOW", 100)?,
            sample_rate_hz: parse_or(vars, "SAMPLE_RATE_HZ", 50)?,
            max_devices: parse_or(vars, "MAX_DEVICES", 10_000)?,
            device_idle_secs: parse_or(vars, "DEVICE_IDLE_SECS", 3600)?,
            alert_cooldown_ms: parse_or(vars, "ALERT_COOLDOWN_MS", 120_000)?,
            broadcast_capacity: parse_or(vars, "BROADCAST_CAPACITY", 100)?,
            ml_service_url: get("ML_SERVICE_URL")
                .unwrap_or("http://localhost:5001")
                .trim_end_matches('/')
                .to_string(),
            ml_timeout_ms: parse_or(vars, "ML_TIMEOUT_MS", 3000)?,
            fall_prob_threshold: parse_or(vars, "FALL_PROB_THRESHOLD", 0.7)?,
            smtp: SmtpSettings {
                host: get("SMTP_HOST").unwrap_or("smtp.gmail.com").to_string(),
                port: parse_or(vars, "SMTP_PORT", 465)?,
                from: get("ALERT_EMAIL_FROM").unwrap_or("AuraLink <alerts@localhost>").to_string(),
                password: get("ALERT_EMAIL_PASS").unwrap_or_default().to_string(),
                recipients: get("ALERT_EMAIL_TO")
                    .map(|list| {
                        list.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            hr_low: parse_or(vars, "HR_LOW", 50.0)?,
            hr_high: parse_or(vars, "HR_HIGH", 120.0)?,
            spo2_low: parse_or(vars, "SPO2_LOW", 92.0)?,
        })
    }
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key,
            value: raw.to_string(),
        }),
    }
}
