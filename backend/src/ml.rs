//! Client for the external fall-probability service.
//!
//! Contract: `POST {base}/predict` with `{"input": [38 floats]}`, answered by
//! `{"fallProb": [[probability, label], ...]}`. Only the first pair is used.

use crate::error::InferenceError;
use crate::features::FeatureVector;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub fall_prob: f64,
    pub label: String,
}

#[async_trait]
pub trait FallPredictor: Send + Sync {
    async fn predict(&self, features: &FeatureVector) -> Result<Prediction, InferenceError>;

    fn model_version(&self) -> &str {
        "v1"
    }
}

pub struct HttpFallPredictor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpFallPredictor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/predict", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl FallPredictor for HttpFallPredictor {
    async fn predict(&self, features: &FeatureVector) -> Result<Prediction, InferenceError> {
        let res = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "input": features.to_vec() }))
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            return Err(InferenceError::Status(status.as_u16()));
        }
        let body: Value = res.json().await?;
        parse_prediction(body)
    }
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(rename = "fallProb")]
    fall_prob: Vec<(f64, Value)>,
}

pub fn parse_prediction(body: Value) -> Result<Prediction, InferenceError> {
    let parsed: PredictResponse =
        serde_json::from_value(body).map_err(|e| InferenceError::Malformed(e.to_string()))?;
    let (prob, label) = parsed
        .fall_prob
        .into_iter()
        .next()
        .ok_or_else(|| InferenceError::Malformed("empty fallProb".to_string()))?;

    if !prob.is_finite() || !(0.0..=1.0).contains(&prob) {
        return Err(InferenceError::Malformed(format!("probability {} out of range", prob)));
    }
    let label = match label {
        Value::String(s) => s,
        other => other.to_string(),
    };
    Ok(Prediction { fall_prob: prob, label })
}
