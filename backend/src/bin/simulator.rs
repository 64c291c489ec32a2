use auralink_backend::model::{ImuSample, ReadingBatch, G};
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use std::env;
use std::error::Error;
use tokio::time::{sleep, Duration};

const RATE_HZ: usize = 50;
const BATCH: usize = 25;

/// Walking: ~1 g with a small vertical bounce and noisy gyro.
fn walking(rng: &mut impl Rng, t: usize) -> ImuSample {
    let phase = t as f64 / RATE_HZ as f64 * std::f64::consts::TAU * 1.8;
    let bounce = 0.15 * G * phase.sin();
    ImuSample::new(
        [
            rng.gen_range(-0.4..0.4),
            rng.gen_range(-0.4..0.4),
            G + bounce,
        ],
        [
            rng.gen_range(-15.0..15.0),
            rng.gen_range(-15.0..15.0),
            rng.gen_range(-8.0..8.0),
        ],
    )
}

/// Scripted fall: free fall, impact, then lying on the side.
fn fall_sequence(rng: &mut impl Rng) -> Vec<ImuSample> {
    let mut out = Vec::new();
    for _ in 0..8 {
        out.push(ImuSample::new([0.3, 0.2, 0.3 * G], [60.0, 40.0, 10.0]));
    }
    out.push(ImuSample::new([0.8 * G, 1.2 * G, 2.9 * G], [320.0, 180.0, 40.0]));
    let tilt = 75f64.to_radians();
    for _ in 0..(RATE_HZ * 2) {
        out.push(ImuSample::new(
            [
                rng.gen_range(-0.05..0.05),
                G * tilt.sin(),
                G * tilt.cos(),
            ],
            [
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
            ],
        ));
    }
    out
}

async fn post(client: &reqwest::Client, base: &str, batch: &ReadingBatch) -> Result<Value, Box<dyn Error>> {
    let res = client
        .post(format!("{}/api/readings", base))
        .json(batch)
        .send()
        .await?
        .error_for_status()?;
    Ok(res.json().await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let base = env::var("SERVER_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "sim-001".to_string());
    let client = reqwest::Client::new();
    let mut rng = rand::thread_rng();

    println!("🔌 Streaming {} to {} at {} Hz", device_id, base, RATE_HZ);

    // 1. Normal walking, ~4 s
    let mut samples: Vec<ImuSample> = (0..RATE_HZ * 4).map(|t| walking(&mut rng, t)).collect();
    // 2. The fall
    println!("⚠️ SIMULATING FALL EVENT!");
    samples.extend(fall_sequence(&mut rng));

    for (i, chunk) in samples.chunks(BATCH).enumerate() {
        let batch = ReadingBatch {
            device_id: device_id.clone(),
            ts: Utc::now().timestamp_millis(),
            hr: Some(rng.gen_range(68.0..84.0)),
            spo2: Some(rng.gen_range(95.0..99.0)),
            flags: None,
            imu: Some(chunk.to_vec()),
        };
        let reply = post(&client, &base, &batch).await?;
        let fall = reply["fall"]["fall"].as_bool().unwrap_or(false);
        println!("🚶 batch {:>3}: {} samples, rule fall = {}", i + 1, chunk.len(), fall);
        sleep(Duration::from_millis((BATCH * 1000 / RATE_HZ) as u64)).await;
    }

    // 3. Ask the model
    let eval: Value = client
        .get(format!("{}/api/model-eval/{}", base, device_id))
        .send()
        .await?
        .json()
        .await?;
    println!("🧠 model-eval: {}", eval);
    println!("🛑 Simulation Finished.");
    Ok(())
}
