use actix_web::{web, App, HttpServer};
use auralink_backend::alerts::AlertEngine;
use auralink_backend::buffer::DeviceRegistry;
use auralink_backend::config::Settings;
use auralink_backend::detector::{DetectorConfig, FallDetector};
use auralink_backend::email::SmtpMailer;
use auralink_backend::ml::HttpFallPredictor;
use auralink_backend::monitor::Monitor;
use auralink_backend::store::{self, PgAlertStore, PgReadingStore};
use auralink_backend::vitals::{VitalBounds, VitalsEvaluator};
use auralink_backend::{routes, AppState};
use dotenv::dotenv;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

/// **Application Entry Point**
///
/// Loads settings, connects Postgres, wires the monitor and starts the HTTP
/// server.
#[tokio::main]
async fn main() -> io::Result<()> {
    // 1. Environment + logging
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,actix_web=info")),
        )
        .init();

    let settings = Settings::from_env().map_err(io::Error::other)?;

    // 2. Database (pool + schema)
    let pool = store::connect(&settings.database_url)
        .await
        .map_err(io::Error::other)?;
    store::migrate(&pool).await.map_err(io::Error::other)?;

    // 3. Collaborators
    let mailer = SmtpMailer::new(&settings.smtp).map_err(io::Error::other)?;
    if settings.smtp.recipients.is_empty() {
        tracing::warn!("ALERT_EMAIL_TO is empty; alerts will be stored but not emailed");
    }
    let predictor = HttpFallPredictor::new(
        &settings.ml_service_url,
        Duration::from_millis(settings.ml_timeout_ms),
    )
    .map_err(io::Error::other)?;

    let alerts = AlertEngine::new(
        Arc::new(PgAlertStore::new(pool.clone())),
        Arc::new(mailer),
        settings.smtp.recipients.clone(),
        settings.alert_cooldown_ms,
    );

    let detector = FallDetector::new(DetectorConfig::with_sample_rate(settings.sample_rate_hz));
    let registry = DeviceRegistry::new(
        settings.imu_window,
        detector.config().window_samples(),
        settings.max_devices,
        Duration::from_secs(settings.device_idle_secs),
    );
    let vitals = VitalsEvaluator::new(VitalBounds {
        hr_low: settings.hr_low,
        hr_high: settings.hr_high,
        spo2_low: settings.spo2_low,
        spo2_high: None,
    });

    // 4. Broadcast: drop oldest when a dashboard falls behind
    let (tx, _rx) = broadcast::channel(settings.broadcast_capacity);

    let monitor = Monitor::new(
        registry,
        detector,
        vitals,
        alerts,
        Arc::new(PgReadingStore::new(pool)),
        Arc::new(predictor),
        tx,
        settings.fall_prob_threshold,
    );
    let app_state = web::Data::new(AppState {
        monitor: Arc::new(monitor),
    });

    tracing::info!(
        "🚀 SYSTEM HEALTH: Server started at http://{}:{}",
        settings.bind_addr,
        settings.port
    );

    // 5. HTTP server
    HttpServer::new(move || {
        let cors = actix_cors::Cors::permissive();

        App::new()
            .wrap(cors)
            .app_data(app_state.clone())
            .configure(routes::configure)
    })
    .bind((settings.bind_addr.as_str(), settings.port))?
    .run()
    .await
}
