use crate::error::AppError;
use crate::model::{EmergencyRequest, ReadingBatch};
use crate::websockets::ws_handler;
use crate::AppState;
use actix_web::{web, HttpResponse};

/// **POST /api/readings**
///
/// One device batch: vitals plus an optional IMU chunk. Stores the reading,
/// feeds the device window, and raises any threshold or fall alerts.
pub async fn post_readings(
    data: web::Data<AppState>,
    body: web::Json<ReadingBatch>,
) -> Result<HttpResponse, AppError> {
    let outcome = data.monitor.ingest(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

/// **GET /api/model-eval/{deviceId}**
///
/// Runs the fall model over the device's latest full window.
pub async fn get_model_eval(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let evaluation = data.monitor.evaluate(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(evaluation))
}

/// **POST /api/emergency**
pub async fn post_emergency(
    data: web::Data<AppState>,
    body: web::Json<EmergencyRequest>,
) -> Result<HttpResponse, AppError> {
    let outcome = data.monitor.emergency(body.into_inner()).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/readings", web::post().to(post_readings))
        .route("/api/model-eval/{device_id}", web::get().to(get_model_eval))
        .route("/api/emergency", web::post().to(post_emergency))
        .route("/ws", web::get().to(ws_handler));
}
