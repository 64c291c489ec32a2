use crate::model::{ClientCommand, RealtimeEvent};
use crate::AppState;
use actix_web::{web, HttpRequest, Responder};
use actix_ws::Message;
use futures_util::StreamExt;
use serde::Deserialize;
use std::collections::HashSet;
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub device_id: Option<String>,
}

/// Device rooms joined by one dashboard connection.
#[derive(Debug, Default)]
pub struct Subscriptions {
    devices: HashSet<String>,
}

impl Subscriptions {
    pub fn join(&mut self, device_id: &str) -> bool {
        let id = device_id.trim();
        !id.is_empty() && self.devices.insert(id.to_string())
    }

    pub fn leave(&mut self, device_id: &str) -> bool {
        self.devices.remove(device_id.trim())
    }

    pub fn wants(&self, event: &RealtimeEvent) -> bool {
        self.devices.contains(event.device_id())
    }

    /// Applies a text frame from the client. Unknown frames are ignored.
    pub fn apply(&mut self, text: &str) -> Option<&'static str> {
        let cmd = serde_json::from_str::<ClientCommand>(text).ok()?;
        let device_id = cmd.device_id?;
        match cmd.action.as_str() {
            "joinDevice" if self.join(&device_id) => Some("joined"),
            "leaveDevice" if self.leave(&device_id) => Some("left"),
            _ => None,
        }
    }
}

/// **GET /ws?deviceId=...**
///
/// Pushes `reading` and `inference` events for the joined devices.
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<WsQuery>,
    data: web::Data<AppState>,
) -> Result<impl Responder, actix_web::Error> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;
    let mut rx = data.monitor.subscribe();

    let mut subs = Subscriptions::default();
    if let Some(id) = &query.device_id {
        subs.join(id);
    }

    actix_rt::spawn(async move {
        loop {
            tokio::select! {
                val = msg_stream.next() => {
                    match val {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(change) = subs.apply(&text) {
                                tracing::debug!(change, "dashboard subscription updated");
                            } else {
                                tracing::debug!(frame = %text, "ignored websocket frame");
                            }
                        }
                        Some(Ok(Message::Ping(bytes))) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(reason))) => {
                            let _ = session.close(reason).await;
                            return;
                        }
                        Some(Err(e)) => {
                            tracing::debug!(error = %e, "websocket protocol error");
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }
                val = rx.recv() => {
                    match val {
                        Ok(event) if subs.wants(&event) => {
                            let Ok(json) = serde_json::to_string(&event) else { continue };
                            if session.text(json).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "dashboard client lagging; events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        let _ = session.close(None).await;
    });

    Ok(res)
}
