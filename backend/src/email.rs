//! Email delivery for alerts.

use crate::config::SmtpSettings;
use crate::error::DeliveryError;
use crate::model::{Alert, AlertRule};
use async_trait::async_trait;
use lettre::message::{header::ContentType, Mailbox};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

const PRODUCT: &str = "AuraLink";

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, to: &[String], subject: &str, html: &str) -> Result<(), DeliveryError>;
}

/// SMTP sender. Port 465 uses implicit TLS, anything else STARTTLS.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, DeliveryError> {
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|_| DeliveryError::Address(settings.from.clone()))?;

        let builder = if settings.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
        }
        .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let transport = builder
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username().to_string(),
                settings.password.clone(),
            ))
            .build();

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl EmailSender for SmtpMailer {
    async fn send(&self, to: &[String], subject: &str, html: &str) -> Result<(), DeliveryError> {
        if to.is_empty() {
            return Err(DeliveryError::NoRecipients);
        }
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(subject)
            .header(ContentType::TEXT_HTML);
        for addr in to {
            let mailbox: Mailbox = addr.parse().map_err(|_| DeliveryError::Address(addr.clone()))?;
            builder = builder.to(mailbox);
        }
        let message = builder
            .body(html.to_string())
            .map_err(|e| DeliveryError::Message(e.to_string()))?;

        tracing::debug!(recipients = to.len(), subject, "sending alert email");
        self.transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Rendered subject + HTML body for one alert.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertEmail {
    pub subject: String,
    pub html: String,
}

impl AlertEmail {
    pub fn render(alert: &Alert) -> Self {
        let severity = alert.severity.as_str().to_uppercase();
        let when = alert.ts.to_rfc3339();
        let hr = fmt_opt(alert.meta.hr, " bpm");
        let spo2 = fmt_opt(alert.meta.spo2, "%");
        let note = alert.meta.note.clone().unwrap_or_else(|| "—".to_string());

        if alert.rule == AlertRule::Fall {
            let rows = [
                ("Device", alert.device_id.clone()),
                ("Time (UTC)", when),
                ("Severity", severity.clone()),
                ("HR", hr),
                ("SpO₂", spo2),
                ("Note", note),
            ];
            return Self {
                subject: format!("{} Alert | {} | {}", PRODUCT, severity, alert.device_id),
                html: frame("FALL DETECTED Emergency", &rows),
            };
        }

        let label = alert.rule.label();
        let rows = [
            ("Device", alert.device_id.clone()),
            ("Time (UTC)", when),
            ("Rule", alert.rule.as_str().to_string()),
            ("Value", fmt_opt(alert.value, "")),
            ("Severity", severity.clone()),
            ("HR", hr),
            ("SpO₂", spo2),
            ("Note", note),
        ];
        Self {
            subject: format!("{} | {} | {}", label, severity, alert.device_id),
            html: frame(&format!("{} ALERT", label), &rows),
        }
    }
}

/// Missing and non-positive readings render as a dash.
fn fmt_opt(value: Option<f64>, unit: &str) -> String {
    match value {
        Some(v) if v > 0.0 => format!("{}{}", v, unit),
        _ => "—".to_string(),
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn frame(title: &str, rows: &[(&str, String)]) -> String {
    let body: String = rows
        .iter()
        .map(|(k, v)| {
            format!(
                r#"
    <tr>
      <td style="padding:8px 12px;background:#f6f7f9;border-bottom:1px solid #e6e8ee;font-weight:600">{}</td>
      <td style="padding:8px 12px;border-bottom:1px solid #e6e8ee">{}</td>
    </tr>"#,
                escape(k),
                escape(v)
            )
        })
        .collect();

    format!(
        r#"<!doctype html>
<html><body style="font-family:ui-sans-serif,system-ui,sans-serif;line-height:1.5;color:#0f172a">
  <div style="max-width:560px;margin:24px auto;border:1px solid #e6e8ee;border-radius:12px;overflow:hidden">
    <div style="padding:16px 20px;background:#0ea5e9;color:white;font-weight:700">{}: {}</div>
    <div style="padding:16px 20px">
      <table style="width:100%;border-collapse:collapse">{}
      </table>
      <p style="font-size:12px;color:#475569;margin-top:16px">
        You are receiving this because you are listed as an emergency contact.
      </p>
    </div>
  </div>
</body></html>"#,
        PRODUCT,
        escape(title),
        body
    )
}
