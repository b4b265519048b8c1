//! Toast delivery to Windows Phone channel URIs.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use pushgate_common::types::{App, Notification, TokenFeedback};

use crate::batch::Batch;
use crate::delivery::{DispatchReport, Outcome};
use crate::dispatcher::Dispatcher;
use crate::error::{DeliveryError, DispatchError, RetryableError};

const NOTIFICATION_STATUS: &str = "X-NotificationStatus";

pub struct WpnsDispatcher {
    app_name: String,
    client: reqwest::Client,
}

impl WpnsDispatcher {
    pub fn new(app: &App, client: reqwest::Client) -> Self {
        Self {
            app_name: app.name.clone(),
            client,
        }
    }

    async fn send(&self, notification: &Notification) -> (Outcome, Option<TokenFeedback>) {
        let [uri] = notification.tokens.as_slice() else {
            return (
                Outcome::Failed(DeliveryError::new(
                    None,
                    format!(
                        "Expected exactly one channel URI, got {}",
                        notification.tokens.len()
                    ),
                )),
                None,
            );
        };

        let response = match self
            .client
            .post(uri)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .header("X-WindowsPhone-Target", "toast")
            .header("X-NotificationClass", "2")
            .body(toast_xml(&notification.payload))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return (Outcome::Retry(RetryableError::from(e)), None),
        };

        let now = Utc::now();
        let status = response.status().as_u16();
        let notification_status = response
            .headers()
            .get(NOTIFICATION_STATUS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        tracing::debug!(
            app = %self.app_name,
            notification_id = %notification.id,
            status,
            notification_status = %notification_status,
            "Toast request completed"
        );

        let code = Some(i32::from(status));
        let outcome = match (status, notification_status.as_str()) {
            (200, "Received") => Outcome::Delivered,
            (200, "QueueFull") => Outcome::Retry(
                RetryableError::new("Device queue is full")
                    .with_retry_after(Some(now + chrono::Duration::minutes(10))),
            ),
            (200, "Suppressed") => Outcome::Failed(DeliveryError::new(
                code,
                "Notification was suppressed by the device",
            )),
            (200, other) => Outcome::Failed(DeliveryError::new(
                code,
                format!("Unexpected notification status '{}'", other),
            )),
            (400, _) => Outcome::Failed(DeliveryError::new(code, "Malformed toast request (400)")),
            (401, _) => Outcome::Failed(DeliveryError::new(
                code,
                "Unauthorized to send to this channel (401)",
            )),
            (404, _) => {
                return (
                    Outcome::Failed(DeliveryError::new(code, "Channel URI has expired (404)")),
                    Some(TokenFeedback::invalid(
                        notification.app_id,
                        uri.clone(),
                        "Channel URI has expired",
                    )),
                );
            }
            (405, _) => Outcome::Failed(DeliveryError::new(code, "Method not allowed (405)")),
            (406 | 412, _) => Outcome::Retry(
                RetryableError::new(format!("Channel is throttled or inactive ({})", status))
                    .with_retry_after(Some(now + chrono::Duration::hours(1))),
            ),
            (503, _) => Outcome::Retry(RetryableError::new("Push service unavailable (503)")),
            _ => Outcome::Failed(DeliveryError::new(
                code,
                format!("Unexpected response status {}", status),
            )),
        };
        (outcome, None)
    }
}

/// Toast body. `title` maps to Text1, `body`/`message`/`alert` to Text2 and
/// `param` to the launch parameter.
pub fn toast_xml(payload: &Value) -> String {
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| payload.get(*name).and_then(Value::as_str))
            .map(escape_xml)
            .unwrap_or_default()
    };
    let title = field(&["title"]);
    let body = field(&["body", "message", "alert"]);
    let param = field(&["param"]);

    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?><wp:Notification xmlns:wp=\"WPNotification\"><wp:Toast>",
    );
    xml.push_str(&format!("<wp:Text1>{}</wp:Text1>", title));
    xml.push_str(&format!("<wp:Text2>{}</wp:Text2>", body));
    if !param.is_empty() {
        xml.push_str(&format!("<wp:Param>{}</wp:Param>", param));
    }
    xml.push_str("</wp:Toast></wp:Notification>");
    xml
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[async_trait]
impl Dispatcher for WpnsDispatcher {
    async fn dispatch(&self, batch: &Batch) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::default();
        for notification in batch.notifications() {
            let (outcome, feedback) = self.send(notification).await;
            report.outcomes.push(outcome);
            report.feedback.extend(feedback);
        }
        Ok(report)
    }
}
