//! Multicast JSON delivery (GCM / legacy FCM HTTP).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::{Value, json};

use pushgate_common::types::{App, Notification};

use crate::batch::{Batch, RecipientResult};
use crate::delivery::DispatchReport;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, RetryableError};
use crate::retry::retry_after_header;

/// Registration ids accepted in one request.
pub const MAX_RECIPIENTS: usize = 1000;

#[derive(Debug, Deserialize)]
struct MulticastResponse {
    #[serde(default)]
    results: Vec<MulticastResult>,
}

#[derive(Debug, Deserialize)]
struct MulticastResult {
    #[serde(default)]
    registration_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct GcmDispatcher {
    app_name: String,
    auth_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl GcmDispatcher {
    pub fn new(app: &App, client: reqwest::Client, endpoint: String) -> Result<Self, DispatchError> {
        let auth_key = app
            .auth_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                DispatchError::Configuration(format!("App {} has no server key", app.name))
            })?;

        Ok(Self {
            app_name: app.name.clone(),
            auth_key,
            endpoint,
            client,
        })
    }

    async fn send_chunk(&self, template: &Notification, tokens: &[String]) -> Vec<RecipientResult> {
        let now = Utc::now();
        let body = request_body(template, tokens);

        let response = match self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("key={}", self.auth_key))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let error = RetryableError::from(e);
                tracing::warn!(app = %self.app_name, error = %error, "Multicast request failed");
                return unavailable_all(tokens.len(), &error.description, None);
            }
        };

        let status = response.status();
        let retry_after = retry_after_header(response.headers(), now);

        match status.as_u16() {
            200 => match response.json::<MulticastResponse>().await {
                Ok(parsed) if parsed.results.len() == tokens.len() => parsed
                    .results
                    .into_iter()
                    .map(|r| classify(r, retry_after))
                    .collect(),
                Ok(parsed) => unavailable_all(
                    tokens.len(),
                    &format!(
                        "Response carried {} results for {} recipients",
                        parsed.results.len(),
                        tokens.len()
                    ),
                    None,
                ),
                Err(e) => unavailable_all(tokens.len(), &format!("Malformed response: {}", e), None),
            },
            400 => rejected_all(
                tokens.len(),
                "Request could not be parsed as JSON or contained invalid fields (400)",
            ),
            401 => {
                tracing::error!(app = %self.app_name, "Provider rejected the server key");
                rejected_all(tokens.len(), "Unauthorized; check the server key (401)")
            }
            429 => unavailable_all(tokens.len(), "Too Many Requests (429)", retry_after),
            code if status.is_server_error() => unavailable_all(
                tokens.len(),
                &format!(
                    "{} {}",
                    code,
                    status.canonical_reason().unwrap_or("Server Error")
                ),
                retry_after,
            ),
            code => rejected_all(tokens.len(), &format!("Unexpected response status {}", code)),
        }
    }
}

/// JSON body for `registration_ids`, merging the notification payload.
fn request_body(notification: &Notification, registration_ids: &[String]) -> Value {
    let mut body = match &notification.payload {
        Value::Object(map) => Value::Object(map.clone()),
        other => json!({ "data": other }),
    };

    body["registration_ids"] = json!(registration_ids);
    if let Some(collapse_key) = &notification.collapse_key {
        body["collapse_key"] = json!(collapse_key);
    }
    if let Some(ttl) = notification.expiry {
        body["time_to_live"] = json!(ttl);
    }
    if let Some(priority) = notification.priority {
        body["priority"] = json!(if priority >= 10 { "high" } else { "normal" });
    }
    body
}

fn classify(result: MulticastResult, retry_after: Option<DateTime<Utc>>) -> RecipientResult {
    match result.error.as_deref() {
        None => RecipientResult::Delivered {
            canonical_token: result.registration_id,
        },
        Some(
            reason @ ("NotRegistered" | "InvalidRegistration" | "MismatchSenderId"
            | "InvalidPackageName"),
        ) => RecipientResult::InvalidToken {
            reason: reason.to_string(),
        },
        Some(reason @ ("Unavailable" | "InternalServerError")) => RecipientResult::Unavailable {
            reason: reason.to_string(),
            retry_after,
        },
        Some(reason) => RecipientResult::Rejected {
            reason: reason.to_string(),
        },
    }
}

fn unavailable_all(
    count: usize,
    reason: &str,
    retry_after: Option<DateTime<Utc>>,
) -> Vec<RecipientResult> {
    vec![
        RecipientResult::Unavailable {
            reason: reason.to_string(),
            retry_after,
        };
        count
    ]
}

fn rejected_all(count: usize, reason: &str) -> Vec<RecipientResult> {
    vec![
        RecipientResult::Rejected {
            reason: reason.to_string(),
        };
        count
    ]
}

#[async_trait]
impl Dispatcher for GcmDispatcher {
    async fn dispatch(&self, batch: &Batch) -> Result<DispatchReport, DispatchError> {
        let Some(template) = batch.notifications().next() else {
            return Ok(DispatchReport::default());
        };

        let tokens: Vec<String> = batch.recipients().into_iter().map(|r| r.token).collect();
        let mut results = Vec::with_capacity(tokens.len());
        for chunk in tokens.chunks(MAX_RECIPIENTS) {
            results.extend(self.send_chunk(template, chunk).await);
        }

        tracing::debug!(
            app = %self.app_name,
            notifications = batch.len(),
            recipients = tokens.len(),
            "Multicast request completed"
        );
        Ok(batch.demultiplex(&results))
    }

    fn max_recipients(&self) -> usize {
        MAX_RECIPIENTS
    }
}
