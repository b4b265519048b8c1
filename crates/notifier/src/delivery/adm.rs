//! Per-device JSON delivery authorised by an OAuth2 client-credentials token.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use serde_json::{Value, json};

use pushgate_common::types::{App, Notification};
use pushgate_store::Store;

use crate::batch::{Batch, RecipientResult};
use crate::delivery::DispatchReport;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, RetryableError};
use crate::retry::retry_after_header;

const TYPE_VERSION: &str = "com.amazon.device.messaging.ADMMessage@1.0";
const ACCEPT_TYPE: &str = "com.amazon.device.messaging.ADMSendResult@1.0";
const REGISTRATION_PLACEHOLDER: &str = "{registration_id}";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Default, Deserialize)]
struct SendResponse {
    #[serde(default, rename = "registrationID")]
    registration_id: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

enum SendAttempt {
    Done(RecipientResult),
    Unauthorized,
}

pub struct AdmDispatcher {
    app_name: String,
    /// Cached access token lives on the app and is persisted on refresh.
    app: tokio::sync::Mutex<App>,
    client: reqwest::Client,
    endpoint: String,
    token_endpoint: String,
    store: Arc<dyn Store>,
}

impl AdmDispatcher {
    pub fn new(
        app: &App,
        client: reqwest::Client,
        endpoint: String,
        token_endpoint: String,
        store: Arc<dyn Store>,
    ) -> Result<Self, DispatchError> {
        let has_credentials = app.client_id.as_deref().is_some_and(|s| !s.is_empty())
            && app.client_secret.as_deref().is_some_and(|s| !s.is_empty());
        if !has_credentials {
            return Err(DispatchError::Configuration(format!(
                "App {} has no client credentials",
                app.name
            )));
        }

        Ok(Self {
            app_name: app.name.clone(),
            app: tokio::sync::Mutex::new(app.clone()),
            client,
            endpoint,
            token_endpoint,
            store,
        })
    }

    /// Build a dispatcher and fetch its first access token, so rejected
    /// client credentials fail the pool start instead of the first batch.
    pub async fn connect(
        app: &App,
        client: reqwest::Client,
        endpoint: String,
        token_endpoint: String,
        store: Arc<dyn Store>,
    ) -> Result<Self, DispatchError> {
        let dispatcher = Self::new(app, client, endpoint, token_endpoint, store)?;
        dispatcher.access_token(false).await?;
        Ok(dispatcher)
    }

    /// A valid access token, requesting a new one when the cached token is
    /// missing, expiring, or `force` is set.
    async fn access_token(&self, force: bool) -> Result<String, DispatchError> {
        let mut app = self.app.lock().await;
        let now = Utc::now();
        if !force
            && !app.access_token_expired(now)
            && let Some(token) = &app.access_token
        {
            return Ok(token.clone());
        }

        let client_id = app.client_id.clone().unwrap_or_default();
        let client_secret = app.client_secret.clone().unwrap_or_default();
        let response = self
            .client
            .post(&self.token_endpoint)
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", "messaging:push"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(RetryableError::from)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_header(response.headers(), now);
            let body = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                400 | 401 => DispatchError::Configuration(format!(
                    "Access token request rejected ({}): {}",
                    status, body
                )),
                _ => RetryableError::new(format!("Access token request failed ({})", status))
                    .with_retry_after(retry_after)
                    .into(),
            });
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            RetryableError::new(format!("Malformed access token response: {}", e))
        })?;

        app.access_token = Some(token.access_token.clone());
        app.access_token_expires_at = Some(now + chrono::Duration::seconds(token.expires_in));
        if let Err(e) = self.store.update_app(&app).await {
            tracing::warn!(app = %self.app_name, error = %e, "Failed to persist access token");
        }
        tracing::info!(
            app = %self.app_name,
            expires_in = token.expires_in,
            "Access token refreshed"
        );

        Ok(token.access_token)
    }

    async fn clear_token(&self) {
        let mut app = self.app.lock().await;
        app.access_token = None;
        app.access_token_expires_at = None;
    }

    async fn send_once(
        &self,
        notification: &Notification,
        registration_id: &str,
        access_token: &str,
    ) -> SendAttempt {
        let now = Utc::now();
        let url = self
            .endpoint
            .replace(REGISTRATION_PLACEHOLDER, registration_id);

        let response = match self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", access_token))
            .header("X-Amzn-Type-Version", TYPE_VERSION)
            .header("X-Amzn-Accept-Type", ACCEPT_TYPE)
            .json(&message_body(notification))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return SendAttempt::Done(RecipientResult::Unavailable {
                    reason: RetryableError::from(e).description,
                    retry_after: None,
                });
            }
        };

        let status = response.status();
        let retry_after = retry_after_header(response.headers(), now);
        let body: SendResponse = response.json().await.unwrap_or_default();

        SendAttempt::Done(match status.as_u16() {
            200 => RecipientResult::Delivered {
                canonical_token: body.registration_id,
            },
            400 => match body.reason.as_deref() {
                Some(reason @ ("InvalidRegistrationId" | "Unregistered")) => {
                    RecipientResult::InvalidToken {
                        reason: reason.to_string(),
                    }
                }
                reason => RecipientResult::Rejected {
                    reason: reason.unwrap_or("Bad request (400)").to_string(),
                },
            },
            401 => return SendAttempt::Unauthorized,
            413 => RecipientResult::Rejected {
                reason: "Message too large (413)".to_string(),
            },
            429 | 500 | 503 => RecipientResult::Unavailable {
                reason: body
                    .reason
                    .unwrap_or_else(|| format!("Service unavailable ({})", status)),
                retry_after,
            },
            code => RecipientResult::Rejected {
                reason: format!("Unexpected response status {}", code),
            },
        })
    }

    async fn send(
        &self,
        notification: &Notification,
        registration_id: &str,
        access_token: &mut String,
    ) -> Result<RecipientResult, DispatchError> {
        if let SendAttempt::Done(result) = self
            .send_once(notification, registration_id, access_token)
            .await
        {
            return Ok(result);
        }

        tracing::info!(app = %self.app_name, "Access token rejected, refreshing");
        self.clear_token().await;
        *access_token = self.access_token(true).await?;

        Ok(
            match self
                .send_once(notification, registration_id, access_token)
                .await
            {
                SendAttempt::Done(result) => result,
                SendAttempt::Unauthorized => RecipientResult::Rejected {
                    reason: "Unauthorized after refreshing the access token (401)".to_string(),
                },
            },
        )
    }
}

/// Message body. Non-object payloads are wrapped as `{"message": ...}` since
/// the data map only carries string values.
fn message_body(notification: &Notification) -> Value {
    let data = match &notification.payload {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => Value::String(s.clone()),
                        other => Value::String(other.to_string()),
                    };
                    (k.clone(), value)
                })
                .collect(),
        ),
        Value::String(s) => json!({ "message": s }),
        other => json!({ "message": other.to_string() }),
    };

    let mut body = json!({ "data": data });
    if let Some(key) = &notification.collapse_key {
        body["consolidationKey"] = json!(key);
    }
    if let Some(expiry) = notification.expiry {
        body["expiresAfter"] = json!(expiry);
    }
    body
}

#[async_trait]
impl Dispatcher for AdmDispatcher {
    async fn dispatch(&self, batch: &Batch) -> Result<DispatchReport, DispatchError> {
        let mut access_token = self.access_token(false).await?;
        let notifications: Vec<&Notification> = batch.notifications().collect();

        let recipients = batch.recipients();
        let mut results = Vec::with_capacity(recipients.len());
        for recipient in &recipients {
            let notification = notifications[recipient.member];
            match self
                .send(notification, &recipient.token, &mut access_token)
                .await
            {
                Ok(result) => results.push(result),
                Err(e) if results.is_empty() => return Err(e),
                Err(e) => {
                    // Recipients already sent must not be sent again.
                    tracing::warn!(
                        app = %self.app_name,
                        sent = results.len(),
                        remaining = recipients.len() - results.len(),
                        error = %e,
                        "Batch interrupted, deferring the remaining recipients"
                    );
                    let retry_after = match &e {
                        DispatchError::Retryable(r) => r.retry_after,
                        _ => None,
                    };
                    results.resize(
                        recipients.len(),
                        RecipientResult::Unavailable {
                            reason: e.to_string(),
                            retry_after,
                        },
                    );
                    break;
                }
            }
        }

        Ok(batch.demultiplex(&results))
    }
}

impl AdmDispatcher {
    /// Expiry of the cached access token, if one is held.
    pub async fn token_expires_at(&self) -> Option<DateTime<Utc>> {
        self.app.lock().await.access_token_expires_at
    }
}
