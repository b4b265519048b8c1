use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Push provider families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Binary protocol gateway over a persistent TLS socket.
    Apns,
    /// JSON over HTTP, multicast capable.
    Gcm,
    /// XML toast over HTTP, one channel URI per request.
    Wpns,
    /// JSON over HTTP with an OAuth2 access token.
    Adm,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Apns => write!(f, "apns"),
            Provider::Gcm => write!(f, "gcm"),
            Provider::Wpns => write!(f, "wpns"),
            Provider::Adm => write!(f, "adm"),
        }
    }
}

/// Provider environment an app's credentials belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Sandbox,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Sandbox => write!(f, "sandbox"),
        }
    }
}

/// Notification delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Retryable,
}

impl DeliveryStatus {
    /// Terminal states are persisted and never picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryStatus::Pending => write!(f, "pending"),
            DeliveryStatus::Sent => write!(f, "sent"),
            DeliveryStatus::Failed => write!(f, "failed"),
            DeliveryStatus::Retryable => write!(f, "retryable"),
        }
    }
}

/// A registered provider credential set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct App {
    pub id: Uuid,
    pub name: String,
    pub provider: Provider,
    pub environment: Option<Environment>,
    /// PEM bundle holding the client certificate chain and private key (APNS).
    pub certificate: Option<String>,
    pub password: Option<String>,
    /// Server key (GCM).
    pub auth_key: Option<String>,
    /// OAuth2 client credentials (ADM).
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    /// Number of dispatcher workers. Zero means "provider default".
    pub connections: i32,
    pub enabled: bool,
}

impl App {
    /// Stable digest over everything that requires a fresh connection when changed.
    ///
    /// The pool size and the cached ADM access token are deliberately left out:
    /// a `connections` change resizes the pool in place and access tokens are
    /// refreshed by the daemon itself.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.provider.to_string());
        hasher.update([0]);
        hasher.update(self.environment.map(|e| e.to_string()).unwrap_or_default());
        for field in [
            &self.certificate,
            &self.password,
            &self.auth_key,
            &self.client_id,
            &self.client_secret,
        ] {
            hasher.update([0]);
            hasher.update(field.as_deref().unwrap_or_default());
        }
        hex::encode(hasher.finalize())
    }

    /// Whether the cached ADM access token is missing or about to expire.
    pub fn access_token_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.access_token, self.access_token_expires_at) {
            (Some(_), Some(expires_at)) => expires_at <= now + chrono::Duration::seconds(60),
            _ => true,
        }
    }
}

/// A message addressed to one or more device tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub app_id: Uuid,
    /// Device tokens, registration ids or channel URIs depending on the provider.
    pub tokens: Vec<String>,
    /// Provider-specific payload body.
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
    /// Time-to-live in seconds.
    pub expiry: Option<i32>,
    pub collapse_key: Option<String>,
    pub status: DeliveryStatus,
    pub retries: i32,
    pub deliver_after: Option<DateTime<Utc>>,
    pub error_code: Option<i32>,
    pub error_description: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Build a new pending notification.
    pub fn new(app_id: Uuid, tokens: Vec<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            app_id,
            tokens,
            payload,
            priority: None,
            expiry: None,
            collapse_key: None,
            status: DeliveryStatus::Pending,
            retries: 0,
            deliver_after: None,
            error_code: None,
            error_description: None,
            sent_at: None,
            failed_at: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the notification should be picked up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Pending | DeliveryStatus::Retryable
        ) && self.deliver_after.is_none_or(|at| at <= now)
    }
}

/// Kind of token feedback reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenFeedbackKind {
    /// The provider considers the token permanently invalid.
    Invalid,
    /// The provider replaced the token with a canonical one.
    Canonical { new_token: String },
}

/// A provider report about one device token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFeedback {
    pub app_id: Uuid,
    pub token: String,
    #[serde(flatten)]
    pub kind: TokenFeedbackKind,
    pub reason: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl TokenFeedback {
    pub fn invalid(app_id: Uuid, token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            app_id,
            token: token.into(),
            kind: TokenFeedbackKind::Invalid,
            reason: Some(reason.into()),
            observed_at: Utc::now(),
        }
    }

    pub fn canonical(app_id: Uuid, token: impl Into<String>, new_token: impl Into<String>) -> Self {
        Self {
            app_id,
            token: token.into(),
            kind: TokenFeedbackKind::Canonical {
                new_token: new_token.into(),
            },
            reason: None,
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn make_app(provider: Provider) -> App {
        App {
            id: Uuid::new_v4(),
            name: "test-app".to_string(),
            provider,
            environment: Some(Environment::Sandbox),
            certificate: Some("-----BEGIN CERTIFICATE-----".to_string()),
            password: None,
            auth_key: Some("key".to_string()),
            client_id: None,
            client_secret: None,
            access_token: None,
            access_token_expires_at: None,
            connections: 1,
            enabled: true,
        }
    }

    #[test]
    fn test_fingerprint_ignores_pool_size() {
        let app = make_app(Provider::Apns);
        let mut resized = app.clone();
        resized.connections = 4;
        assert_eq!(app.fingerprint(), resized.fingerprint());
    }

    #[test]
    fn test_fingerprint_tracks_credentials() {
        let app = make_app(Provider::Apns);
        let mut rotated = app.clone();
        rotated.certificate = Some("-----BEGIN CERTIFICATE----- rotated".to_string());
        assert_ne!(app.fingerprint(), rotated.fingerprint());

        let mut moved = app.clone();
        moved.environment = Some(Environment::Production);
        assert_ne!(app.fingerprint(), moved.fingerprint());
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let mut a = make_app(Provider::Gcm);
        a.auth_key = Some("ab".to_string());
        a.client_id = Some("c".to_string());
        let mut b = a.clone();
        b.auth_key = Some("a".to_string());
        b.client_id = Some("bc".to_string());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_notification_is_due() {
        let now = Utc::now();
        let mut n = Notification::new(Uuid::new_v4(), vec!["t".into()], serde_json::json!({}));
        assert!(n.is_due(now));

        n.deliver_after = Some(now + chrono::Duration::seconds(30));
        assert!(!n.is_due(now));

        n.deliver_after = Some(now - chrono::Duration::seconds(1));
        n.status = DeliveryStatus::Retryable;
        assert!(n.is_due(now));

        n.status = DeliveryStatus::Sent;
        assert!(!n.is_due(now));
    }

    #[test]
    fn test_access_token_expiry() {
        let now = Utc::now();
        let mut app = make_app(Provider::Adm);
        assert!(app.access_token_expired(now));

        app.access_token = Some("token".to_string());
        app.access_token_expires_at = Some(now + chrono::Duration::minutes(30));
        assert!(!app.access_token_expired(now));

        app.access_token_expires_at = Some(now + chrono::Duration::seconds(10));
        assert!(app.access_token_expired(now));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DeliveryStatus::Retryable.to_string(), "retryable");
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(!DeliveryStatus::Retryable.is_terminal());
    }
}
