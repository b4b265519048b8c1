//! Binary feedback service reader.
//!
//! The feedback service streams 38-byte tuples (4-byte timestamp, 2-byte
//! token length, 32-byte token) for devices that no longer accept
//! notifications, then closes the connection. Each poll opens a new
//! connection and drains it. Failures here never touch delivery workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pushgate_common::types::{App, TokenFeedback};
use pushgate_store::Store;

use crate::connection::Connector;
use crate::error::ConnectionError;

pub const TUPLE_BYTES: usize = 38;

/// Parse one feedback tuple into `(observed_at, hex token)`.
pub fn parse_tuple(tuple: &[u8; TUPLE_BYTES]) -> Option<(DateTime<Utc>, String)> {
    let timestamp = u32::from_be_bytes([tuple[0], tuple[1], tuple[2], tuple[3]]);
    let token_len = u16::from_be_bytes([tuple[4], tuple[5]]) as usize;
    if token_len != TUPLE_BYTES - 6 {
        return None;
    }
    let observed_at = DateTime::<Utc>::from_timestamp(i64::from(timestamp), 0)?;
    Some((observed_at, hex::encode(&tuple[6..])))
}

pub struct FeedbackReceiver {
    app_id: Uuid,
    app_name: String,
    connector: Connector,
    host: String,
    port: u16,
    poll: Duration,
    connect_timeout: Duration,
    /// Longest wait for the next tuple before the check is abandoned.
    read_timeout: Duration,
    store: Arc<dyn Store>,
}

impl FeedbackReceiver {
    pub fn new(
        app: &App,
        connector: Connector,
        endpoint: (String, u16),
        poll: Duration,
        connect_timeout: Duration,
        read_timeout: Duration,
        store: Arc<dyn Store>,
    ) -> Self {
        let (host, port) = endpoint;
        Self {
            app_id: app.id,
            app_name: app.name.clone(),
            connector,
            host,
            port,
            poll,
            connect_timeout,
            read_timeout,
            store,
        }
    }

    /// Poll until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(app = %self.app_name, host = %self.host, "Feedback receiver started");
        loop {
            match self.check_once(&cancel).await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::info!(app = %self.app_name, count, "Recorded invalid device tokens from feedback service")
                }
                Err(e) => {
                    tracing::warn!(app = %self.app_name, error = %e, "Feedback service check failed")
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
        tracing::info!(app = %self.app_name, "Feedback receiver stopped");
    }

    /// Connect once and record every tuple until the service closes the
    /// connection. Returns how many tokens were recorded.
    ///
    /// Tokens recorded before a stalled read times out stay recorded.
    pub async fn check_once(&self, cancel: &CancellationToken) -> Result<usize, ConnectionError> {
        let mut stream = self
            .connector
            .connect(&self.host, self.port, self.connect_timeout)
            .await?;

        let mut tuple = [0u8; TUPLE_BYTES];
        let mut recorded = 0;
        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = tokio::time::timeout(self.read_timeout, stream.read_exact(&mut tuple)) => read,
            };
            match read {
                Ok(Ok(_)) => {}
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    tracing::warn!(
                        app = %self.app_name,
                        recorded,
                        "Feedback service stalled, closing connection"
                    );
                    return Err(ConnectionError::Timeout(self.read_timeout));
                }
            }

            let Some((observed_at, token)) = parse_tuple(&tuple) else {
                tracing::warn!(app = %self.app_name, "Malformed feedback tuple, skipping");
                continue;
            };
            let mut feedback =
                TokenFeedback::invalid(self.app_id, token, "Reported by the feedback service");
            feedback.observed_at = observed_at;

            if let Err(e) = self.store.record_token_feedback(&feedback).await {
                tracing::error!(app = %self.app_name, error = %e, "Failed to record token feedback");
                continue;
            }
            recorded += 1;
        }

        Ok(recorded)
    }
}
