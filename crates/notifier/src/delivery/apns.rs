//! Binary gateway delivery.
//!
//! Frames are written fire-and-forget on a persistent connection. The gateway
//! only ever answers with a 6-byte error frame naming the sequence id of the
//! rejected notification, after which it drops every later write and closes
//! the socket. Each send is therefore recorded in a [`RingBuffer`] while the
//! session lock is held, and a reader task owning the read half resolves
//! error frames against it: the rejected notification is failed and
//! everything written after it is replayed, in order, on a new connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pushgate_common::config::ApnsConfig;
use pushgate_common::types::{App, Environment, Notification, TokenFeedback};

use crate::batch::Batch;
use crate::connection::{Connector, StreamReader, StreamWriter};
use crate::delivery::{DispatchReport, LateOutcome, Outcome};
use crate::dispatcher::Dispatcher;
use crate::error::{ConnectionError, DeliveryError, DispatchError, RetryableError};
use crate::ring_buffer::RingBuffer;

pub const PRODUCTION_GATEWAY: (&str, u16) = ("gateway.push.apple.com", 2195);
pub const SANDBOX_GATEWAY: (&str, u16) = ("gateway.sandbox.push.apple.com", 2195);
pub const PRODUCTION_FEEDBACK: (&str, u16) = ("feedback.push.apple.com", 2196);
pub const SANDBOX_FEEDBACK: (&str, u16) = ("feedback.sandbox.push.apple.com", 2196);

const COMMAND_SEND: u8 = 2;
const COMMAND_ERROR: u8 = 8;
const ERROR_FRAME_LEN: usize = 6;

pub const TOKEN_BYTES: usize = 32;
pub const MAX_PAYLOAD_BYTES: usize = 2048;

/// Status code meaning the gateway is shutting down. The identifier names the
/// last notification it processed, not a rejected one.
pub const STATUS_SHUTDOWN: u8 = 10;
pub const STATUS_INVALID_TOKEN: u8 = 8;

const WRITE_RETRIES: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_PRIORITY: u8 = 10;

/// Gateway `(host, port)` for an app.
pub fn gateway_endpoint(app: &App, config: &ApnsConfig) -> (String, u16) {
    if let Some(endpoint) = &config.gateway_override {
        return endpoint.clone();
    }
    let (host, port) = match app.environment {
        Some(Environment::Sandbox) => SANDBOX_GATEWAY,
        _ => PRODUCTION_GATEWAY,
    };
    (host.to_string(), port)
}

/// Feedback service `(host, port)` for an app.
pub fn feedback_endpoint(app: &App, config: &ApnsConfig) -> (String, u16) {
    if let Some(endpoint) = &config.feedback_override {
        return endpoint.clone();
    }
    let (host, port) = match app.environment {
        Some(Environment::Sandbox) => SANDBOX_FEEDBACK,
        _ => PRODUCTION_FEEDBACK,
    };
    (host.to_string(), port)
}

pub fn status_description(status: u8) -> &'static str {
    match status {
        0 => "No errors encountered",
        1 => "Processing error",
        2 => "Missing device token",
        3 => "Missing topic",
        4 => "Missing payload",
        5 => "Invalid token size",
        6 => "Invalid topic size",
        7 => "Invalid payload size",
        8 => "Invalid token",
        10 => "Shutdown",
        255 => "None (unknown)",
        _ => "Unknown error",
    }
}

// ============================================================
// Wire format
// ============================================================

/// Serialize a command-2 frame.
pub fn encode_frame(
    identifier: u32,
    token: &[u8; TOKEN_BYTES],
    payload: &[u8],
    expiry: u32,
    priority: u8,
) -> Bytes {
    let mut items = BytesMut::with_capacity(payload.len() + 64);
    put_item(&mut items, 1, token);
    put_item(&mut items, 2, payload);
    put_item(&mut items, 3, &identifier.to_be_bytes());
    put_item(&mut items, 4, &expiry.to_be_bytes());
    put_item(&mut items, 5, &[priority]);

    let mut frame = BytesMut::with_capacity(items.len() + 5);
    frame.put_u8(COMMAND_SEND);
    frame.put_u32(items.len() as u32);
    frame.extend_from_slice(&items);
    frame.freeze()
}

fn put_item(buf: &mut BytesMut, id: u8, data: &[u8]) {
    buf.put_u8(id);
    buf.put_u16(data.len() as u16);
    buf.extend_from_slice(data);
}

/// A parsed command-2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub identifier: u32,
    pub token: String,
    pub payload: Vec<u8>,
    pub expiry: u32,
    pub priority: u8,
}

/// Parse one command-2 frame from the front of `buf`, returning it and the
/// number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Option<(DecodedFrame, usize)> {
    if buf.len() < 5 || buf[0] != COMMAND_SEND {
        return None;
    }
    let len = u32::from_be_bytes(buf[1..5].try_into().ok()?) as usize;
    let body = buf.get(5..5 + len)?;

    let mut frame = DecodedFrame {
        identifier: 0,
        token: String::new(),
        payload: Vec::new(),
        expiry: 0,
        priority: 0,
    };
    let mut pos = 0;
    while pos < body.len() {
        let id = *body.get(pos)?;
        let item_len = u16::from_be_bytes(body.get(pos + 1..pos + 3)?.try_into().ok()?) as usize;
        let data = body.get(pos + 3..pos + 3 + item_len)?;
        match id {
            1 => frame.token = hex::encode(data),
            2 => frame.payload = data.to_vec(),
            3 => frame.identifier = u32::from_be_bytes(data.try_into().ok()?),
            4 => frame.expiry = u32::from_be_bytes(data.try_into().ok()?),
            5 => frame.priority = *data.first()?,
            _ => return None,
        }
        pos += 3 + item_len;
    }
    Some((frame, 5 + len))
}

/// Parse an error frame into `(status, identifier)`.
pub fn decode_error_frame(buf: &[u8; ERROR_FRAME_LEN]) -> Option<(u8, u32)> {
    if buf[0] != COMMAND_ERROR {
        return None;
    }
    let identifier = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    Some((buf[1], identifier))
}

/// Error frame bytes, as the gateway sends them.
pub fn encode_error_frame(status: u8, identifier: u32) -> [u8; ERROR_FRAME_LEN] {
    let id = identifier.to_be_bytes();
    [COMMAND_ERROR, status, id[0], id[1], id[2], id[3]]
}

/// Check a notification against gateway limits and return its token and
/// payload bytes.
fn validate(notification: &Notification) -> Result<([u8; TOKEN_BYTES], Vec<u8>), DeliveryError> {
    let [token] = notification.tokens.as_slice() else {
        return Err(DeliveryError::new(
            None,
            "Binary gateway notifications address exactly one device token",
        ));
    };

    let normalized: String = token
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '<' && *c != '>')
        .collect();
    let token_bytes: [u8; TOKEN_BYTES] = hex::decode(&normalized)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            DeliveryError::new(None, "Device token must be 64 hexadecimal characters")
        })?;

    let payload = serde_json::to_vec(&notification.payload)
        .map_err(|e| DeliveryError::new(None, format!("Payload is not serializable: {}", e)))?;
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(DeliveryError::new(
            None,
            format!(
                "Payload of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_PAYLOAD_BYTES
            ),
        ));
    }

    Ok((token_bytes, payload))
}

fn expiry_of(notification: &Notification) -> u32 {
    match notification.expiry {
        Some(ttl) if ttl > 0 => {
            u32::try_from(Utc::now().timestamp() + i64::from(ttl)).unwrap_or(u32::MAX)
        }
        _ => 0,
    }
}

fn priority_of(notification: &Notification) -> u8 {
    notification
        .priority
        .and_then(|p| u8::try_from(p).ok())
        .filter(|p| *p <= 10)
        .unwrap_or(DEFAULT_PRIORITY)
}

// ============================================================
// Session
// ============================================================

#[derive(Debug, Clone)]
struct SentFrame {
    notification: Notification,
    frame: Bytes,
}

struct Session {
    writer: Option<StreamWriter>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
    buffer: RingBuffer<SentFrame>,
    next_sequence: u32,
    last_used: Instant,
    total_written: u64,
}

impl Session {
    fn allocate_sequence(&mut self) -> u32 {
        let id = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        id
    }
}

struct Shared {
    app_id: uuid::Uuid,
    app_name: String,
    host: String,
    port: u16,
    connector: Connector,
    config: ApnsConfig,
    connect_timeout: Duration,
    session: tokio::sync::Mutex<Session>,
    late: parking_lot::Mutex<Vec<LateOutcome>>,
    closing: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    /// Drop the current socket. Must not be called from the reader task.
    fn disconnect(&self, session: &mut Session) {
        if let Some(reader) = session.reader.take() {
            reader.abort();
        }
        session.writer = None;
    }

    async fn reconnect(self: &Arc<Self>, session: &mut Session) -> Result<(), ConnectionError> {
        self.disconnect(session);

        let (reader, writer) = self
            .connector
            .connect_split(&self.host, self.port, self.connect_timeout)
            .await?;

        session.generation += 1;
        session.writer = Some(writer);
        session.last_used = Instant::now();

        let generation = session.generation;
        let shared = Arc::clone(self);
        session.reader = Some(tokio::spawn(shared.read_errors(reader, generation)));

        tracing::info!(
            app = %self.app_name,
            host = %self.host,
            port = self.port,
            generation,
            "Connected to gateway"
        );
        Ok(())
    }

    async fn write(&self, writer: &mut StreamWriter, frame: &[u8]) -> Result<(), ConnectionError> {
        tokio::time::timeout(self.connect_timeout, async {
            writer.write_all(frame).await?;
            writer.flush().await
        })
        .await
        .map_err(|_| ConnectionError::Timeout(self.connect_timeout))?
        .map_err(ConnectionError::from)
    }

    fn push_late(&self, late: LateOutcome) {
        self.late.lock().push(late);
    }

    /// Reader task body. Boxed because error handling may reconnect, which
    /// spawns the next reader.
    fn read_errors(
        self: Arc<Self>,
        mut reader: StreamReader,
        generation: u64,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut frame = [0u8; ERROR_FRAME_LEN];
            let read = tokio::select! {
                _ = self.cancel.cancelled() => return,
                read = reader.read_exact(&mut frame) => read,
            };
            self.handle_read(generation, read, frame).await;
        })
    }

    async fn handle_read(
        self: &Arc<Self>,
        generation: u64,
        read: std::io::Result<usize>,
        frame: [u8; ERROR_FRAME_LEN],
    ) {
        match read {
            Ok(_) => match decode_error_frame(&frame) {
                Some((status, identifier)) => {
                    self.handle_error(generation, status, identifier).await
                }
                None => {
                    tracing::warn!(app = %self.app_name, command = frame[0], "Unexpected frame from gateway");
                    self.handle_disconnect(generation).await;
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.handle_disconnect(generation).await
            }
            Err(e) => {
                tracing::warn!(app = %self.app_name, error = %e, "Gateway read failed");
                self.handle_disconnect(generation).await;
            }
        }
    }

    async fn handle_disconnect(&self, generation: u64) {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            return;
        }
        // This is the reader task: detach rather than abort.
        session.reader.take();
        session.writer = None;

        if session.total_written <= 1 && !self.closing.load(Ordering::SeqCst) {
            tracing::error!(
                app = %self.app_name,
                "Gateway closed the connection before any notification was delivered; the certificate may be invalid or revoked"
            );
        } else {
            tracing::info!(app = %self.app_name, "Gateway closed the connection; reconnecting on next send");
        }
    }

    async fn handle_error(self: &Arc<Self>, generation: u64, status: u8, identifier: u32) {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            tracing::debug!(app = %self.app_name, identifier, "Ignoring error frame from a replaced connection");
            return;
        }
        session.reader.take();
        session.writer = None;

        let split = session.buffer.split_at_error(identifier);
        let description = status_description(status);

        match split.failed {
            Some((_, sent)) if status != STATUS_SHUTDOWN => {
                tracing::error!(
                    app = %self.app_name,
                    notification_id = %sent.notification.id,
                    status,
                    identifier,
                    "Gateway rejected notification: {}",
                    description
                );
                let feedback = (status == STATUS_INVALID_TOKEN)
                    .then(|| sent.notification.tokens.first().cloned())
                    .flatten()
                    .map(|token| TokenFeedback::invalid(self.app_id, token, description));
                self.push_late(LateOutcome {
                    outcome: Outcome::Failed(DeliveryError::new(
                        Some(i32::from(status)),
                        format!("{} ({})", description, status),
                    )),
                    notification: sent.notification,
                    feedback,
                });
            }
            Some(_) => {
                tracing::info!(app = %self.app_name, identifier, "Gateway is shutting down");
            }
            None => {
                tracing::warn!(
                    app = %self.app_name,
                    status,
                    identifier,
                    "Error frame references a notification outside the ring buffer"
                );
            }
        }

        if split.suffix.is_empty() {
            return;
        }

        if self.closing.load(Ordering::SeqCst) {
            for (_, sent) in split.suffix {
                self.push_late(LateOutcome {
                    notification: sent.notification,
                    outcome: Outcome::Retry(RetryableError::new(
                        "Discarded by the gateway after an earlier error during shutdown",
                    )),
                    feedback: None,
                });
            }
            return;
        }

        tracing::warn!(
            app = %self.app_name,
            count = split.suffix.len(),
            "Resending notifications written after the rejected one"
        );
        self.replay(&mut session, split.suffix).await;
    }

    /// Resend `frames` in order on a fresh connection, recording each again.
    async fn replay(self: &Arc<Self>, session: &mut Session, frames: Vec<(u32, SentFrame)>) {
        let mut pending = frames.into_iter().peekable();
        let mut last_error = String::new();

        for attempt in 0..=WRITE_RETRIES {
            if attempt > 0 {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(WRITE_RETRY_DELAY) => {}
                }
            }
            if let Err(e) = self.reconnect(session).await {
                tracing::warn!(app = %self.app_name, attempt, error = %e, "Reconnect for replay failed");
                last_error = e.to_string();
                continue;
            }

            while let Some((identifier, sent)) = pending.peek() {
                let Some(writer) = session.writer.as_mut() else {
                    break;
                };
                match self.write(writer, &sent.frame).await {
                    Ok(()) => {
                        session.buffer.push(*identifier, sent.clone());
                        session.total_written += 1;
                        session.last_used = Instant::now();
                        pending.next();
                    }
                    Err(e) => {
                        tracing::warn!(app = %self.app_name, error = %e, "Replay write failed");
                        last_error = e.to_string();
                        self.disconnect(session);
                        break;
                    }
                }
            }

            if pending.peek().is_none() {
                return;
            }
        }

        for (_, sent) in pending {
            self.push_late(LateOutcome {
                notification: sent.notification,
                outcome: Outcome::Retry(RetryableError::new(format!(
                    "Resend after gateway error failed: {}",
                    last_error
                ))),
                feedback: None,
            });
        }
    }
}

// ============================================================
// Dispatcher
// ============================================================

/// One persistent gateway connection with its error reader.
pub struct ApnsDispatcher {
    shared: Arc<Shared>,
}

impl ApnsDispatcher {
    /// Connect to `endpoint`. Fails when the first connection cannot be made.
    pub async fn connect(
        app: &App,
        connector: Connector,
        endpoint: (String, u16),
        config: ApnsConfig,
        connect_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, DispatchError> {
        let (host, port) = endpoint;
        let shared = Arc::new(Shared {
            app_id: app.id,
            app_name: app.name.clone(),
            host,
            port,
            connector,
            connect_timeout,
            session: tokio::sync::Mutex::new(Session {
                writer: None,
                reader: None,
                generation: 0,
                buffer: RingBuffer::new(config.ring_buffer_capacity),
                next_sequence: 1,
                last_used: Instant::now(),
                total_written: 0,
            }),
            config,
            late: parking_lot::Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            cancel,
        });

        {
            let mut session = shared.session.lock().await;
            shared.reconnect(&mut session).await?;
        }

        Ok(Self { shared })
    }

    async fn send(&self, notification: &Notification) -> Outcome {
        let (token, payload) = match validate(notification) {
            Ok(parts) => parts,
            Err(e) => return Outcome::Failed(e),
        };

        let shared = &self.shared;
        let mut session = shared.session.lock().await;

        if session.writer.is_some() && session.last_used.elapsed() >= shared.config.idle_reconnect {
            tracing::info!(app = %shared.app_name, "Connection idle, reconnecting before write");
            shared.disconnect(&mut session);
        }

        let identifier = session.allocate_sequence();
        let frame = encode_frame(
            identifier,
            &token,
            &payload,
            expiry_of(notification),
            priority_of(notification),
        );

        let mut last_error = String::new();
        for attempt in 0..=WRITE_RETRIES {
            if attempt > 0 {
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(WRITE_RETRY_DELAY) => {}
                }
            }

            if session.writer.is_none()
                && let Err(e) = shared.reconnect(&mut session).await
            {
                tracing::warn!(app = %shared.app_name, attempt, error = %e, "Reconnect failed");
                last_error = e.to_string();
                continue;
            }
            let Some(writer) = session.writer.as_mut() else {
                continue;
            };

            match shared.write(writer, &frame).await {
                Ok(()) => {
                    // Recorded before the lock is released, so the reader can
                    // never see an error frame for an unrecorded send.
                    session.buffer.push(
                        identifier,
                        SentFrame {
                            notification: notification.clone(),
                            frame,
                        },
                    );
                    session.total_written += 1;
                    session.last_used = Instant::now();
                    return Outcome::Delivered;
                }
                Err(e) => {
                    tracing::warn!(
                        app = %shared.app_name,
                        notification_id = %notification.id,
                        attempt,
                        error = %e,
                        "Gateway write failed, reconnecting"
                    );
                    last_error = e.to_string();
                    shared.disconnect(&mut session);
                }
            }
        }

        Outcome::Retry(RetryableError::new(format!(
            "Gateway write failed after {} reconnect attempts: {}",
            WRITE_RETRIES, last_error
        )))
    }

    /// Sequence ids currently held for error correlation, oldest first.
    pub async fn recorded_sequence_ids(&self) -> Vec<u32> {
        self.shared.session.lock().await.buffer.sequence_ids().collect()
    }
}

impl Drop for ApnsDispatcher {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[async_trait]
impl Dispatcher for ApnsDispatcher {
    async fn dispatch(&self, batch: &Batch) -> Result<DispatchReport, DispatchError> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for notification in batch.notifications() {
            outcomes.push(self.send(notification).await);
        }
        Ok(DispatchReport {
            outcomes,
            feedback: Vec::new(),
        })
    }

    fn take_late_outcomes(&self) -> Vec<LateOutcome> {
        std::mem::take(&mut *self.shared.late.lock())
    }

    /// Close the write side, then give the gateway one error-select interval
    /// to report a trailing error before the socket is dropped.
    async fn shutdown(&self) {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::SeqCst);

        let (writer, reader) = {
            let mut session = shared.session.lock().await;
            (session.writer.take(), session.reader.take())
        };

        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        if let Some(mut reader) = reader {
            if tokio::time::timeout(shared.config.error_select_timeout, &mut reader)
                .await
                .is_err()
            {
                reader.abort();
            }
        }
        shared.cancel.cancel();
        tracing::info!(app = %shared.app_name, "Gateway connection closed");
    }
}
