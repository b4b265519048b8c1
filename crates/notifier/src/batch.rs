//! Multicast grouping and per-recipient result demultiplexing.

use chrono::{DateTime, Utc};

use pushgate_common::types::{Notification, TokenFeedback};

use crate::delivery::{DispatchReport, Outcome};
use crate::error::{DeliveryError, RetryableError};
use crate::queue::QueuePayload;

/// One device token of one batch member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Index of the owning payload in the batch.
    pub member: usize,
    pub token: String,
}

/// Provider verdict for one recipient.
#[derive(Debug, Clone, PartialEq)]
pub enum RecipientResult {
    Delivered { canonical_token: Option<String> },
    /// The provider will never accept this token again.
    InvalidToken { reason: String },
    /// Rejected for a reason unrelated to the token.
    Rejected { reason: String },
    /// Transient. The recipient may be retried.
    Unavailable {
        reason: String,
        retry_after: Option<DateTime<Utc>>,
    },
}

/// Notifications sent together in one provider request.
#[derive(Debug, Clone)]
pub struct Batch {
    payloads: Vec<QueuePayload>,
}

impl Batch {
    pub fn new(payloads: Vec<QueuePayload>) -> Self {
        Self { payloads }
    }

    pub fn single(payload: QueuePayload) -> Self {
        Self {
            payloads: vec![payload],
        }
    }

    pub fn payloads(&self) -> &[QueuePayload] {
        &self.payloads
    }

    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.payloads.iter().map(|p| &p.notification)
    }

    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Every recipient in member order, then token order.
    pub fn recipients(&self) -> Vec<Recipient> {
        self.payloads
            .iter()
            .enumerate()
            .flat_map(|(member, payload)| {
                payload
                    .notification
                    .tokens
                    .iter()
                    .map(move |token| Recipient {
                        member,
                        token: token.clone(),
                    })
            })
            .collect()
    }

    /// The same transient error for every member.
    pub fn retry_all(&self, error: RetryableError) -> DispatchReport {
        DispatchReport {
            outcomes: self
                .payloads
                .iter()
                .map(|_| Outcome::Retry(error.clone()))
                .collect(),
            feedback: Vec::new(),
        }
    }

    /// The same permanent error for every member.
    pub fn fail_all(&self, error: DeliveryError) -> DispatchReport {
        DispatchReport {
            outcomes: self
                .payloads
                .iter()
                .map(|_| Outcome::Failed(error.clone()))
                .collect(),
            feedback: Vec::new(),
        }
    }

    /// Fold per-recipient results, aligned with [`Batch::recipients`], back
    /// onto each member notification.
    ///
    /// Each member is judged only by its own recipients. Missing results
    /// count as unavailable.
    pub fn demultiplex(&self, results: &[RecipientResult]) -> DispatchReport {
        let recipients = self.recipients();
        let mut per_member: Vec<Vec<(usize, &str, RecipientResult)>> =
            vec![Vec::new(); self.payloads.len()];
        let mut feedback = Vec::new();

        for (position, recipient) in recipients.iter().enumerate() {
            let result = results
                .get(position)
                .cloned()
                .unwrap_or(RecipientResult::Unavailable {
                    reason: "No result returned for recipient".to_string(),
                    retry_after: None,
                });
            let app_id = self.payloads[recipient.member].notification.app_id;

            match &result {
                RecipientResult::Delivered {
                    canonical_token: Some(new_token),
                } if *new_token != recipient.token => {
                    feedback.push(TokenFeedback::canonical(
                        app_id,
                        recipient.token.clone(),
                        new_token.clone(),
                    ));
                }
                RecipientResult::InvalidToken { reason } => {
                    feedback.push(TokenFeedback::invalid(
                        app_id,
                        recipient.token.clone(),
                        reason.clone(),
                    ));
                }
                _ => {}
            }

            let index = per_member[recipient.member].len();
            per_member[recipient.member].push((index, recipient.token.as_str(), result));
        }

        let outcomes = per_member
            .iter()
            .map(|results| member_outcome(results))
            .collect();

        DispatchReport { outcomes, feedback }
    }
}

fn member_outcome(results: &[(usize, &str, RecipientResult)]) -> Outcome {
    let failures: Vec<&(usize, &str, RecipientResult)> = results
        .iter()
        .filter(|(_, _, r)| !matches!(r, RecipientResult::Delivered { .. }))
        .collect();

    if failures.is_empty() {
        return Outcome::Delivered;
    }

    let unavailable: Vec<&(usize, &str, RecipientResult)> = failures
        .iter()
        .copied()
        .filter(|(_, _, r)| matches!(r, RecipientResult::Unavailable { .. }))
        .collect();

    if unavailable.len() == results.len() {
        let retry_after = unavailable
            .iter()
            .filter_map(|(_, _, r)| match r {
                RecipientResult::Unavailable { retry_after, .. } => *retry_after,
                _ => None,
            })
            .max();
        return Outcome::Retry(
            RetryableError::new(reason_of(&unavailable[0].2)).with_retry_after(retry_after),
        );
    }

    let indexes: Vec<String> = failures.iter().map(|(i, _, _)| i.to_string()).collect();
    let mut reasons: Vec<&str> = Vec::new();
    for (_, _, result) in &failures {
        let reason = reason_of(result);
        if !reasons.contains(&reason) {
            reasons.push(reason);
        }
    }
    let error = DeliveryError::new(
        None,
        format!(
            "Failed to deliver to recipients {} ({})",
            indexes.join(", "),
            reasons.join(", ")
        ),
    );

    if unavailable.is_empty() {
        Outcome::Failed(error)
    } else {
        Outcome::PartiallyFailed {
            error,
            retry_tokens: unavailable.iter().map(|(_, t, _)| t.to_string()).collect(),
        }
    }
}

fn reason_of(result: &RecipientResult) -> &str {
    match result {
        RecipientResult::Delivered { .. } => "Delivered",
        RecipientResult::InvalidToken { reason }
        | RecipientResult::Rejected { reason }
        | RecipientResult::Unavailable { reason, .. } => reason,
    }
}
