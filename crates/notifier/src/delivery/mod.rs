//! Provider dispatchers and outcome persistence.

pub mod adm;
pub mod apns;
pub mod feedback;
pub mod gcm;
pub mod outcome;
pub mod wpns;

pub use outcome::{DispatchReport, LateOutcome, Outcome, OutcomeRecorder};
