//! Push notification dispatch engine.
//!
//! [`app_runner::AppRunner`] owns one [`dispatcher::DispatcherLoop`] per app,
//! the [`feeder::Feeder`] moves due notifications from the store into their
//! queues, and the [`synchronizer::Synchronizer`] keeps the set of running
//! pools in line with the store.

pub mod app_runner;
pub mod batch;
pub mod connection;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod feeder;
pub mod queue;
pub mod retry;
pub mod ring_buffer;
pub mod synchronizer;

pub use app_runner::{AppChanges, AppRunner, DispatcherFactory, ProviderDispatchers};
pub use dispatcher::{Dispatcher, DispatcherLoop};
pub use feeder::Feeder;
pub use synchronizer::{SyncReport, Synchronizer};
