//! Herald notification dispatch core.
//!
//! Requests are accepted by the [`coordinator::DeliveryCoordinator`], queued
//! per channel, delivered by the channel's [`transport::ChannelTransport`] and
//! retried according to the [`retry::RetryPolicy`].

pub mod coordinator;
pub mod ledger;
pub mod queue;
pub mod retry;
pub mod sink;
pub mod supervisor;
pub mod transport;

pub use coordinator::{CancelError, DeliveryCoordinator, SubmitError};
