//! Core contract of the API link layer.
//!
//! This crate defines the error taxonomy and classifier, retry policy,
//! connectivity state machine, event bus and configuration surface. It does no
//! network or storage I/O.

/// Typed publish/subscribe channel.
pub mod channel;
/// Wall-clock abstraction.
pub mod clock;
/// Environment-backed configuration.
pub mod config;
/// Classified errors and the pure response classifier.
pub mod error;
/// Mapping of terminal failures to broadcast events.
pub mod normalization;
/// Backoff policy and retry loop.
pub mod retry;
/// Connectivity state machine.
pub mod state_machine;
/// Shared protocol types (error classes, statuses, events).
pub mod types;

pub use channel::{EventBus, EventBusError, EventStream, drain_events, next_event};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, LinkConfig};
pub use error::{Classification, ClassifiedError, classify, classify_http_status, is_cors_message};
pub use normalization::{clears_credential, failure_events};
pub use retry::{RetryPolicy, with_retry};
pub use state_machine::{ConnectivityMachine, DegradedDirective, ProbeOutcome, Transition};
pub use types::{
    ConnectivityState, CredentialAction, ErrorClass, LinkEvent, LinkStatus, Notice,
    RequestPurpose,
};
