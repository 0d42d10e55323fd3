//! Terminal-event intake with bounded retries.
//!
//! The provider's webhook payloads arrive through [`RetryPipeline::submit`].
//! Processing failures never drop an event: jobs retry on a fixed
//! backoff schedule and land in the dead-letter queue once attempts are
//! exhausted. The processor contract is idempotent by execution id, so
//! at-least-once delivery yields exactly-once effective processing.

pub mod event;
pub mod pipeline;
pub mod processor;

pub use event::TerminalEvent;
pub use pipeline::{DeadLetter, RetryConfig, RetryPipeline};
pub use processor::{CallEventProcessor, TerminalEventProcessor};
