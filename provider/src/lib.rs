//! Voice-provider boundary.
//!
//! Everything the rest of the workspace knows about the synthesis
//! provider goes through the [`VoiceProvider`] trait; the HTTP client,
//! payload shapes, and error normalization live here and nowhere else.

pub mod client;
pub mod error;
pub mod types;

pub use client::{HttpVoiceProvider, VoiceProvider};
pub use error::ProviderError;
pub use types::{CallMetadata, CallRequest, ExecutionRef, UserData};
