//! Durable fallback storage.
//!
//! Two independent directories back the last stage of the pipeline:
//!
//! - the local directory receives a human-readable `.eml` copy of a message
//!   that no delivery path accepted
//! - the failed directory holds one bincode record per job, keyed by job id,
//!   which the replay sweep consumes

pub mod error;
mod store;

pub use error::{Result, SerializationError, SpoolError};
pub use store::FallbackStore;
