//! The unit of work flowing through the delivery pipeline.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("A mail job needs at least one recipient")]
    NoRecipients,

    #[error("Invalid job identifier: {0:?}")]
    InvalidId(String),
}

/// An accepted message waiting to be delivered.
///
/// The raw message bytes are shared and never mutated once the job exists;
/// a signed copy is produced alongside the job rather than written back into it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailJob {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub data: Arc<[u8]>,
    pub created_at: DateTime<Utc>,
}

impl MailJob {
    /// Create a job with a freshly generated ULID identifier.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NoRecipients`] if `to` is empty.
    pub fn new(
        from: impl Into<String>,
        to: Vec<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<Self, JobError> {
        Self::with_id(Ulid::new().to_string(), from, to, data)
    }

    /// Create a job with a caller-supplied identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if there are no recipients, or the identifier could
    /// not safely be used as a file name.
    pub fn with_id(
        id: impl Into<String>,
        from: impl Into<String>,
        to: Vec<String>,
        data: impl Into<Arc<[u8]>>,
    ) -> Result<Self, JobError> {
        let id = id.into();
        if !is_valid_id(&id) {
            return Err(JobError::InvalidId(id));
        }

        if to.is_empty() {
            return Err(JobError::NoRecipients);
        }

        Ok(Self {
            id,
            from: from.into(),
            to,
            data: data.into(),
            created_at: Utc::now(),
        })
    }

    pub fn recipient_count(&self) -> usize {
        self.to.len()
    }
}

impl fmt::Debug for MailJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailJob")
            .field("id", &self.id)
            .field("from", &self.from)
            .field("to", &self.to)
            .field("size", &self.data.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Job identifiers double as file names in the failed-job store, so only a
/// conservative character set is accepted.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
