//! Failure kinds of the delivery pipeline.
//!
//! Every stage reports a [`DeliveryError`]. The dispatcher logs and swallows
//! them for intermediate stages; only [`DeliveryError::Persistence`] from the
//! terminal stage reaches the caller.

use mailrelay_smtp::ClientError;
use mailrelay_spool::SpoolError;
use thiserror::Error;

use crate::dns::DnsError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No relay provider is configured at all.
    #[error("No relay providers configured")]
    NoProvidersConfigured,

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Dial, greeting or TLS handshake failure.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Every recipient of one attempt was refused.
    #[error("All recipients rejected: {0}")]
    AllRecipientsRejected(String),

    /// Any other attempt failure eligible for retry.
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("All relay providers failed; last error: {last}")]
    ProvidersExhausted { last: Box<Self> },

    #[error("No mail exchanger accepted any of {0} recipient(s)")]
    MxRoutesExhausted(usize),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] SpoolError),
}

impl DeliveryError {
    /// Whether trying the same provider again might succeed.
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NoProvidersConfigured | Self::Configuration(_) | Self::Persistence(_)
        )
    }
}

impl From<ClientError> for DeliveryError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Io(_) | ClientError::TlsError(_) | ClientError::ConnectionClosed => {
                Self::ConnectionFailed(err.to_string())
            }
            ClientError::AuthUnsupported(_) => Self::AuthenticationFailed(err.to_string()),
            ClientError::SmtpError { .. } | ClientError::ParseError(_) | ClientError::Utf8Error(_) => {
                Self::Transient(err.to_string())
            }
        }
    }
}

impl From<DnsError> for DeliveryError {
    fn from(err: DnsError) -> Self {
        Self::Transient(err.to_string())
    }
}
