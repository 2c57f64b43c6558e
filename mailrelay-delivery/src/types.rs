use mailrelay_common::config::{ProviderEndpoint, Secret, TlsMode};

use crate::{dns::MailServer, error::DeliveryError};

/// The message half of one SMTP transaction.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub from: &'a str,
    pub to: &'a [String],
    pub data: &'a [u8],
}

/// Where and how one session connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    /// `host:port` to dial.
    pub address: String,
    /// Name checked against the server certificate.
    pub server_name: String,
    pub tls: TlsMode,
    pub credentials: Option<(String, Secret)>,
    pub accept_invalid_certs: bool,
    /// Name announced in EHLO/HELO.
    pub ehlo_name: String,
}

impl SessionTarget {
    pub fn relay(provider: &ProviderEndpoint, ehlo_name: impl Into<String>) -> Self {
        Self {
            address: provider.address(),
            server_name: provider.host.clone(),
            tls: provider.tls,
            credentials: provider
                .credentials()
                .map(|(user, pass)| (user.to_string(), Secret::new(pass))),
            accept_invalid_certs: false,
            ehlo_name: ehlo_name.into(),
        }
    }

    pub fn mx(
        server: &MailServer,
        port: u16,
        ehlo_name: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Self {
        Self {
            address: server.address(port),
            server_name: server.host.clone(),
            tls: TlsMode::StartTls,
            credentials: None,
            accept_invalid_certs,
            ehlo_name: ehlo_name.into(),
        }
    }
}

/// What the server accepted during a completed session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub accepted: Vec<String>,
    /// Recipient, reply code, reply text.
    pub rejected: Vec<(String, u16, String)>,
}

/// Classification of a single delivery attempt, used for logging and control
/// flow only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    PartialRecipientFailure,
    TransportFailure,
    AuthFailure,
}

impl DeliveryOutcome {
    pub fn of(result: &Result<SessionReport, DeliveryError>) -> Self {
        match result {
            Ok(report) if report.rejected.is_empty() => Self::Delivered,
            Ok(_) => Self::PartialRecipientFailure,
            Err(DeliveryError::AuthenticationFailed(_)) => Self::AuthFailure,
            Err(_) => Self::TransportFailure,
        }
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Delivered | Self::PartialRecipientFailure)
    }
}
