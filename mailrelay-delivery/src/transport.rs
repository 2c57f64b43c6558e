use async_trait::async_trait;
use mailrelay_common::config::SmtpTimeouts;

use crate::{
    error::DeliveryError,
    session::SmtpSession,
    types::{Envelope, SessionReport, SessionTarget},
};

/// Runs one delivery session. The forwarder and the direct router only talk
/// to the network through this.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        target: &SessionTarget,
        envelope: &Envelope<'_>,
    ) -> Result<SessionReport, DeliveryError>;
}

/// SMTP over TCP, with per-step timeouts.
#[derive(Debug, Clone, Default)]
pub struct SmtpTransport {
    timeouts: SmtpTimeouts,
}

impl SmtpTransport {
    pub const fn new(timeouts: SmtpTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn deliver(
        &self,
        target: &SessionTarget,
        envelope: &Envelope<'_>,
    ) -> Result<SessionReport, DeliveryError> {
        SmtpSession::new(target, &self.timeouts)
            .execute(envelope)
            .await
    }
}
