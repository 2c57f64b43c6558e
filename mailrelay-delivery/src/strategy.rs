//! The closed set of delivery paths the dispatcher sequences.

use std::{fmt, sync::Arc};

use mailrelay_common::{MailJob, config::ProviderEndpoint};
use mailrelay_spool::FallbackStore;

use crate::{direct::DirectRouter, error::DeliveryError, forwarder::ProviderForwarder};

#[derive(Clone)]
pub enum DeliveryStrategy {
    /// Straight to each recipient domain's mail exchangers.
    Direct(Arc<DirectRouter>),

    /// Through the configured relay providers.
    Relay {
        forwarder: Arc<ProviderForwarder>,
        providers: Arc<[ProviderEndpoint]>,
    },

    /// Envelope-prefixed copy in the local mail directory.
    LocalCopy(Arc<FallbackStore>),

    /// Failed-job record for the replay sweep.
    Requeue(Arc<FallbackStore>),
}

impl DeliveryStrategy {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Direct(_) => "direct",
            Self::Relay { .. } => "relay",
            Self::LocalCopy(_) => "local-copy",
            Self::Requeue(_) => "requeue",
        }
    }

    /// Persisting strategies end the pipeline: their failure is the caller's
    /// problem rather than a reason to try something else.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::LocalCopy(_) | Self::Requeue(_))
    }

    /// Runs this path once for `job`.
    ///
    /// # Errors
    ///
    /// Whatever the underlying router, forwarder or store reported.
    pub async fn attempt_delivery(&self, job: &MailJob) -> Result<(), DeliveryError> {
        match self {
            Self::Direct(router) => router
                .deliver_direct(&job.from, &job.to, &job.data)
                .await
                .map(drop),
            Self::Relay {
                forwarder,
                providers,
            } => forwarder
                .forward(providers, &job.from, &job.to, &job.data)
                .await
                .map(drop),
            Self::LocalCopy(store) => store.save_locally(job).await.map(drop).map_err(Into::into),
            Self::Requeue(store) => store.save_failed(job).await.map(drop).map_err(Into::into),
        }
    }
}

impl fmt::Debug for DeliveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for DeliveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
