//! Relay forwarding with provider failover.
//!
//! Providers are tried in ascending priority (ties keep configuration
//! order). Each provider gets [`RetryConfig::attempts`] attempts with doubling
//! waits in between, and no wait after its last attempt. Recipient lists
//! larger than the batch size are split into consecutive chunks sent one
//! after another; the first failing chunk aborts the call.

use std::sync::Arc;

use mailrelay_common::{
    address::{extract_domain, summarize_recipients},
    config::{BatchConfig, ProviderEndpoint, RetryConfig, sort_by_priority},
    outgoing,
};

use crate::{
    error::DeliveryError,
    transport::Transport,
    types::{DeliveryOutcome, Envelope, SessionReport, SessionTarget},
};

pub struct ProviderForwarder {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    batch: BatchConfig,
}

impl ProviderForwarder {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryConfig, batch: BatchConfig) -> Self {
        Self {
            transport,
            retry,
            batch,
        }
    }

    /// Sends `data` from `from` to every recipient through the first provider
    /// that accepts each batch.
    ///
    /// # Errors
    ///
    /// - [`DeliveryError::NoProvidersConfigured`] for an empty provider list
    /// - [`DeliveryError::ProvidersExhausted`] with the last cause when every
    ///   provider failed a batch
    pub async fn forward(
        &self,
        providers: &[ProviderEndpoint],
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<SessionReport, DeliveryError> {
        if providers.is_empty() {
            return Err(DeliveryError::NoProvidersConfigured);
        }

        let mut ordered = providers.to_vec();
        sort_by_priority(&mut ordered);

        let ehlo_name = extract_domain(from).unwrap_or_else(|| "localhost".to_string());
        let batches: Vec<&[String]> = recipients.chunks(self.batch.size.max(1)).collect();
        let mut combined = SessionReport::default();

        for (index, batch) in batches.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.batch.delay()).await;
            }

            if batches.len() > 1 {
                outgoing!(
                    level = DEBUG,
                    "Forwarding batch {}/{} ({} recipients)",
                    index + 1,
                    batches.len(),
                    batch.len()
                );
            }

            let envelope = Envelope {
                from,
                to: batch,
                data,
            };

            let report = self.forward_batch(&ordered, &envelope, &ehlo_name).await?;
            combined.accepted.extend(report.accepted);
            combined.rejected.extend(report.rejected);
        }

        Ok(combined)
    }

    async fn forward_batch(
        &self,
        providers: &[ProviderEndpoint],
        envelope: &Envelope<'_>,
        ehlo_name: &str,
    ) -> Result<SessionReport, DeliveryError> {
        let mut last_error = DeliveryError::NoProvidersConfigured;

        for provider in providers {
            let target = SessionTarget::relay(provider, ehlo_name);

            match self.try_provider(provider, &target, envelope).await {
                Ok(report) => return Ok(report),
                Err(err) => {
                    outgoing!(
                        level = WARN,
                        "Provider {provider} failed, trying next: {err}"
                    );
                    last_error = err;
                }
            }
        }

        Err(DeliveryError::ProvidersExhausted {
            last: Box::new(last_error),
        })
    }

    async fn try_provider(
        &self,
        provider: &ProviderEndpoint,
        target: &SessionTarget,
        envelope: &Envelope<'_>,
    ) -> Result<SessionReport, DeliveryError> {
        let mut attempt = 1;

        loop {
            let result = self.transport.deliver(target, envelope).await;

            match DeliveryOutcome::of(&result) {
                DeliveryOutcome::Delivered => {
                    outgoing!(
                        level = INFO,
                        "Delivered to {} via {provider}",
                        summarize_recipients(envelope.to)
                    );
                }
                DeliveryOutcome::PartialRecipientFailure => {
                    outgoing!(
                        level = WARN,
                        "Delivered via {provider} with rejected recipients"
                    );
                }
                DeliveryOutcome::TransportFailure | DeliveryOutcome::AuthFailure => {}
            }

            let err = match result {
                Ok(report) => return Ok(report),
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(err);
            }

            let Some(wait) = self.retry.backoff_after(attempt) else {
                return Err(err);
            };

            outgoing!(
                level = WARN,
                "Attempt {attempt}/{} via {provider} failed: {err}; retrying in {wait:?}",
                self.retry.attempts
            );

            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}
