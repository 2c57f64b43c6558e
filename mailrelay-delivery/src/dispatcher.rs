//! Per-job sequencing of delivery paths.
//!
//! The plan is built once from configuration: optional direct delivery,
//! optional relay forwarding, then exactly one persisting stage chosen by
//! [`FallbackMode`]. The first path to succeed ends the job. Failures of
//! non-terminal paths are logged and the next path runs; only a failure of
//! the persisting stage is returned.

use std::{path::PathBuf, sync::Arc};

use mailrelay_common::{
    MailJob,
    config::{FallbackMode, RelayConfig},
    internal,
};
use mailrelay_dkim::DkimSigner;
use mailrelay_spool::FallbackStore;

use crate::{
    direct::DirectRouter,
    dns::MxResolver,
    error::DeliveryError,
    forwarder::ProviderForwarder,
    strategy::DeliveryStrategy,
    transport::Transport,
};

/// Collaborators the dispatcher is wired with.
pub struct Services {
    pub transport: Arc<dyn Transport>,
    pub resolver: Arc<dyn MxResolver>,
    pub store: Arc<FallbackStore>,
    pub signer: Option<Arc<DkimSigner>>,
}

/// How a job left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// A remote server accepted it.
    Delivered { via: &'static str },
    /// Nothing accepted it; it was persisted instead.
    Stored { via: &'static str },
}

pub struct Dispatcher {
    signer: Option<Arc<DkimSigner>>,
    plan: Vec<DeliveryStrategy>,
    replay_plan: Vec<DeliveryStrategy>,
    store: Arc<FallbackStore>,
    fallback_mode: FallbackMode,
}

impl Dispatcher {
    pub fn new(config: &RelayConfig, services: Services) -> Self {
        let Services {
            transport,
            resolver,
            store,
            signer,
        } = services;

        let direct = config.direct_delivery.enabled.then(|| {
            DeliveryStrategy::Direct(Arc::new(DirectRouter::new(
                resolver,
                Arc::clone(&transport),
                config.direct_delivery.clone(),
            )))
        });

        let providers: Arc<[_]> = config.providers().into();
        let relay = (!providers.is_empty()).then(|| DeliveryStrategy::Relay {
            forwarder: Arc::new(ProviderForwarder::new(
                transport,
                config.retry,
                config.batch,
            )),
            providers,
        });

        let fallback_mode = config.storage.fallback_mode;
        let terminal = match fallback_mode {
            FallbackMode::LocalCopy => DeliveryStrategy::LocalCopy(Arc::clone(&store)),
            FallbackMode::Requeue => DeliveryStrategy::Requeue(Arc::clone(&store)),
        };

        let replay_plan = direct
            .clone()
            .filter(|_| config.replay.include_direct)
            .into_iter()
            .chain(relay.clone())
            .collect();

        let plan = direct.into_iter().chain(relay).chain([terminal]).collect();

        Self {
            signer,
            plan,
            replay_plan,
            store,
            fallback_mode,
        }
    }

    pub fn plan(&self) -> &[DeliveryStrategy] {
        &self.plan
    }

    pub fn replay_plan(&self) -> &[DeliveryStrategy] {
        &self.replay_plan
    }

    /// The job as it will be sent: signed when a signer is configured, and
    /// unchanged when signing fails.
    pub fn prepare(&self, job: &MailJob) -> MailJob {
        let Some(signer) = &self.signer else {
            return job.clone();
        };

        match signer.sign(&job.data) {
            Ok(signed) => {
                internal!(level = DEBUG, "[{}] Message signed", job.id);
                MailJob {
                    data: signed.into(),
                    ..job.clone()
                }
            }
            Err(err) => {
                internal!(
                    level = WARN,
                    "[{}] Signing failed, sending unsigned: {err}",
                    job.id
                );
                job.clone()
            }
        }
    }

    /// Runs the plan for `job` until a path succeeds.
    ///
    /// # Errors
    ///
    /// Only the persisting stage's own failure, as
    /// [`DeliveryError::Persistence`].
    pub async fn deliver(&self, job: &MailJob) -> Result<Disposition, DeliveryError> {
        let prepared = self.prepare(job);

        for strategy in &self.plan {
            internal!(level = DEBUG, "[{}] Trying {strategy}", job.id);

            match strategy.attempt_delivery(&prepared).await {
                Ok(()) if strategy.is_terminal() => {
                    return Ok(Disposition::Stored {
                        via: strategy.name(),
                    });
                }
                Ok(()) => {
                    return Ok(Disposition::Delivered {
                        via: strategy.name(),
                    });
                }
                Err(err) if strategy.is_terminal() => return Err(err),
                Err(err) => {
                    internal!(
                        level = WARN,
                        "[{}] {strategy} delivery failed, falling through: {err}",
                        job.id
                    );
                }
            }
        }

        Err(DeliveryError::Configuration(
            "delivery plan has no persisting stage".to_string(),
        ))
    }

    /// Retries a previously failed job. Never signs and never persists.
    ///
    /// # Errors
    ///
    /// The last path's error, or [`DeliveryError::NoProvidersConfigured`]
    /// when there is nothing to replay through.
    pub async fn replay(&self, job: &MailJob) -> Result<Disposition, DeliveryError> {
        let mut last_error = DeliveryError::NoProvidersConfigured;

        for strategy in &self.replay_plan {
            match strategy.attempt_delivery(job).await {
                Ok(()) => {
                    return Ok(Disposition::Delivered {
                        via: strategy.name(),
                    });
                }
                Err(err) => {
                    internal!(
                        level = WARN,
                        "[{}] Replay via {strategy} failed: {err}",
                        job.id
                    );
                    last_error = err;
                }
            }
        }

        Err(last_error)
    }

    /// Persists `job` through the path the terminal stage did not use, after
    /// [`Self::deliver`] failed.
    ///
    /// # Errors
    ///
    /// The store's error; the job is then lost.
    pub async fn rescue(&self, job: &MailJob) -> Result<PathBuf, DeliveryError> {
        let saved = match self.fallback_mode {
            FallbackMode::LocalCopy => self.store.save_failed(job).await?,
            FallbackMode::Requeue => self.store.save_locally(job).await?,
        };

        Ok(saved)
    }
}
