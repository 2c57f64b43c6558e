//! Delivery straight to each recipient domain's mail exchangers.

use std::sync::Arc;

use mailrelay_common::{
    address::{extract_domain, summarize_recipients},
    config::DirectDeliveryConfig,
    outgoing,
};

use crate::{
    dns::MxResolver,
    error::DeliveryError,
    transport::Transport,
    types::{Envelope, SessionTarget},
};

/// Which recipients a direct delivery reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectReport {
    pub delivered: Vec<String>,
    /// Recipients of domains where no exchanger accepted the session.
    pub undelivered: Vec<String>,
    /// Addresses with no usable domain part.
    pub skipped: Vec<String>,
}

pub struct DirectRouter {
    resolver: Arc<dyn MxResolver>,
    transport: Arc<dyn Transport>,
    config: DirectDeliveryConfig,
}

/// Recipients grouped by lowercase domain, in first-seen order.
fn group_by_domain(recipients: &[String]) -> (Vec<(String, Vec<String>)>, Vec<String>) {
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    let mut skipped = Vec::new();

    for recipient in recipients {
        let Some(domain) = extract_domain(recipient) else {
            outgoing!(
                level = WARN,
                "Skipping recipient without a domain: {recipient}"
            );
            skipped.push(recipient.clone());
            continue;
        };

        match groups.iter_mut().find(|(d, _)| *d == domain) {
            Some((_, members)) => members.push(recipient.clone()),
            None => groups.push((domain, vec![recipient.clone()])),
        }
    }

    (groups, skipped)
}

impl DirectRouter {
    pub fn new(
        resolver: Arc<dyn MxResolver>,
        transport: Arc<dyn Transport>,
        config: DirectDeliveryConfig,
    ) -> Self {
        Self {
            resolver,
            transport,
            config,
        }
    }

    /// Delivers to every recipient domain independently.
    ///
    /// Succeeds when at least one recipient anywhere was delivered; the rest
    /// are listed in the report.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::MxRoutesExhausted`] when nothing was delivered.
    pub async fn deliver_direct(
        &self,
        from: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<DirectReport, DeliveryError> {
        let ehlo_name = self
            .config
            .ehlo_domain
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| extract_domain(from))
            .unwrap_or_else(|| "localhost".to_string());

        let (groups, skipped) = group_by_domain(recipients);
        let mut report = DirectReport {
            skipped,
            ..DirectReport::default()
        };

        for (domain, members) in groups {
            let envelope = Envelope {
                from,
                to: &members,
                data,
            };

            if self.deliver_domain(&domain, &envelope, &ehlo_name).await {
                report.delivered.extend(members);
            } else {
                report.undelivered.extend(members);
            }
        }

        if report.delivered.is_empty() {
            return Err(DeliveryError::MxRoutesExhausted(recipients.len()));
        }

        if !report.undelivered.is_empty() {
            outgoing!(
                level = WARN,
                "Direct delivery left {} undelivered",
                summarize_recipients(&report.undelivered)
            );
        }

        Ok(report)
    }

    async fn deliver_domain(&self, domain: &str, envelope: &Envelope<'_>, ehlo_name: &str) -> bool {
        let servers = match self.resolver.resolve(domain).await {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => {
                outgoing!(level = WARN, "No mail servers for {domain}");
                return false;
            }
            Err(err) => {
                outgoing!(level = WARN, "MX lookup for {domain} failed: {err}");
                return false;
            }
        };

        for server in servers.iter() {
            let target = SessionTarget::mx(
                server,
                self.config.port,
                ehlo_name,
                self.config.insecure_skip_verify,
            );

            match self.transport.deliver(&target, envelope).await {
                Ok(_) => {
                    outgoing!(
                        level = INFO,
                        "Delivered to {} via {}",
                        summarize_recipients(envelope.to),
                        target.address
                    );
                    return true;
                }
                Err(err) => {
                    outgoing!(
                        level = WARN,
                        "Mail server {} for {domain} failed: {err}",
                        target.address
                    );
                }
            }
        }

        false
    }
}
