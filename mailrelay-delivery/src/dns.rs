//! Mail exchanger lookup.
//!
//! [`DnsResolver`] looks up MX records with hickory and caches each answer
//! for the record TTL, clamped to the configured window. A domain without MX
//! records is treated as its own implicit exchanger when it has an address
//! record. The [`MxResolver`] trait is the seam the direct router depends on.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider, proto::rr::Record,
};
use mailrelay_common::{config::DnsConfig, outgoing};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

impl DnsError {
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }
}

/// One mail exchanger, as returned by resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    /// Host name without the trailing root dot, or an IP literal.
    pub host: String,
    /// MX preference; lower is tried first. 0 for an implicit exchanger.
    pub priority: u16,
}

impl MailServer {
    pub fn new(host: impl AsRef<str>, priority: u16) -> Self {
        Self {
            host: host.as_ref().trim_end_matches('.').to_string(),
            priority,
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self, port: u16) -> String {
        if self.host.contains(':') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }
}

#[async_trait]
pub trait MxResolver: Send + Sync {
    /// Exchangers for `domain`, most preferred first. Never empty on success.
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// hickory-backed resolver with a TTL-bounded cache.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Builds a resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// Fails if the system resolver configuration cannot be read.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = config.timeout();

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    async fn lookup(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(lookup) => {
                let ttl = min_ttl(lookup.as_lookup().records());
                let mut servers: Vec<MailServer> = lookup
                    .iter()
                    .map(|mx| MailServer::new(mx.exchange().to_utf8(), mx.preference()))
                    .filter(|server| !server.host.is_empty())
                    .collect();

                if servers.is_empty() {
                    return self.implicit_mx(domain).await;
                }

                servers.sort_by_key(|server| server.priority);
                Ok((servers, ttl))
            }
            Err(err) if err.is_no_records_found() => self.implicit_mx(domain).await,
            Err(err) => Err(err.into()),
        }
    }

    async fn implicit_mx(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        outgoing!(level = DEBUG, "No MX records for {domain}, trying A/AAAA");

        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) if lookup.iter().next().is_some() => Ok((
                vec![MailServer::new(domain, 0)],
                min_ttl(lookup.as_lookup().records()),
            )),
            Ok(_) => Err(DnsError::NoMailServers(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn min_ttl(records: &[Record]) -> u32 {
    records.iter().map(Record::ttl).min().unwrap_or(300)
}

#[async_trait]
impl MxResolver for DnsResolver {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&domain)
            && cached.expires_at > Instant::now()
        {
            return Ok(Arc::clone(&cached.servers));
        }

        let (servers, ttl) = tokio::time::timeout(self.config.timeout(), self.lookup(&domain))
            .await
            .map_err(|_| DnsError::Timeout(domain.clone()))??;

        let servers = Arc::new(servers);
        let cache_ttl = self.config.cache_ttl(Duration::from_secs(u64::from(ttl)));
        self.cache.insert(
            domain.clone(),
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + cache_ttl,
            },
        );

        outgoing!(
            level = DEBUG,
            "Resolved {} mail server(s) for {domain}, cached for {}s",
            servers.len(),
            cache_ttl.as_secs()
        );

        Ok(servers)
    }
}
