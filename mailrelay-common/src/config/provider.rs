//! Upstream relay accounts.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::mask_password;

/// How a connection to a relay is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// TLS from the first byte (typically port 465).
    Implicit,

    /// Plaintext, upgraded with STARTTLS when the server offers it.
    #[default]
    StartTls,
}

/// A string that is never shown in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(mask_password(&self.0))
    }
}

/// One configured upstream relay account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<Secret>,

    #[serde(default)]
    pub tls: TlsMode,

    /// Lower values are tried first.
    #[serde(default)]
    pub priority: u32,
}

const fn default_port() -> u16 {
    587
}

impl ProviderEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            tls: TlsMode::default(),
            priority: 0,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: &str) -> Self {
        self.username = Some(username.into());
        self.password = Some(Secret::new(password));
        self
    }

    #[must_use]
    pub const fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// The `host:port` pair to dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Username and password, only when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.expose().is_empty() => {
                Some((user.as_str(), pass.expose()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ProviderEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Orders providers by ascending priority, keeping configuration order for
/// equal priorities.
pub fn sort_by_priority(providers: &mut [ProviderEndpoint]) {
    // `sort_by_key` is stable.
    providers.sort_by_key(|p| p.priority);
}
