//! Per-step timeouts for outbound SMTP sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Every network step of a delivery session is bounded by one of these, so a
/// stalled remote can never hold a worker indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// TCP connect plus greeting (and the TLS handshake for implicit TLS).
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::connect")]
    pub connect_secs: u64,

    /// Default: 30 seconds
    #[serde(default = "defaults::ehlo")]
    pub ehlo_secs: u64,

    /// STARTTLS command and the handshake that follows it.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::starttls")]
    pub starttls_secs: u64,

    /// Default: 30 seconds
    #[serde(default = "defaults::auth")]
    pub auth_secs: u64,

    /// Default: 30 seconds
    #[serde(default = "defaults::mail_from")]
    pub mail_from_secs: u64,

    /// Applied to each RCPT TO individually.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::rcpt_to")]
    pub rcpt_to_secs: u64,

    /// DATA command and message transmission.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::data")]
    pub data_secs: u64,

    /// Default: 10 seconds
    #[serde(default = "defaults::quit")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect(),
            ehlo_secs: defaults::ehlo(),
            starttls_secs: defaults::starttls(),
            auth_secs: defaults::auth(),
            mail_from_secs: defaults::mail_from(),
            rcpt_to_secs: defaults::rcpt_to(),
            data_secs: defaults::data(),
            quit_secs: defaults::quit(),
        }
    }
}

impl SmtpTimeouts {
    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub const fn ehlo(&self) -> Duration {
        Duration::from_secs(self.ehlo_secs)
    }

    pub const fn starttls(&self) -> Duration {
        Duration::from_secs(self.starttls_secs)
    }

    pub const fn auth(&self) -> Duration {
        Duration::from_secs(self.auth_secs)
    }

    pub const fn mail_from(&self) -> Duration {
        Duration::from_secs(self.mail_from_secs)
    }

    pub const fn rcpt_to(&self) -> Duration {
        Duration::from_secs(self.rcpt_to_secs)
    }

    pub const fn data(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    pub const fn quit(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }
}

mod defaults {
    pub const fn connect() -> u64 {
        30
    }

    pub const fn ehlo() -> u64 {
        30
    }

    pub const fn starttls() -> u64 {
        30
    }

    pub const fn auth() -> u64 {
        30
    }

    pub const fn mail_from() -> u64 {
        30
    }

    pub const fn rcpt_to() -> u64 {
        30
    }

    pub const fn data() -> u64 {
        120
    }

    pub const fn quit() -> u64 {
        10
    }
}
