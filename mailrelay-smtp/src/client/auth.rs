//! SASL mechanisms for `AUTH`.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

/// Mechanisms the client can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    /// Picks the preferred mechanism from an EHLO `AUTH` list.
    ///
    /// PLAIN is preferred. When the server lists nothing at all we still try
    /// PLAIN, since many relays accept it without advertising.
    pub fn choose(offered: &[String]) -> Option<Self> {
        if offered.is_empty() || offered.iter().any(|m| m == "PLAIN") {
            Some(Self::Plain)
        } else if offered.iter().any(|m| m == "LOGIN") {
            Some(Self::Login)
        } else {
            None
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

/// The RFC 4616 initial response: `\0username\0password`, base64 encoded.
pub(super) fn plain_initial_response(username: &str, password: &str) -> String {
    let mut raw = Vec::with_capacity(username.len() + password.len() + 2);
    raw.push(0);
    raw.extend_from_slice(username.as_bytes());
    raw.push(0);
    raw.extend_from_slice(password.as_bytes());
    BASE64.encode(raw)
}

pub(super) fn encode(value: &str) -> String {
    BASE64.encode(value.as_bytes())
}
