//! RSA-SHA256 header signing.

use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use mailrelay_common::{
    config::{DEFAULT_SIGNED_HEADERS, DkimConfig},
    internal,
};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey,
};
use sha2::{Digest, Sha256};

use crate::error::SignerError;

/// Who signs, and what.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub domain: String,
    pub selector: String,
    pub headers_to_sign: Vec<String>,
    /// Seconds a signature stays valid; 0 disables the `x=` tag.
    pub expiry_secs: u64,
}

impl From<&DkimConfig> for SigningIdentity {
    /// An empty header list falls back to [`DEFAULT_SIGNED_HEADERS`].
    fn from(config: &DkimConfig) -> Self {
        let headers_to_sign = if config.headers_to_sign.is_empty() {
            DEFAULT_SIGNED_HEADERS.map(String::from).to_vec()
        } else {
            config.headers_to_sign.clone()
        };

        Self {
            domain: config.domain.clone(),
            selector: config.selector.clone(),
            headers_to_sign,
            expiry_secs: config.signature_expiry_secs,
        }
    }
}

/// Signs outbound messages with a key loaded once at construction.
pub struct DkimSigner {
    identity: SigningIdentity,
    private_key: RsaPrivateKey,
}

impl fmt::Debug for DkimSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DkimSigner")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl DkimSigner {
    /// Builds a signer from configuration, reading the PEM key from
    /// [`DkimConfig::key_path`].
    pub fn from_config(config: &DkimConfig) -> Result<Self, SignerError> {
        let path = config.key_path();
        let pem = std::fs::read_to_string(&path)
            .map_err(|source| SignerError::KeyRead { path, source })?;

        Self::from_pem(SigningIdentity::from(config), &pem)
    }

    /// Builds a signer from an in-memory PEM key (PKCS#8 or PKCS#1).
    pub fn from_pem(identity: SigningIdentity, pem: &str) -> Result<Self, SignerError> {
        if identity.domain.trim().is_empty() {
            return Err(SignerError::MissingDomain);
        }

        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| SignerError::KeyParse(e.to_string()))?;

        internal!(
            level = INFO,
            "Signer ready for domain {} (selector {})",
            identity.domain,
            identity.selector
        );

        Ok(Self {
            identity,
            private_key,
        })
    }

    pub const fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Signs `message` with the current time as the signature timestamp.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SignerError> {
        self.sign_at(message, chrono::Utc::now().timestamp())
    }

    /// Signs `message` as if at `timestamp` (Unix seconds).
    pub fn sign_at(&self, message: &[u8], timestamp: i64) -> Result<Vec<u8>, SignerError> {
        let metadata = self.signature_metadata(message, timestamp)?;

        let digest = Sha256::digest(metadata.as_bytes());
        let signature = self
            .private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)?;

        let header = format!(
            "DKIM-Signature: {metadata} b={}\r\n",
            BASE64.encode(signature)
        );

        let mut signed = Vec::with_capacity(header.len() + message.len());
        signed.extend_from_slice(header.as_bytes());
        signed.extend_from_slice(message);
        Ok(signed)
    }

    /// The tag list that gets signed, without the `b=` value.
    pub fn signature_metadata(&self, message: &[u8], timestamp: i64) -> Result<String, SignerError> {
        let (headers, body) = split_message(message).ok_or(SignerError::MalformedMessage)?;

        let present = header_names(headers);
        let signed_headers: Vec<String> = self
            .identity
            .headers_to_sign
            .iter()
            .filter(|wanted| present.iter().any(|name| name.eq_ignore_ascii_case(wanted)))
            .map(|name| name.to_ascii_lowercase())
            .collect();

        let SigningIdentity {
            domain,
            selector,
            expiry_secs,
            ..
        } = &self.identity;

        let mut metadata = format!(
            "v=1; a=rsa-sha256; c=relaxed/relaxed; d={domain}; s={selector}; t={timestamp}; i=@{domain}; h={}; bh={};",
            signed_headers.join(":"),
            body_hash(body),
        );

        if *expiry_secs > 0 {
            let expiry = timestamp.saturating_add(i64::try_from(*expiry_secs).unwrap_or(i64::MAX));
            metadata.push_str(&format!(" x={expiry};"));
        }

        Ok(metadata)
    }
}

/// Splits at the first empty line, accepting both CRLF and bare LF.
fn split_message(message: &[u8]) -> Option<(&[u8], &[u8])> {
    if let Some(body) = message.strip_prefix(b"\r\n") {
        return Some((&[], body));
    }
    if let Some(body) = message.strip_prefix(b"\n") {
        return Some((&[], body));
    }

    message
        .iter()
        .enumerate()
        .filter(|&(_, &b)| b == b'\n')
        .find_map(|(i, _)| {
            let rest = &message[i + 1..];
            if rest.starts_with(b"\r\n") {
                Some((&message[..i], &rest[2..]))
            } else if rest.starts_with(b"\n") {
                Some((&message[..i], &rest[1..]))
            } else {
                None
            }
        })
}

/// Names of the header fields present, ignoring folded continuation lines.
fn header_names(headers: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(headers)
        .lines()
        .filter(|line| !line.starts_with([' ', '\t']))
        .filter_map(|line| line.split_once(':'))
        .map(|(name, _)| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Base64 SHA-256 of the body with every line ending normalized to CRLF.
fn body_hash(body: &[u8]) -> String {
    let mut canonical = Vec::with_capacity(body.len() + body.len() / 32);
    let mut previous = None;

    for &byte in body {
        if byte == b'\n' && previous != Some(b'\r') {
            canonical.push(b'\r');
        }
        canonical.push(byte);
        previous = Some(byte);
    }

    BASE64.encode(Sha256::digest(&canonical))
}
