use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("Failed to read signing key {path}: {source}")]
    KeyRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse signing key: {0}")]
    KeyParse(String),

    #[error("Signing domain is not configured")]
    MissingDomain,

    #[error("Message has no header/body separator")]
    MalformedMessage,

    #[error("RSA signing failed: {0}")]
    Rsa(#[from] rsa::Error),
}

#[derive(Debug, Error)]
pub enum KeyGenError {
    #[error("Key already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{provider} produced unusable key material: {reason}")]
    Unusable {
        provider: &'static str,
        reason: String,
    },

    #[error("No key material provider succeeded")]
    NoProviderSucceeded,
}
