//! Key pair generation and the DNS record that publishes the public half.
//!
//! Generation tries each [`KeyMaterialProvider`] in turn and keeps the first
//! result that actually parses. The system `openssl` binary is preferred when
//! present; otherwise keys are generated in-process.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use mailrelay_common::internal;
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding},
};

use crate::error::KeyGenError;

pub const DEFAULT_KEY_BITS: usize = 2048;

/// A private key in PEM and its public half as DER `SubjectPublicKeyInfo`.
#[derive(Clone)]
pub struct KeyMaterial {
    pub private_pem: String,
    pub public_der: Vec<u8>,
}

impl KeyMaterial {
    /// Both halves must parse, and belong to each other.
    pub fn validate(&self, provider: &'static str) -> Result<(), KeyGenError> {
        let unusable = |reason: String| KeyGenError::Unusable { provider, reason };

        if self.public_der.is_empty() {
            return Err(unusable("empty public key".to_string()));
        }

        let private = RsaPrivateKey::from_pkcs8_pem(&self.private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&self.private_pem))
            .map_err(|e| unusable(format!("private key: {e}")))?;
        let public = RsaPublicKey::from_public_key_der(&self.public_der)
            .map_err(|e| unusable(format!("public key: {e}")))?;

        if RsaPublicKey::from(&private) != public {
            return Err(unusable("public key does not match private key".to_string()));
        }

        Ok(())
    }
}

pub trait KeyMaterialProvider {
    fn name(&self) -> &'static str;

    fn generate(&self, bits: usize) -> Result<KeyMaterial, KeyGenError>;
}

/// Shells out to `openssl genrsa` / `openssl rsa -pubout`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpensslProvider;

impl OpensslProvider {
    fn run(args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>, KeyGenError> {
        let mut child = Command::new("openssl")
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(KeyGenError::Unusable {
                provider: "openssl",
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

impl KeyMaterialProvider for OpensslProvider {
    fn name(&self) -> &'static str {
        "openssl"
    }

    fn generate(&self, bits: usize) -> Result<KeyMaterial, KeyGenError> {
        let bits = bits.to_string();
        let private = Self::run(&["genrsa", &bits], None)?;
        let public_der = Self::run(&["rsa", "-pubout", "-outform", "DER"], Some(&private))?;

        let private_pem = String::from_utf8(private).map_err(|e| KeyGenError::Unusable {
            provider: "openssl",
            reason: e.to_string(),
        })?;

        Ok(KeyMaterial {
            private_pem,
            public_der,
        })
    }
}

/// Generates with the `rsa` crate and the OS random source.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessProvider;

impl KeyMaterialProvider for InProcessProvider {
    fn name(&self) -> &'static str {
        "in-process"
    }

    fn generate(&self, bits: usize) -> Result<KeyMaterial, KeyGenError> {
        let unusable = |reason: String| KeyGenError::Unusable {
            provider: "in-process",
            reason,
        };

        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
            .map_err(|e| unusable(e.to_string()))?;
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| unusable(e.to_string()))?
            .to_string();
        let public_der = RsaPublicKey::from(&private)
            .to_public_key_der()
            .map_err(|e| unusable(e.to_string()))?
            .into_vec();

        Ok(KeyMaterial {
            private_pem,
            public_der,
        })
    }
}

pub fn default_providers() -> Vec<Box<dyn KeyMaterialProvider>> {
    vec![Box::new(OpensslProvider), Box::new(InProcessProvider)]
}

/// Paths written by [`generate_keys`], and the TXT record to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKeys {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    pub dns_record: PathBuf,
    pub txt_record: String,
    pub provider: &'static str,
}

/// Generates a key pair for `selector._domainkey.domain` under
/// `out_dir/domain/`.
///
/// # Errors
///
/// Refuses to overwrite an existing private key. Fails with
/// [`KeyGenError::NoProviderSucceeded`] when every provider errored or
/// produced material that does not validate.
pub fn generate_keys(
    out_dir: &Path,
    domain: &str,
    selector: &str,
    bits: usize,
    providers: &[Box<dyn KeyMaterialProvider>],
) -> Result<GeneratedKeys, KeyGenError> {
    let dir = out_dir.join(domain);
    let private_key = dir.join(format!("{selector}.private"));
    let public_key = dir.join(format!("{selector}.public"));
    let dns_record = dir.join(format!("{selector}.txt"));

    if private_key.exists() {
        return Err(KeyGenError::AlreadyExists(private_key));
    }

    let (material, provider) = providers
        .iter()
        .find_map(|provider| {
            let attempt = provider
                .generate(bits)
                .and_then(|material| material.validate(provider.name()).map(|()| material));

            match attempt {
                Ok(material) => Some((material, provider.name())),
                Err(err) => {
                    internal!(
                        level = WARN,
                        "Key provider {} failed: {err}",
                        provider.name()
                    );
                    None
                }
            }
        })
        .ok_or(KeyGenError::NoProviderSucceeded)?;

    let public_pem = public_pem(&material.public_der, provider)?;

    fs::create_dir_all(&dir)?;
    write_private(&private_key, material.private_pem.as_bytes())?;
    fs::write(&public_key, public_pem)?;

    let txt_record = txt_record(domain, selector, &material.public_der);
    fs::write(&dns_record, format!("{txt_record}\n"))?;

    internal!(
        level = INFO,
        "Generated {bits}-bit key for {selector}._domainkey.{domain} using {provider}"
    );

    Ok(GeneratedKeys {
        private_key,
        public_key,
        dns_record,
        txt_record,
        provider,
    })
}

/// `{selector}._domainkey.{domain} IN TXT "v=DKIM1; k=rsa; p=<base64 DER>"`
pub fn txt_record(domain: &str, selector: &str, public_der: &[u8]) -> String {
    format!(
        "{selector}._domainkey.{domain} IN TXT \"v=DKIM1; k=rsa; p={}\"",
        BASE64.encode(public_der)
    )
}

fn public_pem(der: &[u8], provider: &'static str) -> Result<String, KeyGenError> {
    RsaPublicKey::from_public_key_der(der)
        .and_then(|key| key.to_public_key_pem(LineEnding::LF))
        .map_err(|e| KeyGenError::Unusable {
            provider,
            reason: e.to_string(),
        })
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?
        .write_all(contents)
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?
        .write_all(contents)
}
