//! Message signing for outbound mail.
//!
//! [`DkimSigner`] prepends a `DKIM-Signature` header computed with
//! RSA-SHA256, and [`keygen`] produces the key pair plus the DNS TXT payload
//! that publishes it.

mod error;
pub mod keygen;
mod signer;

pub use error::{KeyGenError, SignerError};
pub use keygen::{
    GeneratedKeys, InProcessProvider, KeyMaterial, KeyMaterialProvider, OpensslProvider,
    default_providers, generate_keys,
};
pub use signer::{DkimSigner, SigningIdentity};
