//! Verifies the signature of HAP application packages.
//!
//! A HAP package is a zip archive with a signing block inserted between the last entry and the
//! central directory:
//!
//! ```text
//! +-------------+-------------------------------------------+-------------+------+
//! | zip entries | sub-block headers | values | head (32 B) | central dir | EOCD |
//! +-------------+-------------------------------------------+-------------+------+
//! ```
//!
//! The mandatory signature sub-block is a PKCS #7 signed-data object whose content carries a
//! digest of the three zip regions and of every optional sub-block. The profile sub-block holds
//! the provisioning profile, usually signed as well. [`HapVerifier`] checks the signatures against
//! a [`TrustStore`], applies the trusted source policy and finally checks package integrity.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use hap_verify::{CrlStore, HapVerifier, TrustStore, VerifierConfig};
//!
//! let trust = TrustStore::from_dir(Path::new("/etc/hap"), CrlStore::in_memory()).unwrap();
//! let verifier = HapVerifier::new(VerifierConfig::default(), Arc::new(trust));
//! match verifier.verify_file("entry-default-signed.hap") {
//!     Ok(result) => println!("app id {}", result.provision_info().unwrap().app_id),
//!     Err(code) => println!("rejected: {code} ({})", code.as_i32()),
//! }
//! ```

pub(crate) mod asn1;
pub mod chain;
pub mod config;
pub mod crl;
pub mod cursor;
pub mod digest;
mod error;
pub mod pkcs7;
pub mod provision;
pub mod roots;
pub(crate) mod signature;
pub mod signing_block;
pub mod source;
pub mod ticket;
pub mod trust;
pub mod verifier;

#[cfg(test)]
mod testutil;

pub use config::{TrustStore, VerifierConfig};
pub use crl::{CrlStorage, CrlStore, FileCrlStorage, MemoryCrlStorage};
pub use error::{Error, Result, ResultCode};
pub use provision::{ProvisionError, ProvisionInfo};
pub use verifier::{HapVerifier, HapVerifyResult};
