//! Certificate path construction from a signer certificate to a trusted root.

use std::time::Duration;

use log::debug;
use x509_cert::Certificate;

use crate::asn1::format_name;
use crate::roots::TrustedRoots;
use crate::signature::is_issued_by;
use crate::{Error, Result};

/// Builds chains out of the certificates embedded in a signed-data object, finishing at a
/// trusted root.
pub struct CertChainBuilder<'a> {
    available: &'a [Certificate],
    roots: &'a TrustedRoots,
    debug_mode: bool,
}

impl<'a> CertChainBuilder<'a> {
    pub fn new(available: &'a [Certificate], roots: &'a TrustedRoots, debug_mode: bool) -> Self {
        CertChainBuilder {
            available,
            roots,
            debug_mode,
        }
    }

    /// Returns the chain ordered leaf first. Each embedded certificate is used at most once, so a
    /// set of certificates that issue each other in a cycle still terminates.
    pub fn build(&self, leaf: &Certificate) -> Result<Vec<Certificate>> {
        let mut visited: Vec<bool> = self.available.iter().map(|c| c == leaf).collect();
        let mut chain = vec![leaf.clone()];

        loop {
            let current = &chain[chain.len() - 1];
            let next = self
                .available
                .iter()
                .enumerate()
                .find(|(index, candidate)| !visited[*index] && is_issued_by(current, candidate));
            match next {
                Some((index, issuer)) => {
                    visited[index] = true;
                    chain.push(issuer.clone());
                }
                None => break,
            }
        }

        let last = &chain[chain.len() - 1];
        match self.roots.find_matched_root(last, self.debug_mode) {
            Some(root) => {
                if root != last {
                    chain.push(root.clone());
                }
            }
            None => {
                return Err(Error::NotTrustedRoot(format_name(
                    &last.tbs_certificate.issuer,
                )))
            }
        }
        debug!(
            "built chain of {} for {}",
            chain.len(),
            format_name(&leaf.tbs_certificate.subject)
        );
        Ok(chain)
    }
}

/// Checks that `signing_time` (seconds since the epoch) lies in the validity window of every
/// certificate except the root.
pub fn check_validity(chain: &[Certificate], signing_time: Duration) -> Result<()> {
    let end = chain.len().saturating_sub(1);
    for cert in &chain[..end] {
        let validity = &cert.tbs_certificate.validity;
        if signing_time < validity.not_before.to_unix_duration()
            || signing_time > validity.not_after.to_unix_duration()
        {
            return Err(Error::CertificateExpired(format_name(
                &cert.tbs_certificate.subject,
            )));
        }
    }
    Ok(())
}
