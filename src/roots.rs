//! Trusted root certification authorities.
//!
//! Roots are configured as a JSON object mapping a display name to a PEM certificate:
//!
//! ```text
//! {
//!   "C=CN, O=Huawei, OU=Huawei CBG, CN=Huawei CBG Root CA G2": "-----BEGIN CERTIFICATE-----\n...",
//!   ...
//! }
//! ```
//!
//! A second map of the same shape holds test roots, which are only consulted in debug mode.

use std::collections::BTreeMap;

use der::DecodePem;
use log::{debug, info};
use x509_cert::Certificate;

use crate::signature::is_issued_by;
use crate::{Error, Result};

#[derive(Clone, Debug, Default)]
pub struct TrustedRoots {
    production: Vec<Certificate>,
    debug: Vec<Certificate>,
}

impl TrustedRoots {
    pub fn from_json(production: &str, debug: Option<&str>) -> Result<Self> {
        let production = parse_root_map(production)?;
        let debug = match debug {
            Some(json) => parse_root_map(json)?,
            None => vec![],
        };
        info!(
            "loaded {} trusted roots and {} test roots",
            production.len(),
            debug.len()
        );
        Ok(TrustedRoots { production, debug })
    }

    pub fn add_root(&mut self, root: Certificate) {
        self.production.push(root);
    }

    pub fn is_empty(&self) -> bool {
        self.production.is_empty() && self.debug.is_empty()
    }

    /// Returns the self-signed root that issued `cert`, trying production roots before test roots.
    pub fn find_matched_root(&self, cert: &Certificate, debug_mode: bool) -> Option<&Certificate> {
        let overlay: &[Certificate] = if debug_mode { &self.debug } else { &[] };
        let found = self
            .production
            .iter()
            .chain(overlay.iter())
            .find(|root| is_issued_by(cert, root));
        if found.is_none() {
            debug!(
                "no trusted root for issuer {}",
                crate::asn1::format_name(&cert.tbs_certificate.issuer)
            );
        }
        found
    }
}

fn parse_root_map(json: &str) -> Result<Vec<Certificate>> {
    let map: BTreeMap<String, String> = serde_json::from_str(json)?;
    let mut roots = vec![];
    for (name, pem) in map {
        let cert = Certificate::from_pem(pem.as_bytes())
            .map_err(|e| Error::Config(format!("trusted root {name}: {e}")))?;
        if cert.tbs_certificate.subject != cert.tbs_certificate.issuer {
            return Err(Error::Config(format!("trusted root {name} is not self-issued")));
        }
        roots.push(cert);
    }
    Ok(roots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_pem() {
        let json = r#"{ "bad": "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n" }"#;
        assert!(matches!(
            TrustedRoots::from_json(json, None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn empty_maps_load() {
        let roots = TrustedRoots::from_json("{}", Some("{}")).unwrap();
        assert!(roots.is_empty());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            TrustedRoots::from_json("[", None),
            Err(Error::Json(_))
        ));
    }
}
