//! Per-issuer CRL cache.
//!
//! The store keeps the newest known CRL for each issuer. CRLs carried in a package replace the
//! cached copy when they are newer, and the caller is told when the cache should be persisted.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use der::{Decode, Encode};
use log::{debug, info, warn};
use x509_cert::crl::CertificateList;
use x509_cert::Certificate;

use crate::asn1::format_name;
use crate::signature::verify_crl;
use crate::{Error, Result};

/// Backing storage for the CRL cache. Entries are DER encoded CRLs.
pub trait CrlStorage: Send + Sync {
    fn load(&self) -> Result<Vec<Vec<u8>>>;
    fn store(&self, crls: &[Vec<u8>]) -> Result<()>;
}

/// Keeps the cache in a single file as a bincode encoded list of DER CRLs.
pub struct FileCrlStorage {
    path: PathBuf,
}

impl FileCrlStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileCrlStorage { path: path.into() }
    }
}

impl CrlStorage for FileCrlStorage {
    fn load(&self) -> Result<Vec<Vec<u8>>> {
        if !self.path.exists() {
            debug!("no CRL cache at {}", self.path.display());
            return Ok(vec![]);
        }
        let bytes = fs::read(&self.path)?;
        bincode::deserialize(&bytes).map_err(|e| Error::Crl(format!("corrupt CRL cache: {e}")))
    }

    fn store(&self, crls: &[Vec<u8>]) -> Result<()> {
        let bytes = bincode::serialize(crls).map_err(|e| Error::Crl(e.to_string()))?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCrlStorage {
    crls: Mutex<Vec<Vec<u8>>>,
}

impl MemoryCrlStorage {
    pub fn new(crls: Vec<Vec<u8>>) -> Self {
        MemoryCrlStorage {
            crls: Mutex::new(crls),
        }
    }

    pub fn stored(&self) -> Vec<Vec<u8>> {
        self.crls.lock().map(|crls| crls.clone()).unwrap_or_default()
    }
}

impl CrlStorage for MemoryCrlStorage {
    fn load(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.stored())
    }

    fn store(&self, crls: &[Vec<u8>]) -> Result<()> {
        let mut guard = self
            .crls
            .lock()
            .map_err(|_| Error::Crl("CRL storage lock poisoned".to_string()))?;
        *guard = crls.to_vec();
        Ok(())
    }
}

pub struct CrlStore {
    crls: Mutex<HashMap<String, CertificateList>>,
    storage: Box<dyn CrlStorage>,
}

impl CrlStore {
    pub fn new(storage: Box<dyn CrlStorage>) -> Result<Self> {
        let mut crls = HashMap::new();
        for der in storage.load()? {
            let crl = CertificateList::from_der(&der)?;
            crls.insert(format_name(&crl.tbs_cert_list.issuer), crl);
        }
        info!("loaded {} cached CRLs", crls.len());
        Ok(CrlStore {
            crls: Mutex::new(crls),
            storage,
        })
    }

    pub fn in_memory() -> Self {
        CrlStore {
            crls: Mutex::new(HashMap::new()),
            storage: Box::<MemoryCrlStorage>::default(),
        }
    }

    pub fn get(&self, issuer: &str) -> Option<CertificateList> {
        self.crls.lock().ok()?.get(issuer).cloned()
    }

    /// Picks the CRL to check `issuer`'s certificates against. A package CRL is adopted into the
    /// cache when there is no cached copy or when it is newer; the flag reports whether the
    /// cache changed.
    pub fn reconcile(
        &self,
        issuer: &str,
        package_crl: Option<&CertificateList>,
    ) -> Result<(Option<CertificateList>, bool)> {
        let mut crls = self
            .crls
            .lock()
            .map_err(|_| Error::Crl("CRL cache lock poisoned".to_string()))?;
        let package_crl = match package_crl {
            Some(crl) => crl,
            None => return Ok((crls.get(issuer).cloned(), false)),
        };
        match crls.get(issuer) {
            None => {
                debug!("adopting package CRL for {issuer}");
                crls.insert(issuer.to_string(), package_crl.clone());
                Ok((Some(package_crl.clone()), true))
            }
            Some(cached) => {
                let cached_time = cached.tbs_cert_list.this_update.to_unix_duration();
                let package_time = package_crl.tbs_cert_list.this_update.to_unix_duration();
                if package_time > cached_time {
                    let changed = cached != package_crl;
                    crls.insert(issuer.to_string(), package_crl.clone());
                    Ok((Some(package_crl.clone()), changed))
                } else {
                    Ok((Some(cached.clone()), false))
                }
            }
        }
    }

    /// Checks the leaf of `chain` against the best CRL for its issuer. Returns whether the cache
    /// was updated.
    pub(crate) fn check_chain(
        &self,
        chain: &[Certificate],
        package_crls: &[CertificateList],
    ) -> Result<bool> {
        let leaf = chain
            .first()
            .ok_or_else(|| Error::ChainBuild("empty certificate chain".to_string()))?;
        let issuer = format_name(&leaf.tbs_certificate.issuer);
        let package_crl = package_crls
            .iter()
            .find(|crl| crl.tbs_cert_list.issuer == leaf.tbs_certificate.issuer);
        if let (Some(crl), Some(ca)) = (package_crl, chain.get(1)) {
            verify_crl(crl, ca)
                .map_err(|e| Error::Crl(format!("package CRL for {issuer} does not verify: {e}")))?;
        }
        let (crl, needs_write) = self.reconcile(&issuer, package_crl)?;
        if let Some(crl) = crl {
            if is_revoked(leaf, &crl) {
                return Err(Error::Revoked(hex::encode_upper(
                    leaf.tbs_certificate.serial_number.as_bytes(),
                )));
            }
        }
        Ok(needs_write)
    }

    /// Writes the current cache to storage.
    pub fn persist(&self) -> Result<()> {
        let crls = self
            .crls
            .lock()
            .map_err(|_| Error::Crl("CRL cache lock poisoned".to_string()))?;
        let mut encoded = vec![];
        for crl in crls.values() {
            encoded.push(crl.to_der()?);
        }
        self.storage.store(&encoded).map_err(|e| {
            warn!("failed to persist {} CRLs: {e}", encoded.len());
            e
        })
    }
}

pub fn is_revoked(cert: &Certificate, crl: &CertificateList) -> bool {
    crl.tbs_cert_list
        .revoked_certificates
        .iter()
        .flatten()
        .any(|revoked| revoked.serial_number == cert.tbs_certificate.serial_number)
}
