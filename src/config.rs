//! Verifier configuration and the shared trust store.

use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::crl::CrlStore;
use crate::roots::TrustedRoots;
use crate::trust::TrustedSources;
use crate::Result;

pub const TRUSTED_ROOT_CA_FILE: &str = "trusted_root_ca.json";
pub const TRUSTED_ROOT_CA_TEST_FILE: &str = "trusted_root_ca_test.json";
pub const TRUSTED_APP_SOURCES_FILE: &str = "trusted_apps_sources.json";
pub const TRUSTED_APP_SOURCES_DEBUG_FILE: &str = "trusted_apps_sources_debug.json";
pub const TRUSTED_TICKET_SOURCES_FILE: &str = "trusted_ticket_sources.json";
pub const TRUSTED_TICKET_SOURCES_DEBUG_FILE: &str = "trusted_ticket_sources_debug.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Consult the test roots and debug trusted sources when production lists do not match.
    pub debug_mode: bool,
    /// Identity of the local device, checked against debug profiles and tickets.
    pub device_id: Option<String>,
    pub max_package_size: u64,
    pub package_suffixes: Vec<String>,
    pub require_ticket_for_app_gallery: bool,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            debug_mode: false,
            device_id: None,
            max_package_size: 4 * 1024 * 1024 * 1024,
            package_suffixes: vec![".hap".to_string()],
            require_ticket_for_app_gallery: true,
        }
    }
}

/// Trust anchors shared by every verification.
pub struct TrustStore {
    pub roots: TrustedRoots,
    pub sources: TrustedSources,
    pub crls: CrlStore,
}

impl TrustStore {
    pub fn new(roots: TrustedRoots, sources: TrustedSources, crls: CrlStore) -> Self {
        TrustStore {
            roots,
            sources,
            crls,
        }
    }

    /// Loads the trust anchor files from `dir`. The production files are required; missing test
    /// overlays are skipped.
    pub fn from_dir(dir: &Path, crls: CrlStore) -> Result<Self> {
        let roots = TrustedRoots::from_json(
            &fs::read_to_string(dir.join(TRUSTED_ROOT_CA_FILE))?,
            read_optional(dir, TRUSTED_ROOT_CA_TEST_FILE)?.as_deref(),
        )?;
        let mut sources = TrustedSources::from_json(
            &fs::read_to_string(dir.join(TRUSTED_APP_SOURCES_FILE))?,
            &fs::read_to_string(dir.join(TRUSTED_TICKET_SOURCES_FILE))?,
        )?;
        sources.load_debug_overlay(
            read_optional(dir, TRUSTED_APP_SOURCES_DEBUG_FILE)?.as_deref(),
            read_optional(dir, TRUSTED_TICKET_SOURCES_DEBUG_FILE)?.as_deref(),
        )?;
        info!("trust store loaded from {}", dir.display());
        Ok(TrustStore::new(roots, sources, crls))
    }
}

fn read_optional(dir: &Path, name: &str) -> Result<Option<String>> {
    let path = dir.join(name);
    if !path.exists() {
        warn!("{} not found, continuing without it", path.display());
        return Ok(None);
    }
    Ok(Some(fs::read_to_string(path)?))
}
