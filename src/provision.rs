//! Provisioning profiles: the JSON document that binds a bundle to its signing certificate,
//! permissions and, for debug builds, the devices it may be installed on.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use der::{DecodePem, Encode};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::Certificate;

pub const MAX_DEBUG_DEVICES: usize = 100;
const DEVICE_ID_TYPE_UDID: &str = "udid";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("invalid profile: {0}")]
    Invalid(String),
    #[error("unsupported device id type {0:?}")]
    UnsupportedDeviceType(String),
    #[error("profile lists {0} devices")]
    TooManyDevices(usize),
    #[error("device is not authorized by the profile")]
    DeviceUnauthorized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionType {
    Debug,
    Release,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionType {
    AppGallery,
    Enterprise,
    OsIntegration,
    #[default]
    None,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Validity {
    #[serde(rename = "not-before")]
    pub not_before: i64,
    #[serde(rename = "not-after")]
    pub not_after: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BundleInfo {
    pub developer_id: String,
    pub development_certificate: String,
    pub distribution_certificate: String,
    pub bundle_name: String,
    pub apl: String,
    pub app_feature: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Acls {
    pub allowed_acls: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Permissions {
    pub restricted_permissions: Vec<String>,
    pub restricted_capabilities: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DebugInfo {
    pub device_id_type: String,
    pub device_ids: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProvisionInfo {
    #[serde(default)]
    pub version_code: i64,
    #[serde(default)]
    pub version_name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(rename = "type")]
    pub provision_type: ProvisionType,
    #[serde(rename = "app-distribution-type", default)]
    pub distribution_type: DistributionType,
    #[serde(default)]
    pub validity: Validity,
    pub bundle_info: BundleInfo,
    #[serde(default)]
    pub acls: Acls,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub debug_info: DebugInfo,
    #[serde(default)]
    pub issuer: String,
    /// `bundle-name_base64(public key)`, filled in once the profile has been verified.
    #[serde(skip)]
    pub app_id: String,
    /// Uppercase hex SHA-256 of the signing certificate.
    #[serde(skip)]
    pub fingerprint: String,
}

impl ProvisionInfo {
    /// Parses a profile without applying any device policy.
    pub fn from_json(json: &str) -> Result<Self, ProvisionError> {
        let info: ProvisionInfo =
            serde_json::from_str(json).map_err(|e| ProvisionError::Invalid(e.to_string()))?;
        if info.bundle_info.bundle_name.is_empty() {
            return Err(ProvisionError::Invalid("empty bundle-name".to_string()));
        }
        Ok(info)
    }

    /// The PEM certificate the app must be signed with: the development certificate of a debug
    /// profile or the distribution certificate of a release profile.
    pub fn signing_certificate_pem(&self) -> &str {
        match self.provision_type {
            ProvisionType::Debug => &self.bundle_info.development_certificate,
            ProvisionType::Release => &self.bundle_info.distribution_certificate,
        }
    }

    pub fn signing_certificate(&self) -> crate::Result<Certificate> {
        Certificate::from_pem(self.signing_certificate_pem().as_bytes())
            .map_err(|e| crate::Error::Policy(format!("profile certificate: {e}")))
    }

    /// Fills in `app_id` and `fingerprint` from the profile's signing certificate.
    pub fn generate_app_id(&mut self) -> crate::Result<()> {
        let cert = self.signing_certificate()?;
        let spki = cert.tbs_certificate.subject_public_key_info.to_der()?;
        self.app_id = format!("{}_{}", self.bundle_info.bundle_name, STANDARD.encode(spki));
        self.fingerprint = hex::encode_upper(Sha256::digest(cert.to_der()?));
        debug!("app id {} fingerprint {}", self.app_id, self.fingerprint);
        Ok(())
    }
}

/// Parses a profile and applies local policy to it.
pub trait ProvisionVerifier: Send + Sync {
    fn parse_and_verify(&self, json: &str) -> Result<ProvisionInfo, ProvisionError>;
}

pub struct JsonProvisionVerifier {
    device_id: Option<String>,
}

impl JsonProvisionVerifier {
    pub fn new(device_id: Option<String>) -> Self {
        JsonProvisionVerifier { device_id }
    }
}

impl ProvisionVerifier for JsonProvisionVerifier {
    fn parse_and_verify(&self, json: &str) -> Result<ProvisionInfo, ProvisionError> {
        let info = ProvisionInfo::from_json(json)?;
        if info.provision_type == ProvisionType::Debug {
            check_debug_devices(&info.debug_info, self.device_id.as_deref())?;
        }
        Ok(info)
    }
}

fn check_debug_devices(debug_info: &DebugInfo, device_id: Option<&str>) -> Result<(), ProvisionError> {
    if debug_info.device_id_type != DEVICE_ID_TYPE_UDID {
        error!("debug profile uses device id type {:?}", debug_info.device_id_type);
        return Err(ProvisionError::UnsupportedDeviceType(
            debug_info.device_id_type.clone(),
        ));
    }
    if debug_info.device_ids.len() > MAX_DEBUG_DEVICES {
        return Err(ProvisionError::TooManyDevices(debug_info.device_ids.len()));
    }
    match device_id {
        Some(id) if debug_info.device_ids.iter().any(|d| d == id) => Ok(()),
        _ => Err(ProvisionError::DeviceUnauthorized),
    }
}
