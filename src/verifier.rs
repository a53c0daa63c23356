//! Top-level package verification.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use der::Encode;
use log::{error, info, warn};
use x509_cert::Certificate;

use crate::config::{TrustStore, VerifierConfig};
use crate::digest::{parse_content_digest, verify_integrity};
use crate::error::ResultCode;
use crate::pkcs7::Pkcs7Context;
use crate::provision::{
    DistributionType, JsonProvisionVerifier, ProvisionInfo, ProvisionType, ProvisionVerifier,
};
use crate::signing_block::{locate, OptionalBlock, OptionalBlockType, SignatureInfo};
use crate::source::PackageData;
use crate::ticket::{check_ticket, NoTickets, TicketSource};
use crate::trust::{AppSource, BlobKind, MatchState, MatchingResult};
use crate::Error;

/// Everything a successful verification learned about the package.
#[derive(Clone, Debug, Default)]
pub struct HapVerifyResult {
    version: u32,
    pkcs7_block: Vec<u8>,
    profile_block: Vec<u8>,
    optional_blocks: Vec<OptionalBlock>,
    public_keys: Vec<String>,
    signatures: Vec<String>,
    provision_info: Option<ProvisionInfo>,
}

impl HapVerifyResult {
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The app signature sub-block.
    pub fn pkcs7_block(&self) -> &[u8] {
        &self.pkcs7_block
    }

    pub fn profile_block(&self) -> &[u8] {
        &self.profile_block
    }

    pub fn property(&self) -> Option<&[u8]> {
        self.optional_blocks
            .iter()
            .find(|block| block.block_type == OptionalBlockType::Property)
            .map(|block| block.value.as_slice())
    }

    pub fn optional_blocks(&self) -> &[OptionalBlock] {
        &self.optional_blocks
    }

    /// Base64 DER subject public key infos of the signer chain, leaf first.
    pub fn public_keys(&self) -> &[String] {
        &self.public_keys
    }

    /// Base64 DER certificates of the signer chain, leaf first.
    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    pub fn provision_info(&self) -> Option<&ProvisionInfo> {
        self.provision_info.as_ref()
    }
}

/// Logs `e` and yields `code`.
fn fail<E: std::fmt::Display>(code: ResultCode) -> impl Fn(E) -> ResultCode {
    move |e| {
        error!("{code}: {e}");
        code
    }
}

pub struct HapVerifier {
    config: VerifierConfig,
    trust: Arc<TrustStore>,
    provision_verifier: Box<dyn ProvisionVerifier>,
    tickets: Box<dyn TicketSource>,
}

impl HapVerifier {
    pub fn new(config: VerifierConfig, trust: Arc<TrustStore>) -> Self {
        let provision_verifier = Box::new(JsonProvisionVerifier::new(config.device_id.clone()));
        HapVerifier {
            config,
            trust,
            provision_verifier,
            tickets: Box::new(NoTickets),
        }
    }

    /// Loads the trust store from `dir` (see [`TrustStore::from_dir`]).
    pub fn from_trust_dir(
        config: VerifierConfig,
        dir: &Path,
        crls: crate::crl::CrlStore,
    ) -> Result<Self, ResultCode> {
        let trust = TrustStore::from_dir(dir, crls).map_err(fail(ResultCode::VerifySourceInitFail))?;
        Ok(HapVerifier::new(config, Arc::new(trust)))
    }

    pub fn with_provision_verifier(mut self, verifier: Box<dyn ProvisionVerifier>) -> Self {
        self.provision_verifier = verifier;
        self
    }

    pub fn with_ticket_source(mut self, tickets: Box<dyn TicketSource>) -> Self {
        self.tickets = tickets;
        self
    }

    pub fn verify_file(&self, path: impl AsRef<Path>) -> Result<HapVerifyResult, ResultCode> {
        let file = self.open_package(path.as_ref())?;
        self.verify_package(&file)
    }

    pub fn verify_bytes(&self, package: &[u8]) -> Result<HapVerifyResult, ResultCode> {
        if package.len() as u64 > self.config.max_package_size {
            error!("package of {} bytes is too large", package.len());
            return Err(ResultCode::FileSizeTooLarge);
        }
        self.verify_package(package)
    }

    /// Runs [`HapVerifier::verify_file`] on the blocking thread pool.
    pub async fn verify_file_async(
        self: Arc<Self>,
        path: PathBuf,
    ) -> Result<HapVerifyResult, ResultCode> {
        tokio::task::spawn_blocking(move || self.verify_file(&path))
            .await
            .map_err(fail(ResultCode::VerifySignatureFail))?
    }

    /// Reads the provisioning profile out of a package without verifying any signature.
    pub fn parse_profile(&self, path: impl AsRef<Path>) -> Result<ProvisionInfo, ResultCode> {
        let file = self.open_package(path.as_ref())?;
        let info = locate(&file).map_err(fail(ResultCode::SignatureNotFound))?;
        let block = info
            .find_optional_block(OptionalBlockType::Profile)
            .ok_or(ResultCode::NoProfileBlockFail)?;
        let json = match Pkcs7Context::parse(&block.value) {
            Ok(ctx) => String::from_utf8(ctx.content),
            Err(_) => String::from_utf8(block.value.clone()),
        }
        .map_err(fail(ResultCode::ProfileParseFail))?;
        ProvisionInfo::from_json(&json).map_err(fail(ResultCode::ProfileParseFail))
    }

    fn open_package(&self, path: &Path) -> Result<File, ResultCode> {
        let name = path.to_string_lossy();
        let suffix_ok = self
            .config
            .package_suffixes
            .iter()
            .any(|suffix| name.len() > suffix.len() && name.ends_with(suffix.as_str()));
        if !suffix_ok {
            error!("{name} does not have a package suffix");
            return Err(ResultCode::FilePathInvalid);
        }
        let file = File::open(path).map_err(fail(ResultCode::OpenFileError))?;
        let len = file.size().map_err(fail(ResultCode::OpenFileError))?;
        if len > self.config.max_package_size {
            error!("{name} is {len} bytes, limit is {}", self.config.max_package_size);
            return Err(ResultCode::FileSizeTooLarge);
        }
        Ok(file)
    }

    fn verify_package<P: PackageData + ?Sized>(
        &self,
        package: &P,
    ) -> Result<HapVerifyResult, ResultCode> {
        let debug_mode = self.config.debug_mode;
        if self.trust.roots.is_empty() {
            error!("no trusted roots are configured");
            return Err(ResultCode::VerifySourceInitFail);
        }

        let info = locate(package).map_err(fail(ResultCode::SignatureNotFound))?;

        let mut app = Pkcs7Context::parse(&info.signature_block)
            .and_then(|mut ctx| ctx.verify(&self.trust, debug_mode).map(|_| ctx))
            .map_err(fail(ResultCode::VerifyAppPkcs7Fail))?;

        let profile_block = info
            .find_optional_block(OptionalBlockType::Profile)
            .ok_or_else(|| {
                error!("package has no profile block");
                ResultCode::NoProfileBlockFail
            })?
            .value
            .clone();

        let app_match = app.match_app_source(&self.trust, BlobKind::AppSignature, debug_mode);
        info!("app signature match: {app_match:?}");

        let mut profile = self.parse_profile_block(&profile_block, app_match)?;
        let mut need_write_crl = app.need_write_crl;

        if app_match.source == AppSource::ThirdPartyPreload {
            let ctx = self.require_profile_pkcs7(&mut profile)?;
            ctx.verify(&self.trust, debug_mode)
                .map_err(fail(ResultCode::AppSourceNotTrusted))?;
        }

        let mut provision = if app_match.state == MatchState::NoMatch {
            let ctx = self.require_profile_pkcs7(&mut profile)?;
            if ctx.cert_chains.is_empty() {
                ctx.verify(&self.trust, debug_mode)
                    .map_err(fail(ResultCode::AppSourceNotTrusted))?;
            }
            let profile_match = ctx.match_app_source(&self.trust, BlobKind::Profile, debug_mode);
            info!("profile signature match: {profile_match:?}");
            if !profile_match.is_match() {
                error!("profile signer is not a trusted profile source");
                return Err(ResultCode::AppSourceNotTrusted);
            }
            let provision = self
                .provision_verifier
                .parse_and_verify(&profile.json)
                .map_err(fail(ResultCode::AppSourceNotTrusted))?;
            need_write_crl |= self
                .check_profile_consistency(&provision, profile_match, &app)
                .map_err(fail(ResultCode::AppSourceNotTrusted))?;
            provision
        } else {
            self.provision_verifier
                .parse_and_verify(&profile.json)
                .map_err(fail(ResultCode::AppSourceNotTrusted))?
        };
        if let Some(ctx) = &profile.ctx {
            need_write_crl |= ctx.need_write_crl;
        }

        provision
            .generate_app_id()
            .map_err(fail(ResultCode::GenerateAppIdFail))?;

        let content_digest =
            parse_content_digest(&app.content).map_err(fail(ResultCode::GetDigestFail))?;

        let (public_keys, signatures) = export_chain(app.primary_chain())?;

        verify_integrity(package, &info, &content_digest)
            .map_err(fail(ResultCode::VerifyIntegrityFail))?;

        if need_write_crl {
            if let Err(e) = self.trust.crls.persist() {
                warn!("verification succeeded but the CRL cache was not saved: {e}");
            }
        }

        Ok(assemble_result(info, profile_block, public_keys, signatures, provision))
    }

    fn parse_profile_block(
        &self,
        block: &[u8],
        app_match: MatchingResult,
    ) -> Result<ProfileBlock, ResultCode> {
        if app_match.source == AppSource::AppGallery && app_match.state == MatchState::MatchSign {
            let json = String::from_utf8(block.to_vec()).map_err(fail(ResultCode::ProfileParseFail))?;
            return Ok(ProfileBlock { json, ctx: None });
        }
        let ctx = Pkcs7Context::parse(block).map_err(fail(ResultCode::ProfileParseFail))?;
        let json =
            String::from_utf8(ctx.content.clone()).map_err(fail(ResultCode::ProfileParseFail))?;
        Ok(ProfileBlock {
            json,
            ctx: Some(ctx),
        })
    }

    fn require_profile_pkcs7<'p>(
        &self,
        profile: &'p mut ProfileBlock,
    ) -> Result<&'p mut Pkcs7Context, ResultCode> {
        profile.ctx.as_mut().ok_or_else(|| {
            error!("profile is not signed");
            ResultCode::AppSourceNotTrusted
        })
    }

    /// Cross-checks a verified profile against the app signature. Returns whether the ticket
    /// check updated the CRL cache.
    fn check_profile_consistency(
        &self,
        provision: &ProvisionInfo,
        profile_match: MatchingResult,
        app: &Pkcs7Context,
    ) -> crate::Result<bool> {
        let mut need_write_crl = false;
        match provision.provision_type {
            ProvisionType::Release => {
                if profile_match.state != MatchState::MatchProfile {
                    return Err(Error::Policy(
                        "release profile signed by a debug profile signer".to_string(),
                    ));
                }
                need_write_crl = self.check_distribution(provision)?;
            }
            ProvisionType::Debug => {
                if profile_match.state != MatchState::MatchProfileDebug {
                    return Err(Error::Policy(
                        "debug profile signed by a release profile signer".to_string(),
                    ));
                }
            }
        }

        let profile_cert = provision.signing_certificate()?;
        let app_cert = app
            .signer_cert()
            .ok_or_else(|| Error::Policy("app signer certificate missing".to_string()))?;
        if !same_der(&profile_cert, app_cert)? {
            return Err(Error::Policy(
                "app is not signed with the certificate named by its profile".to_string(),
            ));
        }
        Ok(need_write_crl)
    }

    fn check_distribution(&self, provision: &ProvisionInfo) -> crate::Result<bool> {
        match provision.distribution_type {
            DistributionType::Enterprise | DistributionType::OsIntegration => Ok(false),
            DistributionType::None => Err(Error::Policy(
                "release profile with no distribution type".to_string(),
            )),
            DistributionType::AppGallery => {
                if !self.config.require_ticket_for_app_gallery {
                    return Ok(false);
                }
                let ticket = self
                    .tickets
                    .ticket_for(&provision.bundle_info.bundle_name)
                    .ok_or_else(|| {
                        Error::Policy(format!(
                            "no ticket for {}",
                            provision.bundle_info.bundle_name
                        ))
                    })?;
                check_ticket(&ticket, provision, &self.trust, &self.config)
            }
        }
    }
}

struct ProfileBlock {
    json: String,
    ctx: Option<Pkcs7Context>,
}

fn same_der(a: &Certificate, b: &Certificate) -> crate::Result<bool> {
    Ok(a.to_der()? == b.to_der()?)
}

fn export_chain(chain: &[Certificate]) -> Result<(Vec<String>, Vec<String>), ResultCode> {
    if chain.is_empty() {
        error!("signer chain is empty");
        return Err(ResultCode::GetPublicKeyFail);
    }
    let mut public_keys = vec![];
    let mut signatures = vec![];
    for cert in chain {
        let spki = cert
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(fail(ResultCode::GetPublicKeyFail))?;
        public_keys.push(STANDARD.encode(spki));
        let der = cert.to_der().map_err(fail(ResultCode::GetSignatureFail))?;
        signatures.push(STANDARD.encode(der));
    }
    Ok((public_keys, signatures))
}

fn assemble_result(
    info: SignatureInfo,
    profile_block: Vec<u8>,
    public_keys: Vec<String>,
    signatures: Vec<String>,
    provision: ProvisionInfo,
) -> HapVerifyResult {
    HapVerifyResult {
        version: info.version,
        pkcs7_block: info.signature_block,
        profile_block,
        optional_blocks: info.optional_blocks,
        public_keys,
        signatures,
        provision_info: Some(provision),
    }
}
