//! PKCS #7 signed-data parsing and signer verification.

use std::time::Duration;

use cms::attr::MessageDigest;
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::revocation::RevocationInfoChoice;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use const_oid::db::rfc5911::{ID_MESSAGE_DIGEST, ID_SIGNED_DATA};
use der::asn1::OctetString;
use der::{Decode, Encode, Tag, Tagged};
use log::{debug, error};
use x509_cert::attr::Attributes;
use x509_cert::crl::CertificateList;
use x509_cert::time::Time;
use x509_cert::Certificate;

use crate::asn1::{format_name, ID_CE_SUBJECT_KEY_IDENTIFIER, ID_SIGNING_TIME};
use crate::chain::{check_validity, CertChainBuilder};
use crate::config::TrustStore;
use crate::digest::DigestAlgorithm;
use crate::signature::{verify_message, verify_prehash, SignatureScheme};
use crate::trust::{BlobKind, MatchingResult};
use crate::{Error, Result};

/// State of one signed-data object through parsing, verification and trust matching.
pub struct Pkcs7Context {
    /// The encapsulated content.
    pub content: Vec<u8>,
    /// Digest algorithm of the primary signer.
    pub digest_algorithm: DigestAlgorithm,
    /// One chain per signer info, leaf first. Empty until [`Pkcs7Context::verify`] succeeds.
    pub cert_chains: Vec<Vec<Certificate>>,
    pub match_result: MatchingResult,
    /// Issuer of the primary signer's certificate.
    pub cert_issuer: String,
    pub need_write_crl: bool,
    signer_infos: Vec<SignerInfo>,
    certificates: Vec<Certificate>,
    crls: Vec<CertificateList>,
}

impl Pkcs7Context {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let ci = ContentInfo::from_der(bytes)?;
        if ci.content_type != ID_SIGNED_DATA {
            return Err(Error::Pkcs7(format!(
                "content type {} is not signed-data",
                ci.content_type
            )));
        }
        let sd_bytes = ci.content.to_der()?;
        let sd = SignedData::from_der(&sd_bytes)?;
        let ec = match sd.encap_content_info.econtent {
            Some(ec) => ec,
            None => return Err(Error::Pkcs7("signed-data has no content".to_string())),
        };
        if ec.tag() != Tag::OctetString {
            return Err(Error::Pkcs7(format!(
                "content is {} rather than an OCTET STRING",
                ec.tag()
            )));
        }
        let content = ec.value().to_vec();

        let signer_infos: Vec<SignerInfo> = sd.signer_infos.0.iter().cloned().collect();
        let primary = match signer_infos.first() {
            Some(si) => si,
            None => return Err(Error::Pkcs7("signed-data has no signer infos".to_string())),
        };
        let digest_algorithm = DigestAlgorithm::from_oid(&primary.digest_alg.oid)?;

        let certificates = match &sd.certificates {
            Some(set) => set
                .0
                .iter()
                .filter_map(|choice| match choice {
                    CertificateChoices::Certificate(cert) => Some(cert.clone()),
                    _ => None,
                })
                .collect(),
            None => vec![],
        };
        let crls = match &sd.crls {
            Some(set) => set
                .0
                .iter()
                .filter_map(|choice| match choice {
                    RevocationInfoChoice::Crl(crl) => Some(crl.clone()),
                    _ => None,
                })
                .collect(),
            None => vec![],
        };

        Ok(Pkcs7Context {
            content,
            digest_algorithm,
            cert_chains: vec![],
            match_result: MatchingResult::NO_MATCH,
            cert_issuer: String::new(),
            need_write_crl: false,
            signer_infos,
            certificates,
            crls,
        })
    }

    /// Verifies every signer info: signature, certificate chain, validity at signing time and
    /// revocation of the signer certificate.
    pub fn verify(&mut self, trust: &TrustStore, debug_mode: bool) -> Result<()> {
        let mut chains = vec![];
        let mut need_write_crl = false;
        for (index, signer_info) in self.signer_infos.iter().enumerate() {
            let (chain, needs_write) = self
                .verify_signer(signer_info, trust, debug_mode)
                .map_err(|e| {
                    error!("signer info {index} failed verification: {e}");
                    e
                })?;
            need_write_crl |= needs_write;
            chains.push(chain);
        }
        self.cert_issuer = format_name(&chains[0][0].tbs_certificate.issuer);
        self.cert_chains = chains;
        self.need_write_crl = need_write_crl;
        Ok(())
    }

    fn verify_signer(
        &self,
        signer_info: &SignerInfo,
        trust: &TrustStore,
        debug_mode: bool,
    ) -> Result<(Vec<Certificate>, bool)> {
        let signer_cert = match get_signer_cert(&signer_info.sid, &self.certificates) {
            Some(cert) => cert,
            None => return Err(Error::Pkcs7("signer certificate not found".to_string())),
        };

        let chain = CertChainBuilder::new(&self.certificates, &trust.roots, debug_mode)
            .build(signer_cert)?;

        let digest_algorithm = DigestAlgorithm::from_oid(&signer_info.digest_alg.oid)?;
        let scheme =
            SignatureScheme::from_algorithm(&signer_info.signature_algorithm, Some(digest_algorithm))?;
        if scheme.is_pss() {
            self.verify_pss_signature(signer_info, signer_cert, &scheme, digest_algorithm)?;
        } else {
            self.verify_signature(signer_info, signer_cert, &scheme, digest_algorithm)?;
        }

        let signing_time = signing_time(signer_info)?;
        check_validity(&chain, signing_time)?;
        let needs_write = trust.crls.check_chain(&chain, &self.crls)?;
        Ok((chain, needs_write))
    }

    fn verify_signature(
        &self,
        signer_info: &SignerInfo,
        signer_cert: &Certificate,
        scheme: &SignatureScheme,
        digest_algorithm: DigestAlgorithm,
    ) -> Result<()> {
        let spki = &signer_cert.tbs_certificate.subject_public_key_info;
        let signature = signer_info.signature.as_bytes();
        match &signer_info.signed_attrs {
            Some(signed_attrs) => {
                check_message_digest(signed_attrs, &digest_algorithm.digest(&self.content))?;
                let enc_signed_attrs = signed_attrs.to_der()?;
                verify_message(scheme, spki, &enc_signed_attrs, signature)
            }
            None => verify_message(scheme, spki, &self.content, signature),
        }
    }

    /// PSS signatures are checked against an explicitly computed digest: the content digest, or
    /// when authenticated attributes are present, the digest of the attributes after their
    /// message digest has been compared.
    fn verify_pss_signature(
        &self,
        signer_info: &SignerInfo,
        signer_cert: &Certificate,
        scheme: &SignatureScheme,
        digest_algorithm: DigestAlgorithm,
    ) -> Result<()> {
        let pss_digest = scheme.digest_algorithm();
        let mut to_be_signed = pss_digest.digest(&self.content);
        if let Some(signed_attrs) = &signer_info.signed_attrs {
            check_message_digest(signed_attrs, &digest_algorithm.digest(&self.content))?;
            to_be_signed = pss_digest.digest(&signed_attrs.to_der()?);
        }
        verify_prehash(
            scheme,
            &signer_cert.tbs_certificate.subject_public_key_info,
            &to_be_signed,
            signer_info.signature.as_bytes(),
        )
    }

    /// Certificate of the primary signer, once verified.
    pub fn signer_cert(&self) -> Option<&Certificate> {
        self.cert_chains.first().and_then(|chain| chain.first())
    }

    pub fn primary_chain(&self) -> &[Certificate] {
        self.cert_chains.first().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Matches the primary signer against the trusted app sources and records the result.
    pub fn match_app_source(
        &mut self,
        trust: &TrustStore,
        kind: BlobKind,
        debug_mode: bool,
    ) -> MatchingResult {
        let result = match self.signer_cert() {
            Some(cert) => {
                let subject = format_name(&cert.tbs_certificate.subject);
                debug!("matching {kind:?} signer {subject} issued by {}", self.cert_issuer);
                trust.sources.is_trusted_app_source(
                    &subject,
                    &self.cert_issuer,
                    kind,
                    self.primary_chain().len(),
                    debug_mode,
                )
            }
            None => MatchingResult::NO_MATCH,
        };
        self.match_result = result;
        result
    }

    /// Matches the primary signer against the trusted ticket sources and records the result.
    pub fn match_ticket_source(&mut self, trust: &TrustStore, debug_mode: bool) -> MatchingResult {
        let result = match self.signer_cert() {
            Some(cert) => trust.sources.is_trusted_ticket_source(
                &format_name(&cert.tbs_certificate.subject),
                &self.cert_issuer,
                self.primary_chain().len(),
                debug_mode,
            ),
            None => MatchingResult::NO_MATCH,
        };
        self.match_result = result;
        result
    }
}

fn check_message_digest(signed_attrs: &Attributes, expected: &[u8]) -> Result<()> {
    let md_attr = signed_attrs.iter().find(|a| a.oid == ID_MESSAGE_DIGEST);
    match md_attr {
        Some(attr) => {
            if let Some(val) = attr.values.get(0) {
                let md_attr = MessageDigest::from_der(&val.to_der()?)?;
                if md_attr.as_bytes() != expected {
                    return Err(Error::SignatureMismatch(
                        "message digest attribute does not match the content".to_string(),
                    ));
                }
                Ok(())
            } else {
                Err(Error::Pkcs7("empty message digest attribute".to_string()))
            }
        }
        None => Err(Error::Pkcs7("missing message digest attribute".to_string())),
    }
}

/// Reads the authenticated signing time as a duration since the epoch.
pub(crate) fn signing_time(signer_info: &SignerInfo) -> Result<Duration> {
    let signed_attrs = match &signer_info.signed_attrs {
        Some(signed_attrs) => signed_attrs,
        None => return Err(Error::SigningTime("no authenticated attributes".to_string())),
    };
    let attr = signed_attrs
        .iter()
        .find(|a| a.oid == ID_SIGNING_TIME)
        .ok_or_else(|| Error::SigningTime("attribute missing".to_string()))?;
    let value = attr
        .values
        .get(0)
        .ok_or_else(|| Error::SigningTime("attribute is empty".to_string()))?;
    let time = Time::from_der(&value.to_der()?)
        .map_err(|e| Error::SigningTime(format!("unparseable: {e}")))?;
    Ok(time.to_unix_duration())
}

fn get_signer_cert<'a>(sid: &SignerIdentifier, certs: &'a [Certificate]) -> Option<&'a Certificate> {
    certs.iter().find(|cert| match sid {
        SignerIdentifier::IssuerAndSerialNumber(iasn) => {
            cert.tbs_certificate.serial_number == iasn.serial_number
                && cert.tbs_certificate.issuer == iasn.issuer
        }
        SignerIdentifier::SubjectKeyIdentifier(skid) => {
            subject_key_identifier(cert).as_deref() == Some(skid.0.as_bytes())
        }
    })
}

fn subject_key_identifier(cert: &Certificate) -> Option<Vec<u8>> {
    let extensions = cert.tbs_certificate.extensions.as_ref()?;
    let ext = extensions
        .iter()
        .find(|ext| ext.extn_id == ID_CE_SUBJECT_KEY_IDENTIFIER)?;
    let skid = OctetString::from_der(ext.extn_value.as_bytes()).ok()?;
    Some(skid.as_bytes().to_vec())
}
