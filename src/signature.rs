//! Signature verification for signer infos, certificates and CRLs.

use const_oid::db::rfc5912::{RSA_ENCRYPTION, SHA_256_WITH_RSA_ENCRYPTION};
use der::{Decode, Encode};
use log::debug;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, Pss, RsaPublicKey};
use sha2::{Sha256, Sha384, Sha512};
use x509_cert::crl::CertificateList;
use x509_cert::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use x509_cert::Certificate;

use crate::asn1::{
    RsaPssParameters, ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ECDSA_WITH_SHA_512,
    ID_EC_PUBLIC_KEY, ID_MGF_1, ID_RSASSA_PSS, SECP_256_R_1, SECP_384_R_1,
    SHA_384_WITH_RSA_ENCRYPTION, SHA_512_WITH_RSA_ENCRYPTION,
};
use crate::digest::DigestAlgorithm;
use crate::{Error, Result};

const DEFAULT_PSS_SALT_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SignatureScheme {
    RsaPkcs1(DigestAlgorithm),
    RsaPss {
        digest: DigestAlgorithm,
        salt_len: usize,
    },
    Ecdsa(DigestAlgorithm),
}

impl SignatureScheme {
    /// Resolves a signature algorithm identifier. Signer infos may carry a bare key algorithm
    /// (`rsaEncryption`, `id-ecPublicKey`); `digest_hint` supplies the hash for those.
    pub fn from_algorithm(
        algorithm: &AlgorithmIdentifierOwned,
        digest_hint: Option<DigestAlgorithm>,
    ) -> Result<Self> {
        let oid = algorithm.oid;
        let scheme = if oid == SHA_256_WITH_RSA_ENCRYPTION {
            SignatureScheme::RsaPkcs1(DigestAlgorithm::Sha256)
        } else if oid == SHA_384_WITH_RSA_ENCRYPTION {
            SignatureScheme::RsaPkcs1(DigestAlgorithm::Sha384)
        } else if oid == SHA_512_WITH_RSA_ENCRYPTION {
            SignatureScheme::RsaPkcs1(DigestAlgorithm::Sha512)
        } else if oid == ECDSA_WITH_SHA_256 {
            SignatureScheme::Ecdsa(DigestAlgorithm::Sha256)
        } else if oid == ECDSA_WITH_SHA_384 {
            SignatureScheme::Ecdsa(DigestAlgorithm::Sha384)
        } else if oid == ECDSA_WITH_SHA_512 {
            SignatureScheme::Ecdsa(DigestAlgorithm::Sha512)
        } else if oid == ID_RSASSA_PSS {
            pss_scheme(algorithm)?
        } else if oid == RSA_ENCRYPTION {
            SignatureScheme::RsaPkcs1(require_hint(digest_hint, "rsaEncryption")?)
        } else if oid == ID_EC_PUBLIC_KEY {
            SignatureScheme::Ecdsa(require_hint(digest_hint, "id-ecPublicKey")?)
        } else {
            return Err(Error::UnsupportedAlgorithm(format!("signature algorithm {oid}")));
        };
        Ok(scheme)
    }

    pub fn digest_algorithm(&self) -> DigestAlgorithm {
        match self {
            SignatureScheme::RsaPkcs1(digest) => *digest,
            SignatureScheme::RsaPss { digest, .. } => *digest,
            SignatureScheme::Ecdsa(digest) => *digest,
        }
    }

    pub fn is_pss(&self) -> bool {
        matches!(self, SignatureScheme::RsaPss { .. })
    }
}

fn require_hint(hint: Option<DigestAlgorithm>, name: &str) -> Result<DigestAlgorithm> {
    hint.ok_or_else(|| Error::UnsupportedAlgorithm(format!("{name} without a digest algorithm")))
}

fn pss_scheme(algorithm: &AlgorithmIdentifierOwned) -> Result<SignatureScheme> {
    let params = match &algorithm.parameters {
        Some(params) => RsaPssParameters::from_der(&params.to_der()?)?,
        None => {
            return Err(Error::UnsupportedAlgorithm(
                "RSASSA-PSS without parameters".to_string(),
            ))
        }
    };
    let hash = match &params.hash_algorithm {
        Some(hash) => DigestAlgorithm::from_oid(&hash.oid)?,
        None => {
            return Err(Error::UnsupportedAlgorithm(
                "RSASSA-PSS with SHA-1".to_string(),
            ))
        }
    };
    if let Some(mgf) = &params.mask_gen_algorithm {
        if mgf.oid != ID_MGF_1 {
            return Err(Error::UnsupportedAlgorithm(format!("mask generation {}", mgf.oid)));
        }
        let mgf_hash = match &mgf.parameters {
            Some(p) => AlgorithmIdentifierOwned::from_der(&p.to_der()?)?,
            None => {
                return Err(Error::UnsupportedAlgorithm(
                    "MGF1 without a hash".to_string(),
                ))
            }
        };
        if DigestAlgorithm::from_oid(&mgf_hash.oid)? != hash {
            return Err(Error::UnsupportedAlgorithm(
                "MGF1 hash differs from the message hash".to_string(),
            ));
        }
    }
    if params.trailer_field.unwrap_or(1) != 1 {
        return Err(Error::UnsupportedAlgorithm("PSS trailer field".to_string()));
    }
    Ok(SignatureScheme::RsaPss {
        digest: hash,
        salt_len: params
            .salt_length
            .map(|len| len as usize)
            .unwrap_or(DEFAULT_PSS_SALT_LEN),
    })
}

/// Hashes `message` with the scheme's digest and verifies `signature` over it.
pub(crate) fn verify_message(
    scheme: &SignatureScheme,
    spki: &SubjectPublicKeyInfoOwned,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let digest = scheme.digest_algorithm().digest(message);
    verify_prehash(scheme, spki, &digest, signature)
}

/// Verifies `signature` over an already computed digest.
pub(crate) fn verify_prehash(
    scheme: &SignatureScheme,
    spki: &SubjectPublicKeyInfoOwned,
    digest: &[u8],
    signature: &[u8],
) -> Result<()> {
    let spki_der = spki.to_der()?;
    match scheme {
        SignatureScheme::RsaPkcs1(algorithm) => {
            let key = rsa_key(&spki_der)?;
            let padding = match algorithm {
                DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                DigestAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
                DigestAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
            };
            key.verify(padding, digest, signature)
                .map_err(|e| Error::SignatureMismatch(format!("RSA PKCS#1 v1.5: {e}")))
        }
        SignatureScheme::RsaPss { digest: algorithm, salt_len } => {
            let key = rsa_key(&spki_der)?;
            let padding = match algorithm {
                DigestAlgorithm::Sha256 => Pss::new_with_salt::<Sha256>(*salt_len),
                DigestAlgorithm::Sha384 => Pss::new_with_salt::<Sha384>(*salt_len),
                DigestAlgorithm::Sha512 => Pss::new_with_salt::<Sha512>(*salt_len),
            };
            key.verify(padding, digest, signature)
                .map_err(|e| Error::SignatureMismatch(format!("RSASSA-PSS: {e}")))
        }
        SignatureScheme::Ecdsa(_) => verify_ecdsa(spki, &spki_der, digest, signature),
    }
}

fn rsa_key(spki_der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(spki_der)
        .map_err(|e| Error::SignatureMismatch(format!("invalid RSA public key: {e}")))
}

fn verify_ecdsa(
    spki: &SubjectPublicKeyInfoOwned,
    spki_der: &[u8],
    digest: &[u8],
    signature: &[u8],
) -> Result<()> {
    if spki.algorithm.oid != ID_EC_PUBLIC_KEY {
        return Err(Error::SignatureMismatch(format!(
            "ECDSA signature with a {} key",
            spki.algorithm.oid
        )));
    }
    let curve = match &spki.algorithm.parameters {
        Some(params) => params.decode_as::<const_oid::ObjectIdentifier>()?,
        None => return Err(Error::UnsupportedAlgorithm("EC key without a curve".to_string())),
    };
    let mismatch = |e: p256::ecdsa::Error| Error::SignatureMismatch(format!("ECDSA: {e}"));
    if curve == SECP_256_R_1 {
        let key = p256::ecdsa::VerifyingKey::from_public_key_der(spki_der)
            .map_err(|e| Error::SignatureMismatch(format!("invalid P-256 key: {e}")))?;
        let signature = p256::ecdsa::Signature::from_der(signature).map_err(mismatch)?;
        key.verify_prehash(digest, &signature).map_err(mismatch)
    } else if curve == SECP_384_R_1 {
        let key = p384::ecdsa::VerifyingKey::from_public_key_der(spki_der)
            .map_err(|e| Error::SignatureMismatch(format!("invalid P-384 key: {e}")))?;
        let signature = p384::ecdsa::Signature::from_der(signature).map_err(mismatch)?;
        key.verify_prehash(digest, &signature).map_err(mismatch)
    } else {
        Err(Error::UnsupportedAlgorithm(format!("curve {curve}")))
    }
}

/// Checks that `issuer` signed `cert`.
pub(crate) fn verify_certificate(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    let scheme = SignatureScheme::from_algorithm(&cert.signature_algorithm, None)?;
    let tbs = cert.tbs_certificate.to_der()?;
    let signature = cert
        .signature
        .as_bytes()
        .ok_or_else(|| Error::SignatureMismatch("certificate signature has unused bits".into()))?;
    verify_message(
        &scheme,
        &issuer.tbs_certificate.subject_public_key_info,
        &tbs,
        signature,
    )
}

/// True if `issuer` is the named issuer of `cert` and its key verifies `cert`.
pub(crate) fn is_issued_by(cert: &Certificate, issuer: &Certificate) -> bool {
    if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return false;
    }
    match verify_certificate(cert, issuer) {
        Ok(()) => true,
        Err(e) => {
            debug!("issuer name matched but signature did not: {e}");
            false
        }
    }
}

/// Checks that `issuer` signed `crl`.
pub(crate) fn verify_crl(crl: &CertificateList, issuer: &Certificate) -> Result<()> {
    let scheme = SignatureScheme::from_algorithm(&crl.signature_algorithm, None)?;
    let tbs = crl.tbs_cert_list.to_der()?;
    let signature = crl
        .signature
        .as_bytes()
        .ok_or_else(|| Error::SignatureMismatch("CRL signature has unused bits".into()))?;
    verify_message(
        &scheme,
        &issuer.tbs_certificate.subject_public_key_info,
        &tbs,
        signature,
    )
}
