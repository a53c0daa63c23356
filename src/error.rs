//! Error types. [`Error`] is what the individual components return; [`ResultCode`] is what a
//! caller of [`HapVerifier`](crate::HapVerifier) sees.

use thiserror::Error;

use crate::provision::ProvisionError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("end of central directory record not found: {0}")]
    Eocd(String),

    #[error("invalid central directory: {0}")]
    CentralDirectory(String),

    #[error("invalid signing block: {0}")]
    SigningBlock(String),

    #[error("read of {len} bytes at {offset} exceeds limit {limit}")]
    OutOfBounds { offset: u64, len: u64, limit: u64 },

    #[error("invalid digest header: {0}")]
    DigestHeader(String),

    #[error("signing block of {0} bytes exceeds the allowed size")]
    BlockTooLarge(i64),

    #[error("signing block declares {0} sub-blocks")]
    TooManyBlocks(i32),

    #[error("content would be split into too many chunks")]
    TooManyChunks,

    #[error("content digest does not match the signed digest")]
    DigestMismatch,

    #[error("PKCS#7 error: {0}")]
    Pkcs7(String),

    #[error("signature does not verify: {0}")]
    SignatureMismatch(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("certificate chain error: {0}")]
    ChainBuild(String),

    #[error("no trusted root issued {0}")]
    NotTrustedRoot(String),

    #[error("certificate {0} is not valid at signing time")]
    CertificateExpired(String),

    #[error("signing time: {0}")]
    SigningTime(String),

    #[error("certificate {0} has been revoked")]
    Revoked(String),

    #[error("CRL error: {0}")]
    Crl(String),

    #[error("trust policy rejected package: {0}")]
    Policy(String),

    #[error("provisioning profile: {0}")]
    Provision(#[from] ProvisionError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ASN.1 error: {0}")]
    Asn1(#[from] der::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::SigningBlock(error.to_string())
    }
}

/// Verification outcome reported to callers. Values are stable and may be stored or sent across
/// process boundaries.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum ResultCode {
    #[error("verification succeeded")]
    VerifySuccess,
    #[error("package path is invalid")]
    FilePathInvalid,
    #[error("package could not be opened")]
    OpenFileError,
    #[error("signing block not found")]
    SignatureNotFound,
    #[error("app PKCS#7 signature verification failed")]
    VerifyAppPkcs7Fail,
    #[error("provisioning profile could not be parsed")]
    ProfileParseFail,
    #[error("app source is not trusted")]
    AppSourceNotTrusted,
    #[error("content digest could not be extracted")]
    GetDigestFail,
    #[error("package integrity check failed")]
    VerifyIntegrityFail,
    #[error("package is too large")]
    FileSizeTooLarge,
    #[error("public key could not be extracted")]
    GetPublicKeyFail,
    #[error("signature could not be extracted")]
    GetSignatureFail,
    #[error("profile sub-block is missing")]
    NoProfileBlockFail,
    #[error("signature verification failed")]
    VerifySignatureFail,
    #[error("trusted sources could not be initialized")]
    VerifySourceInitFail,
    #[error("app id could not be generated")]
    GenerateAppIdFail,
}

impl ResultCode {
    pub fn as_i32(&self) -> i32 {
        match self {
            ResultCode::VerifySuccess => 0,
            ResultCode::FilePathInvalid => -1,
            ResultCode::OpenFileError => -2,
            ResultCode::SignatureNotFound => -3,
            ResultCode::VerifyAppPkcs7Fail => -4,
            ResultCode::ProfileParseFail => -5,
            ResultCode::AppSourceNotTrusted => -6,
            ResultCode::GetDigestFail => -7,
            ResultCode::VerifyIntegrityFail => -8,
            ResultCode::FileSizeTooLarge => -9,
            ResultCode::GetPublicKeyFail => -10,
            ResultCode::GetSignatureFail => -11,
            ResultCode::NoProfileBlockFail => -12,
            ResultCode::VerifySignatureFail => -13,
            ResultCode::VerifySourceInitFail => -14,
            ResultCode::GenerateAppIdFail => -15,
        }
    }
}

impl From<ResultCode> for i32 {
    fn from(code: ResultCode) -> Self {
        code.as_i32()
    }
}
