use url::Url;

use crate::pki::errors::{ObjectKind, PkiError, PkiResult};

pub const PKIX_CERT: &str = "application/pkix-cert";
pub const X509_CA_CERT: &str = "application/x-x509-ca-cert";
pub const PKIX_CRL: &str = "application/pkix-crl";

/// The allow-listed content types, reduced to the kind of object they carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Certificate,
    Crl,
}

impl ContentType {
    /// Map a MIME type to a content type. Parameters such as `; charset=`
    /// are ignored, anything outside the allow-list is rejected.
    pub fn from_mime(mime: &str) -> PkiResult<Self> {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            PKIX_CERT | X509_CA_CERT => Ok(Self::Certificate),
            PKIX_CRL => Ok(Self::Crl),
            _ => Err(PkiError::ContentTypeInvalid(Some(mime.to_string()))),
        }
    }

    /// Guess the type from the extension of a file name or URL path.
    pub fn guess(location: &str) -> Option<Self> {
        let path = match Url::parse(location) {
            Ok(url) => url.path().to_string(),
            Err(_) => location.to_string(),
        };
        let file_name = path.rsplit(['/', '\\']).next()?;
        let (_, extension) = file_name.rsplit_once('.')?;
        match extension.to_ascii_lowercase().as_str() {
            "crt" | "cer" | "der" => Some(Self::Certificate),
            "crl" => Some(Self::Crl),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Certificate => PKIX_CERT,
            Self::Crl => PKIX_CRL,
        }
    }

    pub fn kind(self) -> ObjectKind {
        match self {
            Self::Certificate => ObjectKind::Certificate,
            Self::Crl => ObjectKind::Crl,
        }
    }
}

/// The two X.509 transfer encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Der,
    Pem,
}

/// DER objects always open with a SEQUENCE tag; anything else is taken as PEM.
pub fn detect_encoding(raw: &[u8]) -> Encoding {
    match raw.first() {
        Some(0x30) => Encoding::Der,
        _ => Encoding::Pem,
    }
}
