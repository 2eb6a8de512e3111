//! X.509 certificate and CRL decoding
//!
//! Turns raw bytes plus a declared content type into a field-extracted
//! [`DecodedCertificate`] or [`DecodedCrl`]. Pure transformation, no I/O.
//!
//! # Features
//! - DER and PEM input, detected from the first byte
//! - Subject/issuer names as ordered attribute lists
//! - Key identifiers, distribution points and authority info access
//! - SHA-1 content fingerprint over the DER encoding

mod certificate;
mod content_type;
mod crl;
mod name;

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use ring::digest;
use x509_parser::pem::parse_x509_pem;
use x509_parser::time::ASN1Time;

pub use certificate::{DecodedCertificate, flatten_distribution_points, is_root, serial_to_hex};
pub use content_type::{ContentType, Encoding, PKIX_CERT, PKIX_CRL, X509_CA_CERT, detect_encoding};
pub use crl::{DecodedCrl, RevokedEntry};
pub use name::{DistinguishedName, attribute_name};

use crate::pki::errors::{ObjectKind, PkiError, PkiResult};

/// Either kind of decoded object.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Certificate(DecodedCertificate),
    Crl(DecodedCrl),
}

impl Decoded {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Decoded::Certificate(_) => ObjectKind::Certificate,
            Decoded::Crl(_) => ObjectKind::Crl,
        }
    }

    pub fn fingerprint(&self) -> &str {
        match self {
            Decoded::Certificate(c) => &c.fingerprint,
            Decoded::Crl(c) => &c.fingerprint,
        }
    }
}

/// Decode `raw` according to a declared MIME type.
///
/// Fails with `ContentTypeInvalid` for types outside the allow-list and
/// with `Parse` when the bytes are not an object of the declared kind.
pub fn decode(raw: &[u8], content_type: &str) -> PkiResult<Decoded> {
    decode_as(raw, ContentType::from_mime(content_type)?)
}

pub fn decode_as(raw: &[u8], content_type: ContentType) -> PkiResult<Decoded> {
    let kind = content_type.kind();
    let encoding = detect_encoding(raw);
    let der = match encoding {
        Encoding::Der => Cow::Borrowed(raw),
        Encoding::Pem => Cow::Owned(unarmor(raw, kind)?),
    };

    match content_type {
        ContentType::Certificate => {
            DecodedCertificate::from_der(&der, raw, encoding).map(Decoded::Certificate)
        }
        ContentType::Crl => DecodedCrl::from_der(&der, raw, encoding).map(Decoded::Crl),
    }
}

fn unarmor(raw: &[u8], kind: ObjectKind) -> PkiResult<Vec<u8>> {
    let (_, pem) = parse_x509_pem(raw).map_err(|e| PkiError::parse(kind, e))?;
    let expected = match kind {
        ObjectKind::Certificate => "CERTIFICATE",
        ObjectKind::Crl => "X509 CRL",
    };
    if pem.label != expected {
        return Err(PkiError::parse(
            kind,
            format!("unexpected PEM label {:?}", pem.label),
        ));
    }
    Ok(pem.contents)
}

/// SHA-1 over the DER bytes, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, der))
}

fn asn1_time(time: &ASN1Time, kind: ObjectKind) -> PkiResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| PkiError::parse(kind, format!("timestamp out of range: {time}")))
}
