use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use x509_parser::extensions::ParsedExtension;
use x509_parser::num_bigint::BigUint;
use x509_parser::prelude::{CertificateRevocationList, FromDer};

use super::content_type::Encoding;
use super::name::DistinguishedName;
use super::{asn1_time, fingerprint};
use crate::pki::errors::{ObjectKind, PkiError, PkiResult};

/// One entry of the revoked list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedEntry {
    pub revoked_at: DateTime<Utc>,
    /// Reason codes as recorded, without interpretation.
    pub reasons: Option<Vec<u8>>,
}

/// Field-extracted view of an X.509 CRL.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCrl {
    pub issuer: DistinguishedName,
    pub issuer_identifier: Option<String>,
    pub issuer_serial: Option<String>,
    /// CRL number in decimal.
    pub crl_number: Option<String>,
    pub last_update: DateTime<Utc>,
    pub next_update: Option<DateTime<Utc>>,
    /// Revoked entries keyed by decimal serial.
    pub revoked: BTreeMap<String, RevokedEntry>,
    pub fingerprint: String,
    pub encoding: Encoding,
    pub raw: Vec<u8>,
}

impl DecodedCrl {
    pub(crate) fn from_der(der: &[u8], raw: &[u8], encoding: Encoding) -> PkiResult<Self> {
        let (_, crl) = CertificateRevocationList::from_der(der)
            .map_err(|e| PkiError::parse(ObjectKind::Crl, e))?;

        let mut issuer_identifier = None;
        let mut issuer_serial = None;
        let mut crl_number = None;
        for ext in crl.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    issuer_identifier = aki.key_identifier.as_ref().map(|kid| hex::encode(kid.0));
                    issuer_serial = aki
                        .authority_cert_serial
                        .map(|serial| BigUint::from_bytes_be(serial).to_string());
                }
                ParsedExtension::CRLNumber(number) => crl_number = Some(number.to_string()),
                _ => {}
            }
        }

        let mut revoked = BTreeMap::new();
        for entry in crl.iter_revoked_certificates() {
            let reasons = entry.reason_code().map(|(_, code)| vec![code.0]);
            revoked.insert(
                entry.user_certificate.to_string(),
                RevokedEntry {
                    revoked_at: asn1_time(&entry.revocation_date, ObjectKind::Crl)?,
                    reasons,
                },
            );
        }

        Ok(Self {
            issuer: DistinguishedName::from_x509(crl.issuer()),
            issuer_identifier,
            issuer_serial,
            crl_number,
            last_update: asn1_time(&crl.last_update(), ObjectKind::Crl)?,
            next_update: crl
                .next_update()
                .map(|t| asn1_time(&t, ObjectKind::Crl))
                .transpose()?,
            revoked,
            fingerprint: fingerprint(der),
            encoding,
            raw: raw.to_vec(),
        })
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }
}
