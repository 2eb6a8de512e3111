use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::num_bigint::BigUint;
use x509_parser::prelude::{FromDer, X509Certificate};

use super::content_type::Encoding;
use super::name::DistinguishedName;
use super::{asn1_time, fingerprint};
use crate::pki::errors::{ObjectKind, PkiError, PkiResult};

const CA_ISSUERS: &str = "1.3.6.1.5.5.7.48.2";
const OCSP: &str = "1.3.6.1.5.5.7.48.1";

/// Field-extracted view of an X.509 certificate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCertificate {
    pub subject: DistinguishedName,
    /// Subject key identifier, lowercase hex.
    pub subject_identifier: Option<String>,
    /// Serial number in decimal.
    pub serial: String,
    pub issuer: DistinguishedName,
    /// Key identifier from the authority key identifier extension.
    pub issuer_identifier: Option<String>,
    /// Issuer serial from the authority key identifier extension.
    pub issuer_serial: Option<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub is_root: bool,
    /// Distribution point index to the URLs it names.
    pub crl_distribution_points: Option<BTreeMap<usize, Vec<String>>>,
    /// Access method (`caIssuers`, `OCSP`, or dotted OID) to URL.
    pub authority_info_access: Option<BTreeMap<String, String>>,
    pub fingerprint: String,
    pub encoding: Encoding,
    /// The bytes as supplied, before any PEM unwrapping.
    pub raw: Vec<u8>,
}

impl DecodedCertificate {
    pub(crate) fn from_der(der: &[u8], raw: &[u8], encoding: Encoding) -> PkiResult<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::parse(ObjectKind::Certificate, e))?;

        let mut decoded = Self {
            subject: DistinguishedName::from_x509(cert.subject()),
            subject_identifier: None,
            serial: cert.tbs_certificate.serial.to_string(),
            issuer: DistinguishedName::from_x509(cert.issuer()),
            issuer_identifier: None,
            issuer_serial: None,
            not_before: asn1_time(&cert.validity().not_before, ObjectKind::Certificate)?,
            not_after: asn1_time(&cert.validity().not_after, ObjectKind::Certificate)?,
            is_ca: false,
            is_root: false,
            crl_distribution_points: None,
            authority_info_access: None,
            fingerprint: fingerprint(der),
            encoding,
            raw: raw.to_vec(),
        };

        for ext in cert.extensions() {
            match ext.parsed_extension() {
                ParsedExtension::BasicConstraints(bc) => decoded.is_ca = bc.ca,
                ParsedExtension::SubjectKeyIdentifier(kid) => {
                    decoded.subject_identifier = Some(hex::encode(kid.0));
                }
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    decoded.issuer_identifier =
                        aki.key_identifier.as_ref().map(|kid| hex::encode(kid.0));
                    decoded.issuer_serial = aki
                        .authority_cert_serial
                        .map(|serial| BigUint::from_bytes_be(serial).to_string());
                }
                ParsedExtension::CRLDistributionPoints(cdp) => {
                    let mut points = BTreeMap::new();
                    for (index, point) in cdp.points.iter().enumerate() {
                        let mut urls = Vec::new();
                        if let Some(DistributionPointName::FullName(names)) =
                            &point.distribution_point
                        {
                            for name in names {
                                if let GeneralName::URI(uri) = name {
                                    urls.push(uri.to_string());
                                }
                            }
                        }
                        points.insert(index, urls);
                    }
                    decoded.crl_distribution_points = Some(points);
                }
                ParsedExtension::AuthorityInfoAccess(aia) => {
                    let mut access = BTreeMap::new();
                    for desc in &aia.accessdescs {
                        if let GeneralName::URI(uri) = &desc.access_location {
                            access.insert(
                                access_method_name(&desc.access_method.to_id_string()),
                                uri.to_string(),
                            );
                        }
                    }
                    decoded.authority_info_access = Some(access);
                }
                _ => {}
            }
        }

        decoded.is_root = is_root(
            decoded.is_ca,
            decoded.subject_identifier.as_deref(),
            decoded.issuer_identifier.as_deref(),
            &decoded.subject,
            &decoded.issuer,
        );
        Ok(decoded)
    }

    /// Serial number in lowercase hex, as used in stored file names.
    pub fn serial_hex(&self) -> String {
        serial_to_hex(&self.serial)
    }

    /// URLs of every distribution point, in order, without duplicates.
    pub fn distribution_urls(&self) -> Vec<String> {
        flatten_distribution_points(self.crl_distribution_points.as_ref())
    }
}

fn access_method_name(oid: &str) -> String {
    match oid {
        CA_ISSUERS => "caIssuers".to_string(),
        OCSP => "OCSP".to_string(),
        other => other.to_string(),
    }
}

/// A CA certificate is a root when it names itself as issuer, either by key
/// identifier or by distinguished name. Two absent key identifiers match.
pub fn is_root(
    is_ca: bool,
    subject_identifier: Option<&str>,
    issuer_identifier: Option<&str>,
    subject: &DistinguishedName,
    issuer: &DistinguishedName,
) -> bool {
    is_ca && (subject_identifier == issuer_identifier || subject == issuer)
}

pub fn serial_to_hex(serial: &str) -> String {
    BigUint::parse_bytes(serial.as_bytes(), 10)
        .map(|n| n.to_str_radix(16))
        .unwrap_or_else(|| serial.to_string())
}

pub fn flatten_distribution_points(points: Option<&BTreeMap<usize, Vec<String>>>) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for url in points.into_iter().flat_map(|p| p.values().flatten()) {
        if !urls.contains(url) {
            urls.push(url.clone());
        }
    }
    urls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::decoder::{ContentType, Decoded, decode_as};

    const ROOT_DER: &[u8] = include_bytes!("../../../test_certs/root.der");
    const INTER_DER: &[u8] = include_bytes!("../../../test_certs/inter.der");
    const LEAF_DER: &[u8] = include_bytes!("../../../test_certs/leaf.der");
    const LEAF_PEM: &[u8] = include_bytes!("../../../test_certs/leaf.pem");

    fn cert(raw: &[u8]) -> DecodedCertificate {
        match decode_as(raw, ContentType::Certificate).unwrap() {
            Decoded::Certificate(c) => c,
            Decoded::Crl(_) => panic!("expected a certificate"),
        }
    }

    #[test]
    fn test_root_certificate() {
        let root = cert(ROOT_DER);
        assert!(root.is_ca);
        assert!(root.is_root);
        assert_eq!(root.serial, "1");
        assert_eq!(root.subject, root.issuer);
        assert_eq!(
            root.subject_identifier.as_deref(),
            Some("024f3753b426204589305774d47de870f98be046")
        );
        assert_eq!(root.fingerprint, "583191d1c6b3665b9c1429deb15b592f9869f745");
        assert_eq!(root.encoding, Encoding::Der);
        assert!(root.crl_distribution_points.is_none());
        assert!(root.authority_info_access.is_none());
    }

    #[test]
    fn test_intermediate_certificate() {
        let inter = cert(INTER_DER);
        assert!(inter.is_ca);
        assert!(!inter.is_root);
        assert_eq!(inter.serial, "4096");
        assert_eq!(inter.subject.common_name(), Some("Pkiman Test Intermediate CA"));
        assert_eq!(inter.issuer.common_name(), Some("Pkiman Test Root CA"));
        assert_eq!(
            inter.issuer_identifier.as_deref(),
            Some("024f3753b426204589305774d47de870f98be046")
        );
        assert_eq!(inter.issuer_serial, None);

        let aia = inter.authority_info_access.as_ref().unwrap();
        assert_eq!(aia["caIssuers"], "http://pki.example.test/root.crt");
        assert_eq!(aia["OCSP"], "http://ocsp.example.test");
        assert_eq!(inter.distribution_urls(), vec!["http://pki.example.test/root.crl"]);
    }

    #[test]
    fn test_leaf_certificate() {
        let leaf = cert(LEAF_DER);
        assert!(!leaf.is_ca);
        assert!(!leaf.is_root);
        assert_eq!(leaf.serial, "1715004");
        assert_eq!(leaf.serial_hex(), "1a2b3c");
        assert_eq!(
            leaf.issuer_identifier.as_deref(),
            Some("a07b6d6b50ef5c66c91a55ef1e47b14008f5220a")
        );

        let points = leaf.crl_distribution_points.as_ref().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[&0], vec!["http://pki.example.test/inter.crl"]);
        assert_eq!(points[&1], vec!["http://mirror.example.test/inter.crl"]);
    }

    #[test]
    fn test_pem_and_der_agree() {
        let der = cert(LEAF_DER);
        let pem = cert(LEAF_PEM);
        assert_eq!(pem.encoding, Encoding::Pem);
        assert_eq!(pem.fingerprint, der.fingerprint);
        assert_eq!(pem.subject, der.subject);
        assert_eq!(pem.raw, LEAF_PEM);
    }

    #[test]
    fn test_root_rule() {
        let ca = DistinguishedName::new([("commonName", "CA")]);
        let other = DistinguishedName::new([("commonName", "Other")]);

        // not a CA: never a root, whatever it names as issuer
        assert!(!is_root(false, Some("ab"), Some("ab"), &ca, &other));
        assert!(!is_root(false, Some("ab"), Some("cd"), &ca, &ca));
        assert!(!is_root(false, None, None, &ca, &ca));

        assert!(is_root(true, Some("ab"), Some("ab"), &ca, &other));
        assert!(is_root(true, Some("ab"), Some("cd"), &ca, &ca));
        assert!(is_root(true, None, None, &ca, &other));
        assert!(!is_root(true, Some("ab"), None, &ca, &other));
        assert!(!is_root(true, Some("ab"), Some("cd"), &ca, &other));
    }

    #[test]
    fn test_serial_to_hex() {
        assert_eq!(serial_to_hex("4096"), "1000");
        assert_eq!(serial_to_hex("not-a-number"), "not-a-number");
    }
}
