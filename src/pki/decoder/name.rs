use std::fmt;

use serde::{Deserialize, Serialize};
use x509_parser::x509::X509Name;

/// Long names for the attribute types seen in subject and issuer names.
/// Anything missing here is rendered as its dotted OID.
const ATTRIBUTE_NAMES: &[(&str, &str)] = &[
    ("2.5.4.3", "commonName"),
    ("2.5.4.4", "surname"),
    ("2.5.4.5", "serialNumber"),
    ("2.5.4.6", "countryName"),
    ("2.5.4.7", "localityName"),
    ("2.5.4.8", "stateOrProvinceName"),
    ("2.5.4.9", "streetAddress"),
    ("2.5.4.10", "organizationName"),
    ("2.5.4.11", "organizationalUnitName"),
    ("2.5.4.12", "title"),
    ("2.5.4.15", "businessCategory"),
    ("2.5.4.17", "postalCode"),
    ("2.5.4.42", "givenName"),
    ("2.5.4.43", "initials"),
    ("2.5.4.44", "generationQualifier"),
    ("2.5.4.46", "dnQualifier"),
    ("2.5.4.65", "pseudonym"),
    ("0.9.2342.19200300.100.1.1", "userID"),
    ("0.9.2342.19200300.100.1.25", "domainComponent"),
    ("1.2.840.113549.1.9.1", "emailAddress"),
    ("1.2.643.3.131.1.1", "INN"),
    ("1.2.643.100.1", "OGRN"),
    ("1.2.643.100.3", "SNILS"),
    ("1.2.643.100.4", "INNLE"),
    ("1.2.643.100.5", "OGRNIP"),
];

pub fn attribute_name(oid: &str) -> String {
    ATTRIBUTE_NAMES
        .iter()
        .find(|(id, _)| *id == oid)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| oid.to_string())
}

/// A distinguished name as an ordered list of `(attribute type, value)` pairs.
///
/// Order is kept as encoded, and equality is order-sensitive, which matches
/// how issuer names are chained in X.509.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistinguishedName(Vec<(String, String)>);

impl DistinguishedName {
    pub fn new<I, K, V>(attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn from_x509(name: &X509Name<'_>) -> Self {
        let mut attributes = Vec::new();
        for rdn in name.iter() {
            for attr in rdn.iter() {
                let key = attribute_name(&attr.attr_type().to_id_string());
                let value = match attr.as_str() {
                    Ok(s) => s.to_string(),
                    Err(_) => hex::encode(attr.attr_value().data),
                };
                attributes.push((key, value));
            }
        }
        Self(attributes)
    }

    /// First value recorded for the given attribute type.
    pub fn get(&self, attribute: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == attribute)
            .map(|(_, v)| v.as_str())
    }

    pub fn common_name(&self) -> Option<&str> {
        self.get("commonName")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DistinguishedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}
