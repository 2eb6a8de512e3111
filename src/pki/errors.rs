use thiserror::Error;

use crate::pki::files::FileStoreError;
use crate::pki::models::CertId;
use crate::pki::store::StoreError;

/// Errors raised by the decoder, the reconcilers and the fetch protocol.
///
/// Every variant carries the value that caused it so callers can render
/// a message without re-deriving context.
#[derive(Error, Debug)]
pub enum PkiError {
    #[error("failed to parse {kind}: {reason}")]
    Parse { kind: ObjectKind, reason: String },

    #[error("content type is not allowed: {}", .0.as_deref().unwrap_or("<none>"))]
    ContentTypeInvalid(Option<String>),

    #[error("issuer certificate not found: \"{issuer}\"")]
    CrtNotFound { issuer: String },

    #[error("issuer certificate is ambiguous ({count} matches): \"{issuer}\"")]
    CrtMultipleFound { issuer: String, count: usize },

    #[error("revocation list is already stored: \"{fingerprint}\"")]
    Duplicate { fingerprint: String },

    #[error("revocation list is not newer than the stored one: \"{incoming}\" <= \"{stored}\"")]
    Old { incoming: String, stored: String },

    #[error("revocation list was issued by \"{found}\", not by certificate {expected}")]
    IssuerMismatch { expected: CertId, found: String },

    #[error("invalid url: \"{0}\"")]
    UrlInvalid(String),

    #[error("failed to reach \"{url}\": {reason}")]
    UrlConnection { url: String, reason: String },

    #[error("certificate is already bound to an issuer: \"{0}\"")]
    AlreadyBound(String),

    #[error("no download urls for \"{0}\"")]
    MissingUrls(String),

    #[error("invalid update settings: {0}")]
    Settings(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("File storage error: {0}")]
    Files(#[from] FileStoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenient Result type alias
pub type PkiResult<T> = Result<T, PkiError>;

/// The kind of X.509 object a decode attempt was aiming for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Certificate,
    Crl,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Certificate => f.write_str("certificate"),
            ObjectKind::Crl => f.write_str("revocation list"),
        }
    }
}

/// What a multi-source loop should do after a source failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The failure is local to this source; try the next one.
    NextSource,
    /// The failure holds for every source; stop and report it.
    Abort,
}

impl PkiError {
    pub fn parse(kind: ObjectKind, reason: impl ToString) -> Self {
        Self::Parse {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn connection(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::UrlConnection {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            PkiError::UrlConnection { .. } => Disposition::NextSource,
            _ => Disposition::Abort,
        }
    }

    /// Rejections that only mean "nothing new to store".
    pub fn is_benign(&self) -> bool {
        matches!(self, PkiError::Duplicate { .. } | PkiError::Old { .. })
    }
}
