//! Persistent store for certificates, revocation lists, schedules and proxies
//!
//! All access goes through [`PkiStore::transaction`] (read-write) or
//! [`PkiStore::view`] (read-only). A transaction either commits every write
//! made through its [`StoreTx`] or none of them.

mod memory;
mod tree;

use thiserror::Error;

pub use memory::MemoryStore;

use crate::pki::decoder::DistinguishedName;
use crate::pki::models::{
    CertId, Certificate, CrlId, NewCertificate, NewProxyConfig, NewRevocationList,
    NewUpdateSchedule, ProxyConfig, ProxyId, RevocationList, ScheduleId, UpdateSchedule,
};

/// Error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {entity}: {key}")]
    Duplicate { entity: &'static str, key: String },

    #[error("{entity} {id} does not exist")]
    NotFound { entity: &'static str, id: u64 },

    #[error("invalid tree operation: {0}")]
    Tree(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A certificate removed from the store together with what went with it.
#[derive(Debug, Clone)]
pub struct Removed {
    pub certificate: Certificate,
    pub crl: Option<RevocationList>,
    /// Former children, now orphans.
    pub orphaned: Vec<CertId>,
}

/// Operations available inside a transaction.
pub trait StoreTx {
    fn certificate(&self, id: CertId) -> StoreResult<Option<Certificate>>;

    /// Lookup by the identity pair (subject, serial).
    fn certificate_by_subject_serial(
        &self,
        subject: &DistinguishedName,
        serial: &str,
    ) -> StoreResult<Option<Certificate>>;

    /// Certificates whose subject and subject key identifier both match.
    /// A `None` identifier only matches certificates without one.
    fn certificates_by_subject(
        &self,
        subject: &DistinguishedName,
        subject_identifier: Option<&str>,
    ) -> StoreResult<Vec<Certificate>>;

    /// Parentless, non-root certificates claiming the given issuer.
    fn orphans_of(
        &self,
        issuer: &DistinguishedName,
        issuer_identifier: Option<&str>,
    ) -> StoreResult<Vec<Certificate>>;

    /// Every certificate in tree order.
    fn certificates(&self) -> StoreResult<Vec<Certificate>>;

    fn children(&self, id: CertId) -> StoreResult<Vec<Certificate>>;

    fn insert_root(&mut self, new: NewCertificate) -> StoreResult<Certificate>;

    fn insert_child(&mut self, parent: CertId, new: NewCertificate) -> StoreResult<Certificate>;

    /// Reattach `id` under `parent`, keeping siblings sorted by subject.
    fn move_to(&mut self, id: CertId, parent: CertId) -> StoreResult<Certificate>;

    /// Delete a certificate and its revocation list. Children become orphans.
    fn remove_certificate(&mut self, id: CertId) -> StoreResult<Removed>;

    fn crl(&self, id: CrlId) -> StoreResult<Option<RevocationList>>;

    fn crl_by_issuer(&self, issuer_id: CertId) -> StoreResult<Option<RevocationList>>;

    fn crls(&self) -> StoreResult<Vec<RevocationList>>;

    fn insert_crl(&mut self, new: NewRevocationList) -> StoreResult<RevocationList>;

    fn update_crl(&mut self, crl: &RevocationList) -> StoreResult<()>;

    fn schedule(&self, id: ScheduleId) -> StoreResult<Option<UpdateSchedule>>;

    fn schedules(&self) -> StoreResult<Vec<UpdateSchedule>>;

    fn insert_schedule(&mut self, new: NewUpdateSchedule) -> StoreResult<UpdateSchedule>;

    fn update_schedule(&mut self, schedule: &UpdateSchedule) -> StoreResult<()>;

    fn proxy(&self, id: ProxyId) -> StoreResult<Option<ProxyConfig>>;

    fn proxies(&self) -> StoreResult<Vec<ProxyConfig>>;

    fn insert_proxy(&mut self, new: NewProxyConfig) -> StoreResult<ProxyConfig>;

    /// At most one proxy may be flagged default; a second one is rejected.
    fn update_proxy(&mut self, proxy: &ProxyConfig) -> StoreResult<()>;
}

/// Abstract interface for store backends.
pub trait PkiStore: Send + Sync + 'static {
    /// Run `f` atomically. Its writes become visible only if it returns `Ok`.
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>;

    /// Run `f` against a consistent read-only view.
    fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>;
}
