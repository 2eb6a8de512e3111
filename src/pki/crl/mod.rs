//! Certificate Revocation List (CRL) handling
//!
//! # Features
//! - Reconciling decoded CRLs against their issuer and the stored copy
//! - Change probing and multi-source retrieval over HTTP
//! - Schedule-driven periodic refresh

pub mod fetcher;
mod reconciler;
pub mod scheduler;
mod sync;
pub mod transport;

pub use fetcher::{Downloaded, get_from_url, get_from_url_list, validate_url};
pub use reconciler::ingest_crl;
pub(crate) use reconciler::reconcile_expecting;
pub use scheduler::{CrlScheduler, RunSummary, due_crls, run_due_updates};
pub use sync::{CrlSynchronizer, SyncOutcome};
pub use transport::{Body, Fetched, HttpTransport, Probe, ProxyMap, ReqwestTransport};
