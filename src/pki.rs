pub mod crl;
pub mod decoder;
pub mod errors;
pub mod files;
pub mod hierarchy;
pub mod journal;
pub mod locks;
pub mod models;
pub mod proxy;
pub mod registry;
pub mod store;

// Re-export commonly used types
pub use crl::{CrlScheduler, CrlSynchronizer, HttpTransport, ReqwestTransport, SyncOutcome};
pub use decoder::{Decoded, decode};
pub use errors::{Disposition, PkiError, PkiResult};
pub use files::{FileStore, FsFileStore, MemoryFileStore};
pub use journal::{Journal, MemoryJournal, TeeJournal, TracingJournal};
pub use registry::{ImportSummary, ParentFetch, PkiRegistry, Uploaded};
pub use store::{MemoryStore, PkiStore};
