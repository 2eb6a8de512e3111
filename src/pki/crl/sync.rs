use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::pki::decoder::Decoded;
use crate::pki::errors::{Disposition, PkiError, PkiResult};
use crate::pki::files::{FileStore, with_staged_files};
use crate::pki::locks::EntityLocks;
use crate::pki::models::{CrlId, RevocationList};
use crate::pki::proxy;
use crate::pki::store::{PkiStore, StoreError};

use super::fetcher::{decode_fetched, validate_url};
use super::reconciler::reconcile_expecting;
use super::transport::{HttpTransport, ProxyMap};

/// Outcome of one update attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// A newer list was stored from `url`.
    Updated { crl: RevocationList, url: String },
    /// Every reachable source reported the copy already held.
    UpToDate(RevocationList),
}

impl SyncOutcome {
    pub fn crl(&self) -> &RevocationList {
        match self {
            SyncOutcome::Updated { crl, .. } | SyncOutcome::UpToDate(crl) => crl,
        }
    }

    pub fn is_updated(&self) -> bool {
        matches!(self, SyncOutcome::Updated { .. })
    }
}

/// Keeps stored revocation lists in step with their remote sources.
pub struct CrlSynchronizer<S: PkiStore> {
    store: Arc<S>,
    files: Arc<dyn FileStore>,
    transport: Arc<dyn HttpTransport>,
    locks: EntityLocks,
}

impl<S: PkiStore> CrlSynchronizer<S> {
    pub fn new(
        store: Arc<S>,
        files: Arc<dyn FileStore>,
        transport: Arc<dyn HttpTransport>,
        locks: EntityLocks,
    ) -> Self {
        Self {
            store,
            files,
            transport,
            locks,
        }
    }

    pub fn transport(&self) -> &dyn HttpTransport {
        self.transport.as_ref()
    }

    /// Refresh a revocation list from its configured URLs.
    ///
    /// Sources are tried in order. Each is probed first and only downloaded
    /// when its entity tag or date differs from the last ones seen. The
    /// first source that yields a newer list wins. Connection failures and
    /// malformed URLs move on to the next source; anything else is returned
    /// at once.
    ///
    /// When no source could be reached the last such error is returned.
    /// When at least one answered without a change the list is reported up
    /// to date.
    pub async fn update_crl(&self, crl_id: CrlId) -> PkiResult<SyncOutcome> {
        let _guard = self.locks.lock(format!("crl:{crl_id}")).await;

        let (crl, proxy) = self.store.view(|tx| {
            let crl = tx
                .crl(crl_id)?
                .ok_or(StoreError::NotFound {
                    entity: "revocation list",
                    id: crl_id,
                })?;
            let proxy = proxy::effective_proxy(tx, &crl)?;
            Ok::<_, PkiError>((crl, proxy))
        })?;
        let proxy = proxy::proxy_map(proxy.as_ref())?;

        if crl.urls.is_empty() {
            debug!("Revocation list {} has no update URLs", crl.id);
            return Ok(SyncOutcome::UpToDate(crl));
        }

        let mut last_error = None;
        let mut answered = false;
        for url in &crl.urls {
            if let Err(e) = validate_url(url) {
                warn!("Skipping update source of revocation list {}: {}", crl.id, e);
                last_error = Some(e);
                continue;
            }
            match self.try_source(&crl, url, proxy.clone()).await {
                Ok(Some(updated)) => {
                    return Ok(SyncOutcome::Updated {
                        crl: updated,
                        url: url.clone(),
                    });
                }
                Ok(None) => {
                    debug!("Revocation list at {} is unchanged", url);
                    answered = true;
                }
                Err(e) => match e.disposition() {
                    Disposition::NextSource => {
                        warn!("Update source {} failed: {}", url, e);
                        last_error = Some(e);
                    }
                    Disposition::Abort => return Err(e),
                },
            }
        }

        match last_error {
            Some(e) if !answered => Err(e),
            _ => Ok(SyncOutcome::UpToDate(crl)),
        }
    }

    /// `Ok(None)` when the source reports no change.
    async fn try_source(
        &self,
        crl: &RevocationList,
        url: &str,
        proxy: Option<ProxyMap>,
    ) -> PkiResult<Option<RevocationList>> {
        let probe = self.transport.probe(url, proxy.clone()).await?;
        if !probe.differs_from(crl.f_etag.as_deref(), crl.f_date) {
            return Ok(None);
        }
        debug!(
            "Remote markers of {} changed ({:?}, {:?}), downloading",
            url, probe.etag, probe.date
        );

        let fetched = self.transport.fetch(url, proxy).await?;
        let decoded = match decode_fetched(&fetched).await? {
            Decoded::Crl(decoded) => decoded,
            Decoded::Certificate(_) => {
                return Err(PkiError::ContentTypeInvalid(fetched.content_type.clone()));
            }
        };
        let size = fetched.body.len();

        let now = Utc::now();
        let updated = with_staged_files(self.files.as_ref(), |files| {
            self.store.transaction(|tx| {
                let mut ingested = reconcile_expecting(tx, files, crl.issuer_id, &decoded, now)?;
                let record = &mut ingested.record;
                record.f_etag = probe.etag.clone();
                record.f_date = probe.date;
                record.f_size = Some(size);
                record.f_sync = Some(now);
                tx.update_crl(record)?;
                Ok::<_, PkiError>(ingested.record)
            })
        })?;

        info!(
            "Revocation list {} updated to #{} from {}",
            updated.id,
            updated.crl_number.as_deref().unwrap_or("-"),
            url
        );
        Ok(Some(updated))
    }
}
