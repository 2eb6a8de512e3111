//! Entry point for everything an operator does with the PKI store.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::pki::crl::{
    CrlSynchronizer, HttpTransport, ProxyMap, SyncOutcome, get_from_url, get_from_url_list,
    ingest_crl, reconcile_expecting, validate_url,
};
use crate::pki::decoder::{ContentType, Decoded, PKIX_CRL, decode, decode_as};
use crate::pki::errors::{PkiError, PkiResult};
use crate::pki::files::{FileStore, with_staged_files};
use crate::pki::hierarchy::{Ingested, ingest_certificate};
use crate::pki::journal::Journal;
use crate::pki::locks::EntityLocks;
use crate::pki::models::{
    CertId, Certificate, CrlId, CrlUpdateSettings, NewUpdateSchedule, RevocationList,
    UpdateSchedule,
};
use crate::pki::proxy::{default_proxy, proxy_map};
use crate::pki::store::{PkiStore, Removed, StoreError};

/// What an upload turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum Uploaded {
    Certificate(Ingested<Certificate>),
    Crl(Ingested<RevocationList>),
}

impl Uploaded {
    pub fn created(&self) -> bool {
        match self {
            Uploaded::Certificate(ingested) => ingested.created,
            Uploaded::Crl(ingested) => ingested.created,
        }
    }
}

/// Result of [`PkiRegistry::fetch_parent`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParentFetch {
    pub issuer: Ingested<Certificate>,
    /// The issuer's revocation list, when it could be retrieved too.
    pub crl: Option<Ingested<RevocationList>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub existing: usize,
    pub failed: usize,
}

pub struct PkiRegistry<S: PkiStore> {
    store: Arc<S>,
    files: Arc<dyn FileStore>,
    transport: Arc<dyn HttpTransport>,
    journal: Arc<dyn Journal>,
    locks: EntityLocks,
    sync: Arc<CrlSynchronizer<S>>,
}

impl<S: PkiStore> PkiRegistry<S> {
    pub fn new(
        store: Arc<S>,
        files: Arc<dyn FileStore>,
        transport: Arc<dyn HttpTransport>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        let locks = EntityLocks::new();
        let sync = Arc::new(CrlSynchronizer::new(
            store.clone(),
            files.clone(),
            transport.clone(),
            locks.clone(),
        ));
        Self {
            store,
            files,
            transport,
            journal,
            locks,
            sync,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn synchronizer(&self) -> Arc<CrlSynchronizer<S>> {
        self.sync.clone()
    }

    pub fn journal(&self) -> Arc<dyn Journal> {
        self.journal.clone()
    }

    pub fn file_url(&self, name: &str) -> String {
        self.files.url(name)
    }

    /// Decode `raw` as `content_type` and store it.
    pub fn upload(&self, raw: &[u8], content_type: &str) -> PkiResult<Uploaded> {
        let result = decode(raw, content_type).and_then(|decoded| self.ingest(&decoded));
        self.report(&result);
        result
    }

    /// Download a single object and store it. Goes through the default
    /// proxy when one is set.
    pub async fn upload_from_url(&self, url: &str) -> PkiResult<Uploaded> {
        let result: PkiResult<Uploaded> = async {
            let proxy = self.default_proxy_map()?;
            let downloaded = get_from_url(self.transport.as_ref(), url, proxy).await?;
            self.ingest(&downloaded.decoded)
        }
        .await;
        self.report(&result);
        result
    }

    fn ingest(&self, decoded: &Decoded) -> PkiResult<Uploaded> {
        match decoded {
            Decoded::Certificate(cert) => {
                ingest_certificate(self.store.as_ref(), self.files.as_ref(), cert)
                    .map(Uploaded::Certificate)
            }
            Decoded::Crl(crl) => {
                ingest_crl(self.store.as_ref(), self.files.as_ref(), crl).map(Uploaded::Crl)
            }
        }
    }

    fn report(&self, result: &PkiResult<Uploaded>) {
        match result {
            Ok(Uploaded::Certificate(ingested)) if ingested.created => self
                .journal
                .info(&format!("Certificate {} stored", ingested.record)),
            Ok(Uploaded::Certificate(ingested)) => self
                .journal
                .info(&format!("Certificate {} is already stored", ingested.record)),
            Ok(Uploaded::Crl(ingested)) => self.journal.info(&format!(
                "Revocation list {} stored (#{})",
                ingested.record.id,
                ingested.record.crl_number.as_deref().unwrap_or("-")
            )),
            Err(e) if e.is_benign() => self.journal.warn(&format!("Upload rejected: {e}")),
            Err(e) => self.journal.error(&format!("Upload failed: {e}")),
        }
    }

    /// Remove a certificate with its revocation list and both files.
    /// Its children stay, as orphans.
    pub fn delete_certificate(&self, id: CertId) -> PkiResult<Removed> {
        let removed = self
            .store
            .transaction(|tx| tx.remove_certificate(id).map_err(PkiError::from))?;

        let mut names = vec![removed.certificate.file.as_str()];
        if let Some(crl) = &removed.crl {
            names.push(crl.file.as_str());
        }
        for name in names {
            if let Err(e) = self.files.delete(name) {
                warn!("Failed to delete {}: {}", name, e);
            }
        }

        self.journal.info(&format!(
            "Certificate {} deleted, {} children orphaned",
            removed.certificate,
            removed.orphaned.len()
        ));
        Ok(removed)
    }

    /// Set where and when a revocation list is refreshed from.
    pub fn configure_crl_updates(
        &self,
        crl_id: CrlId,
        settings: CrlUpdateSettings,
    ) -> PkiResult<RevocationList> {
        let mut urls: Vec<String> = Vec::new();
        for url in &settings.urls {
            let url = url.trim();
            if url.is_empty() {
                continue;
            }
            validate_url(url)?;
            if !urls.iter().any(|u| u == url) {
                urls.push(url.to_string());
            }
        }
        if settings.active && urls.is_empty() {
            return Err(PkiError::Settings(
                "active updates need at least one url".to_string(),
            ));
        }

        let crl = self.store.transaction(|tx| {
            let mut crl = tx.crl(crl_id)?.ok_or(StoreError::NotFound {
                entity: "revocation list",
                id: crl_id,
            })?;

            if let Some(schedule_id) = settings.schedule_id
                && tx.schedule(schedule_id)?.is_none()
            {
                return Err(StoreError::NotFound {
                    entity: "schedule",
                    id: schedule_id,
                }
                .into());
            }

            let proxy_id = if settings.no_proxy {
                None
            } else if let Some(proxy_id) = settings.proxy_id {
                tx.proxy(proxy_id)?.ok_or(StoreError::NotFound {
                    entity: "proxy",
                    id: proxy_id,
                })?;
                Some(proxy_id)
            } else {
                default_proxy(tx)?.map(|p| p.id)
            };

            crl.urls = urls;
            crl.active = settings.active;
            crl.no_proxy = settings.no_proxy;
            crl.proxy_id = proxy_id;
            crl.schedule_id = settings.schedule_id;
            crl.updated_at = Utc::now();
            tx.update_crl(&crl)?;
            Ok::<_, PkiError>(crl)
        })?;

        info!(
            "Revocation list {} updates {} from {} url(s)",
            crl.id,
            if crl.active { "enabled" } else { "disabled" },
            crl.urls.len()
        );
        Ok(crl)
    }

    pub fn add_schedule(&self, new: NewUpdateSchedule) -> PkiResult<UpdateSchedule> {
        if new.name.trim().is_empty() {
            return Err(PkiError::Settings("schedule name is empty".to_string()));
        }
        if new.start == new.end {
            return Err(PkiError::Settings(format!(
                "schedule {} has an empty window",
                new.name
            )));
        }
        self.store
            .transaction(|tx| tx.insert_schedule(new).map_err(PkiError::from))
    }

    /// Refresh one revocation list now.
    pub async fn update_crl(&self, crl_id: CrlId) -> PkiResult<SyncOutcome> {
        let result = self.sync.update_crl(crl_id).await;
        match &result {
            Ok(SyncOutcome::Updated { crl, url }) => self.journal.info(&format!(
                "Revocation list {} updated to #{} from {}",
                crl.id,
                crl.crl_number.as_deref().unwrap_or("-"),
                url
            )),
            Ok(SyncOutcome::UpToDate(_)) => {}
            Err(e) if e.is_benign() => self
                .journal
                .warn(&format!("Revocation list {crl_id}: {e}")),
            Err(e) => self
                .journal
                .error(&format!("Revocation list {crl_id} update failed: {e}")),
        }
        result
    }

    /// Download the issuer of an orphan from its authority info access
    /// URLs, then the issuer's revocation list from the orphan's
    /// distribution points.
    ///
    /// A failed CRL download is journaled and leaves `crl` empty; the
    /// issuer stays stored.
    pub async fn fetch_parent(&self, cert_id: CertId) -> PkiResult<ParentFetch> {
        let _guard = self.locks.lock(format!("crt:{cert_id}")).await;

        let cert = self.store.view(|tx| {
            tx.certificate(cert_id)?.ok_or(PkiError::Store(StoreError::NotFound {
                entity: "certificate",
                id: cert_id,
            }))
        })?;
        if cert.is_bound() {
            return Err(PkiError::AlreadyBound(cert.to_string()));
        }
        let urls = cert.issuer_urls();
        if urls.is_empty() {
            return Err(PkiError::MissingUrls(cert.to_string()));
        }
        let proxy = self.default_proxy_map()?;

        let downloaded = get_from_url_list(self.transport.as_ref(), &urls, proxy.clone()).await?;
        let Decoded::Certificate(decoded) = downloaded.decoded else {
            return Err(PkiError::ContentTypeInvalid(Some(PKIX_CRL.to_string())));
        };
        let issuer = ingest_certificate(self.store.as_ref(), self.files.as_ref(), &decoded)?;
        self.journal.info(&format!(
            "Issuer {} of {} downloaded from {}",
            issuer.record, cert, downloaded.url
        ));

        let relinked = self
            .store
            .view(|tx| tx.certificate(cert_id).map_err(PkiError::from))?
            .is_some_and(|c| c.parent_id == Some(issuer.record.id));
        if !relinked {
            warn!("{} did not issue {}", issuer.record, cert);
        }

        let crl_urls = cert.distribution_urls();
        if crl_urls.is_empty() {
            debug!("{} names no distribution points", cert);
            return Ok(ParentFetch { issuer, crl: None });
        }

        let crl = match self.fetch_issuer_crl(issuer.record.id, &crl_urls, proxy).await {
            Ok(crl) => {
                self.journal.info(&format!(
                    "Revocation list of {} downloaded (#{})",
                    issuer.record,
                    crl.record.crl_number.as_deref().unwrap_or("-")
                ));
                Some(crl)
            }
            Err(e) if e.is_benign() => {
                self.journal
                    .warn(&format!("Revocation list of {}: {}", issuer.record, e));
                None
            }
            Err(e) => {
                self.journal.error(&format!(
                    "Revocation list of {} could not be downloaded: {}",
                    issuer.record, e
                ));
                None
            }
        };
        Ok(ParentFetch { issuer, crl })
    }

    async fn fetch_issuer_crl(
        &self,
        issuer_id: CertId,
        urls: &[String],
        proxy: Option<ProxyMap>,
    ) -> PkiResult<Ingested<RevocationList>> {
        let downloaded = get_from_url_list(self.transport.as_ref(), urls, proxy).await?;
        let Decoded::Crl(decoded) = downloaded.decoded else {
            return Err(PkiError::ContentTypeInvalid(Some(
                ContentType::Certificate.mime().to_string(),
            )));
        };

        with_staged_files(self.files.as_ref(), |files| {
            self.store.transaction(|tx| {
                let mut ingested = reconcile_expecting(tx, files, issuer_id, &decoded, Utc::now())?;
                ingested.record.urls = urls.to_vec();
                tx.update_crl(&ingested.record)?;
                Ok(ingested)
            })
        })
    }

    fn default_proxy_map(&self) -> PkiResult<Option<ProxyMap>> {
        let proxy = self.store.view(|tx| default_proxy(tx))?;
        proxy_map(proxy.filter(|p| p.is_active).as_ref())
    }

    /// Store every certificate and CRL file below `dir`. Certificates go
    /// first so revocation lists find their issuers.
    pub fn import_dir(&self, dir: &Path) -> PkiResult<ImportSummary> {
        let mut summary = ImportSummary::default();
        let mut found = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry under {:?}: {}", dir, e);
                    summary.failed += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(content_type) = entry.path().to_str().and_then(ContentType::guess) {
                found.push((content_type, entry.into_path()));
            }
        }
        found.sort_by_key(|(content_type, _)| *content_type == ContentType::Crl);

        for (content_type, path) in found {
            let result = std::fs::read(&path)
                .map_err(PkiError::from)
                .and_then(|raw| decode_as(&raw, content_type))
                .and_then(|decoded| self.ingest(&decoded));
            match result {
                Ok(uploaded) if uploaded.created() => summary.imported += 1,
                Ok(_) => summary.existing += 1,
                Err(e) if e.is_benign() => summary.existing += 1,
                Err(e) => {
                    warn!("Failed to import {:?}: {}", path, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Imported {} files from {:?} ({} already stored, {} failed)",
            summary.imported, dir, summary.existing, summary.failed
        );
        if summary.imported > 0 || summary.failed > 0 {
            self.journal.info(&format!(
                "Import from {}: {} stored, {} failed",
                dir.display(),
                summary.imported,
                summary.failed
            ));
        }
        Ok(summary)
    }

    pub fn certificate(&self, id: CertId) -> PkiResult<Option<Certificate>> {
        self.store
            .view(|tx| tx.certificate(id).map_err(PkiError::from))
    }

    /// Every certificate in tree order.
    pub fn certificates(&self) -> PkiResult<Vec<Certificate>> {
        self.store.view(|tx| tx.certificates().map_err(PkiError::from))
    }

    pub fn roots(&self) -> PkiResult<Vec<Certificate>> {
        self.filter_certificates(|c| c.is_root_ca)
    }

    pub fn authorities(&self) -> PkiResult<Vec<Certificate>> {
        self.filter_certificates(|c| c.is_ca)
    }

    pub fn orphans(&self) -> PkiResult<Vec<Certificate>> {
        self.filter_certificates(Certificate::is_orphan)
    }

    /// Certificates whose validity ends within `window` after `now`.
    pub fn expiring(&self, now: DateTime<Utc>, window: Duration) -> PkiResult<Vec<Certificate>> {
        self.filter_certificates(|c| c.expires_within(now, window))
    }

    fn filter_certificates(&self, keep: impl Fn(&Certificate) -> bool) -> PkiResult<Vec<Certificate>> {
        Ok(self
            .certificates()?
            .into_iter()
            .filter(|c| keep(c))
            .collect())
    }

    pub fn crl(&self, id: CrlId) -> PkiResult<Option<RevocationList>> {
        self.store.view(|tx| tx.crl(id).map_err(PkiError::from))
    }

    pub fn crl_of(&self, issuer_id: CertId) -> PkiResult<Option<RevocationList>> {
        self.store
            .view(|tx| tx.crl_by_issuer(issuer_id).map_err(PkiError::from))
    }

    pub fn crls(&self) -> PkiResult<Vec<RevocationList>> {
        self.store.view(|tx| tx.crls().map_err(PkiError::from))
    }

    /// Revocation lists whose next update falls within `window` after `now`.
    pub fn crls_due(&self, now: DateTime<Utc>, window: Duration) -> PkiResult<Vec<RevocationList>> {
        Ok(self
            .crls()?
            .into_iter()
            .filter(|crl| crl.next_update_within(now, window))
            .collect())
    }

    pub fn schedules(&self) -> PkiResult<Vec<UpdateSchedule>> {
        self.store.view(|tx| tx.schedules().map_err(PkiError::from))
    }
}
