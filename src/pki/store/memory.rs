use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{PkiStore, Removed, StoreError, StoreResult, StoreTx, tree};
use crate::pki::decoder::DistinguishedName;
use crate::pki::models::{
    CertId, Certificate, CrlId, NewCertificate, NewProxyConfig, NewRevocationList,
    NewUpdateSchedule, ProxyConfig, ProxyId, RevocationList, ScheduleId, UpdateSchedule,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    next_id: u64,
    certificates: BTreeMap<CertId, Certificate>,
    crls: BTreeMap<CrlId, RevocationList>,
    schedules: BTreeMap<ScheduleId, UpdateSchedule>,
    proxies: BTreeMap<ProxyId, ProxyConfig>,
}

/// An in-memory store.
///
/// Each transaction works on a copy of the tables and swaps it in on
/// success. With a snapshot path the committed tables are also written to
/// disk as JSON before they become visible.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by a JSON snapshot, loading it if it exists.
    pub fn open<P: Into<PathBuf>>(path: P) -> StoreResult<Self> {
        let path = path.into();
        let tables = if path.exists() {
            let content = fs::read(&path)?;
            let tables: Tables = serde_json::from_slice(&content)?;
            info!(
                "Loaded store snapshot from {:?}: {} certificates, {} revocation lists",
                path,
                tables.certificates.len(),
                tables.crls.len()
            );
            tables
        } else {
            info!("No store snapshot at {:?}, starting empty", path);
            Tables::default()
        };
        Ok(Self {
            tables: Arc::new(Mutex::new(tables)),
            snapshot: Some(path),
        })
    }

    fn persist(path: &Path, tables: &Tables) -> StoreResult<()> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec(tables)?)?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        debug!("Wrote store snapshot to {:?}", path);
        Ok(())
    }
}

impl PkiStore for MemoryStore {
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self.tables.lock();
        let mut working = guard.clone();
        let value = f(&mut working)?;
        if let Some(path) = &self.snapshot {
            Self::persist(path, &working)?;
        }
        *guard = working;
        Ok(value)
    }

    fn view<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&dyn StoreTx) -> Result<T, E>,
        E: From<StoreError>,
    {
        let guard = self.tables.lock();
        f(&*guard)
    }
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_certificate_unique(&self, new: &NewCertificate) -> StoreResult<()> {
        for cert in self.certificates.values() {
            if cert.fingerprint == new.fingerprint {
                return Err(StoreError::Duplicate {
                    entity: "certificate.fingerprint",
                    key: new.fingerprint.clone(),
                });
            }
            if cert.issuer == new.issuer && cert.serial == new.serial {
                return Err(StoreError::Duplicate {
                    entity: "certificate.(issuer, serial)",
                    key: format!("{} / {}", new.issuer, new.serial),
                });
            }
        }
        Ok(())
    }

    fn insert_certificate(
        &mut self,
        parent: Option<CertId>,
        new: NewCertificate,
    ) -> StoreResult<Certificate> {
        self.check_certificate_unique(&new)?;
        let id = self.next_id();
        let cert = Certificate {
            id,
            subject: new.subject,
            subject_identifier: new.subject_identifier,
            serial: new.serial,
            issuer: new.issuer,
            issuer_identifier: new.issuer_identifier,
            issuer_serial: new.issuer_serial,
            parent_id: None,
            path: String::new(),
            depth: 0,
            numchild: 0,
            fingerprint: new.fingerprint,
            file: new.file,
            not_before: new.not_before,
            not_after: new.not_after,
            revoked_at: None,
            is_ca: new.is_ca,
            is_root_ca: new.is_root_ca,
            crl_distribution_points: new.crl_distribution_points,
            authority_info_access: new.authority_info_access,
            created_at: Utc::now(),
        };
        self.certificates.insert(id, cert);
        tree::attach(&mut self.certificates, id, parent)?;
        self.certificate_or_missing(id)
    }

    fn certificate_or_missing(&self, id: CertId) -> StoreResult<Certificate> {
        self.certificates
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "certificate",
                id,
            })
    }
}

impl StoreTx for Tables {
    fn certificate(&self, id: CertId) -> StoreResult<Option<Certificate>> {
        Ok(self.certificates.get(&id).cloned())
    }

    fn certificate_by_subject_serial(
        &self,
        subject: &DistinguishedName,
        serial: &str,
    ) -> StoreResult<Option<Certificate>> {
        Ok(self
            .certificates
            .values()
            .find(|c| &c.subject == subject && c.serial == serial)
            .cloned())
    }

    fn certificates_by_subject(
        &self,
        subject: &DistinguishedName,
        subject_identifier: Option<&str>,
    ) -> StoreResult<Vec<Certificate>> {
        Ok(self
            .certificates
            .values()
            .filter(|c| {
                &c.subject == subject && c.subject_identifier.as_deref() == subject_identifier
            })
            .cloned()
            .collect())
    }

    fn orphans_of(
        &self,
        issuer: &DistinguishedName,
        issuer_identifier: Option<&str>,
    ) -> StoreResult<Vec<Certificate>> {
        Ok(self
            .certificates
            .values()
            .filter(|c| {
                c.parent_id.is_none()
                    && !c.is_root_ca
                    && &c.issuer == issuer
                    && c.issuer_identifier.as_deref() == issuer_identifier
            })
            .cloned()
            .collect())
    }

    fn certificates(&self) -> StoreResult<Vec<Certificate>> {
        let mut all: Vec<Certificate> = self.certificates.values().cloned().collect();
        all.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(all)
    }

    fn children(&self, id: CertId) -> StoreResult<Vec<Certificate>> {
        let mut children: Vec<Certificate> = self
            .certificates
            .values()
            .filter(|c| c.parent_id == Some(id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(children)
    }

    fn insert_root(&mut self, new: NewCertificate) -> StoreResult<Certificate> {
        self.insert_certificate(None, new)
    }

    fn insert_child(&mut self, parent: CertId, new: NewCertificate) -> StoreResult<Certificate> {
        if !self.certificates.contains_key(&parent) {
            return Err(StoreError::NotFound {
                entity: "certificate",
                id: parent,
            });
        }
        self.insert_certificate(Some(parent), new)
    }

    fn move_to(&mut self, id: CertId, parent: CertId) -> StoreResult<Certificate> {
        tree::attach(&mut self.certificates, id, Some(parent))?;
        self.certificate_or_missing(id)
    }

    fn remove_certificate(&mut self, id: CertId) -> StoreResult<Removed> {
        let orphaned: Vec<CertId> = self
            .certificates
            .values()
            .filter(|c| c.parent_id == Some(id))
            .map(|c| c.id)
            .collect();
        for child in &orphaned {
            tree::attach(&mut self.certificates, *child, None)?;
        }

        let parent = self.certificate_or_missing(id)?.parent_id;
        let certificate = self
            .certificates
            .remove(&id)
            .ok_or(StoreError::NotFound {
                entity: "certificate",
                id,
            })?;
        tree::renumber(&mut self.certificates, parent)?;

        let crl_id = self
            .crls
            .values()
            .find(|crl| crl.issuer_id == id)
            .map(|crl| crl.id);
        let crl = crl_id.and_then(|crl_id| self.crls.remove(&crl_id));

        Ok(Removed {
            certificate,
            crl,
            orphaned,
        })
    }

    fn crl(&self, id: CrlId) -> StoreResult<Option<RevocationList>> {
        Ok(self.crls.get(&id).cloned())
    }

    fn crl_by_issuer(&self, issuer_id: CertId) -> StoreResult<Option<RevocationList>> {
        Ok(self
            .crls
            .values()
            .find(|crl| crl.issuer_id == issuer_id)
            .cloned())
    }

    fn crls(&self) -> StoreResult<Vec<RevocationList>> {
        Ok(self.crls.values().cloned().collect())
    }

    fn insert_crl(&mut self, new: NewRevocationList) -> StoreResult<RevocationList> {
        if !self.certificates.contains_key(&new.issuer_id) {
            return Err(StoreError::NotFound {
                entity: "certificate",
                id: new.issuer_id,
            });
        }
        for crl in self.crls.values() {
            if crl.issuer_id == new.issuer_id {
                return Err(StoreError::Duplicate {
                    entity: "crl.issuer",
                    key: new.issuer_id.to_string(),
                });
            }
            if crl.fingerprint == new.fingerprint {
                return Err(StoreError::Duplicate {
                    entity: "crl.fingerprint",
                    key: new.fingerprint.clone(),
                });
            }
        }

        let now = Utc::now();
        let id = self.next_id();
        let crl = RevocationList {
            id,
            issuer_id: new.issuer_id,
            fingerprint: new.fingerprint,
            crl_number: new.crl_number,
            last_update: new.last_update,
            next_update: new.next_update,
            revoked_count: new.revoked_count,
            file: new.file,
            urls: Vec::new(),
            active: false,
            proxy_id: None,
            no_proxy: false,
            schedule_id: None,
            f_etag: None,
            f_date: None,
            f_size: None,
            f_sync: None,
            created_at: now,
            updated_at: now,
        };
        self.crls.insert(id, crl.clone());
        Ok(crl)
    }

    fn update_crl(&mut self, crl: &RevocationList) -> StoreResult<()> {
        let stored = self.crls.get(&crl.id).ok_or(StoreError::NotFound {
            entity: "crl",
            id: crl.id,
        })?;
        if stored.issuer_id != crl.issuer_id {
            return Err(StoreError::Tree(format!(
                "issuer of revocation list {} cannot change",
                crl.id
            )));
        }
        if self
            .crls
            .values()
            .any(|other| other.id != crl.id && other.fingerprint == crl.fingerprint)
        {
            return Err(StoreError::Duplicate {
                entity: "crl.fingerprint",
                key: crl.fingerprint.clone(),
            });
        }
        self.crls.insert(crl.id, crl.clone());
        Ok(())
    }

    fn schedule(&self, id: ScheduleId) -> StoreResult<Option<UpdateSchedule>> {
        Ok(self.schedules.get(&id).cloned())
    }

    fn schedules(&self) -> StoreResult<Vec<UpdateSchedule>> {
        Ok(self.schedules.values().cloned().collect())
    }

    fn insert_schedule(&mut self, new: NewUpdateSchedule) -> StoreResult<UpdateSchedule> {
        let schedule = UpdateSchedule {
            id: self.next_id(),
            name: new.name,
            weekdays: new.weekdays,
            start: new.start,
            end: new.end,
            active: new.active,
        };
        self.schedules.insert(schedule.id, schedule.clone());
        Ok(schedule)
    }

    fn update_schedule(&mut self, schedule: &UpdateSchedule) -> StoreResult<()> {
        if !self.schedules.contains_key(&schedule.id) {
            return Err(StoreError::NotFound {
                entity: "schedule",
                id: schedule.id,
            });
        }
        self.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    fn proxy(&self, id: ProxyId) -> StoreResult<Option<ProxyConfig>> {
        Ok(self.proxies.get(&id).cloned())
    }

    fn proxies(&self) -> StoreResult<Vec<ProxyConfig>> {
        Ok(self.proxies.values().cloned().collect())
    }

    fn insert_proxy(&mut self, new: NewProxyConfig) -> StoreResult<ProxyConfig> {
        if self.proxies.values().any(|p| p.name == new.name) {
            return Err(StoreError::Duplicate {
                entity: "proxy.name",
                key: new.name,
            });
        }
        let proxy = ProxyConfig {
            id: self.next_id(),
            name: new.name,
            url: new.url,
            username: new.username,
            password: new.password,
            is_default: false,
            is_active: new.is_active,
        };
        self.proxies.insert(proxy.id, proxy.clone());
        Ok(proxy)
    }

    fn update_proxy(&mut self, proxy: &ProxyConfig) -> StoreResult<()> {
        if !self.proxies.contains_key(&proxy.id) {
            return Err(StoreError::NotFound {
                entity: "proxy",
                id: proxy.id,
            });
        }
        if proxy.is_default
            && let Some(other) = self
                .proxies
                .values()
                .find(|p| p.id != proxy.id && p.is_default)
        {
            return Err(StoreError::Duplicate {
                entity: "proxy.is_default",
                key: other.name.clone(),
            });
        }
        self.proxies.insert(proxy.id, proxy.clone());
        Ok(())
    }
}
