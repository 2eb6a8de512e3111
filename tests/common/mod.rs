#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use pkiman::pki::crl::{Body, Fetched, HttpTransport, Probe, ProxyMap};
use pkiman::pki::decoder::DistinguishedName;
use pkiman::pki::models::{CrlUpdateSettings, NewCertificate, NewRevocationList, RevocationList};
use pkiman::pki::store::PkiStore;
use pkiman::pki::{
    FileStore, MemoryFileStore, MemoryJournal, MemoryStore, PkiError, PkiRegistry, PkiResult,
    Uploaded,
};
use pkiman::telemetry;

pub const ROOT_DER: &[u8] = include_bytes!("../../test_certs/root.der");
pub const INTER_DER: &[u8] = include_bytes!("../../test_certs/inter.der");
pub const LEAF_DER: &[u8] = include_bytes!("../../test_certs/leaf.der");
pub const CRL5_DER: &[u8] = include_bytes!("../../test_certs/crl5.der");
pub const CRL6_DER: &[u8] = include_bytes!("../../test_certs/crl6.der");

pub const URL_A: &str = "http://pki.example.test/inter.crl";
pub const URL_B: &str = "http://mirror.example.test/inter.crl";

mockall::mock! {
    pub Transport {}

    #[async_trait::async_trait]
    impl HttpTransport for Transport {
        async fn probe(&self, url: &str, proxy: Option<ProxyMap>) -> PkiResult<Probe>;
        async fn fetch(&self, url: &str, proxy: Option<ProxyMap>) -> PkiResult<Fetched>;
    }
}

pub struct Harness {
    pub registry: PkiRegistry<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub files: Arc<MemoryFileStore>,
    pub journal: MemoryJournal,
}

pub fn harness(transport: MockTransport) -> Harness {
    telemetry::init_tracing();

    let store = Arc::new(MemoryStore::new());
    let files = Arc::new(MemoryFileStore::new());
    let journal = MemoryJournal::new();
    let registry = PkiRegistry::new(
        store.clone(),
        files.clone(),
        Arc::new(transport),
        Arc::new(journal.clone()),
    );
    Harness {
        registry,
        store,
        files,
        journal,
    }
}

/// Root and intermediate stored, plus CRL #5 of the intermediate with
/// updates enabled from `urls`.
pub fn seeded(transport: MockTransport, urls: &[&str]) -> (Harness, RevocationList) {
    let h = harness(transport);
    h.registry.upload(ROOT_DER, "application/pkix-cert").unwrap();
    h.registry.upload(INTER_DER, "application/pkix-cert").unwrap();
    let Uploaded::Crl(crl) = h.registry.upload(CRL5_DER, "application/pkix-crl").unwrap() else {
        panic!("expected a revocation list");
    };

    let crl = h
        .registry
        .configure_crl_updates(
            crl.record.id,
            CrlUpdateSettings {
                urls: urls.iter().map(|u| u.to_string()).collect(),
                active: true,
                ..Default::default()
            },
        )
        .unwrap();
    (h, crl)
}

pub const FOREIGN_CRL_FILE: &str = "cdp/crl/0a0b_07.crl";
pub const FOREIGN_CRL_BODY: &[u8] = b"list of the other CA";

/// An unrelated root, "Other CA", with a revocation list of its own that is
/// updated from `urls`.
pub fn foreign_crl(h: &Harness, urls: &[&str]) -> RevocationList {
    let now = Utc::now();
    h.files.save(FOREIGN_CRL_FILE, FOREIGN_CRL_BODY).unwrap();
    let crl = h
        .store
        .transaction(|tx| {
            let issuer = tx.insert_root(NewCertificate {
                subject: DistinguishedName::new([("commonName", "Other CA")]),
                subject_identifier: Some("0a0b".into()),
                serial: "7".into(),
                issuer: DistinguishedName::new([("commonName", "Other CA")]),
                issuer_identifier: Some("0a0b".into()),
                issuer_serial: None,
                fingerprint: "other-ca".into(),
                file: "cdp/crt/0a0b_07.crt".into(),
                not_before: now,
                not_after: now,
                is_ca: true,
                is_root_ca: true,
                crl_distribution_points: None,
                authority_info_access: None,
            })?;
            let crl = tx.insert_crl(NewRevocationList {
                issuer_id: issuer.id,
                fingerprint: "other-crl".into(),
                crl_number: Some("1".into()),
                last_update: now,
                next_update: None,
                revoked_count: 0,
                file: FOREIGN_CRL_FILE.into(),
            })?;
            Ok::<_, PkiError>(crl)
        })
        .unwrap();

    h.registry
        .configure_crl_updates(
            crl.id,
            CrlUpdateSettings {
                urls: urls.iter().map(|u| u.to_string()).collect(),
                active: true,
                ..Default::default()
            },
        )
        .unwrap()
}

pub fn probe(etag: &str) -> Probe {
    Probe {
        etag: Some(etag.to_string()),
        date: None,
    }
}

pub fn fetched(url: &str, content_type: &str, body: &[u8]) -> Fetched {
    Fetched {
        url: url.to_string(),
        content_type: Some(content_type.to_string()),
        probe: Probe::default(),
        body: Body::Memory(body.to_vec()),
    }
}
