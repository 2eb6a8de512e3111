//! Placement of certificates in the trust forest.

use tracing::{debug, info, warn};

use crate::pki::decoder::DecodedCertificate;
use crate::pki::errors::PkiResult;
use crate::pki::files::{FileStore, unclaimed_name, with_staged_files};
use crate::pki::models::{CertId, Certificate, NewCertificate, certificate_file_name};
use crate::pki::store::{PkiStore, StoreTx};

/// Result of an ingestion: the stored record and whether it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested<T> {
    pub record: T,
    pub created: bool,
}

/// Store a decoded certificate, link it to its issuer and adopt any orphans
/// it issued. Runs as one transaction.
///
/// Re-ingesting a known certificate returns the stored row with
/// `created = false`, unless its file went missing, in which case the
/// supplied bytes are stored again and `created = true`.
pub fn ingest_certificate<S: PkiStore>(
    store: &S,
    files: &dyn FileStore,
    decoded: &DecodedCertificate,
) -> PkiResult<Ingested<Certificate>> {
    with_staged_files(files, |files| {
        store.transaction(|tx| ingest(tx, files, decoded))
    })
}

fn ingest(
    tx: &mut dyn StoreTx,
    files: &dyn FileStore,
    decoded: &DecodedCertificate,
) -> PkiResult<Ingested<Certificate>> {
    if let Some(existing) = tx.certificate_by_subject_serial(&decoded.subject, &decoded.serial)? {
        if files.exists(&existing.file)? {
            debug!("Certificate {} already stored", existing);
            return Ok(Ingested {
                record: existing,
                created: false,
            });
        }

        info!("File of certificate {} is missing, storing it again", existing);
        files.save(&existing.file, &decoded.raw)?;
        return Ok(Ingested {
            record: existing,
            created: true,
        });
    }

    let name = unclaimed_name(files, &certificate_file_name(decoded), &decoded.fingerprint)?;
    let name = files.save(&name, &decoded.raw)?;
    let new = NewCertificate::from_decoded(decoded, name);

    let cert = if decoded.is_root {
        tx.insert_root(new)?
    } else {
        match find_issuer(tx, decoded)? {
            Some(issuer) => {
                debug!("Linking {} under issuer {}", decoded.subject, issuer);
                tx.insert_child(issuer.id, new)?
            }
            None => {
                debug!("Issuer of {} not stored yet, keeping it as orphan", decoded.subject);
                tx.insert_root(new)?
            }
        }
    };

    if cert.is_ca {
        adopt_orphans(tx, &cert)?;
    }

    let record = tx.certificate(cert.id)?.unwrap_or(cert);
    info!("Stored certificate {}", record);
    Ok(Ingested {
        record,
        created: true,
    })
}

/// The issuer named by the authority key identifier.
///
/// With an issuer serial the pair (subject, serial) is authoritative.
/// Without one, the pair (subject, key identifier) is used when it names
/// exactly one certificate.
pub(crate) fn find_issuer(
    tx: &dyn StoreTx,
    decoded: &DecodedCertificate,
) -> PkiResult<Option<Certificate>> {
    if let Some(serial) = &decoded.issuer_serial {
        return Ok(tx.certificate_by_subject_serial(&decoded.issuer, serial)?);
    }
    let mut candidates =
        tx.certificates_by_subject(&decoded.issuer, decoded.issuer_identifier.as_deref())?;
    if candidates.len() == 1 {
        Ok(candidates.pop())
    } else {
        if candidates.len() > 1 {
            warn!(
                "{} certificates match issuer {}, leaving {} unlinked",
                candidates.len(),
                decoded.issuer,
                decoded.subject
            );
        }
        Ok(None)
    }
}

/// Reattach every orphan that names `issuer` as its issuer.
fn adopt_orphans(tx: &mut dyn StoreTx, issuer: &Certificate) -> PkiResult<usize> {
    let orphans = tx.orphans_of(&issuer.subject, issuer.subject_identifier.as_deref())?;
    let mut adopted = 0;
    for orphan in orphans {
        if orphan.id == issuer.id || is_ancestor(tx, orphan.id, issuer)? {
            continue;
        }
        tx.move_to(orphan.id, issuer.id)?;
        info!("Reattached orphan {} under {}", orphan, issuer);
        adopted += 1;
    }
    Ok(adopted)
}

fn is_ancestor(tx: &dyn StoreTx, candidate: CertId, node: &Certificate) -> PkiResult<bool> {
    let mut current = node.parent_id;
    while let Some(id) = current {
        if id == candidate {
            return Ok(true);
        }
        current = tx.certificate(id)?.and_then(|c| c.parent_id);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::decoder::{ContentType, Decoded, DistinguishedName, decode_as};
    use crate::pki::errors::PkiError;
    use crate::pki::files::MemoryFileStore;
    use crate::pki::store::{MemoryStore, StoreError};

    const ROOT_DER: &[u8] = include_bytes!("../../test_certs/root.der");
    const INTER_DER: &[u8] = include_bytes!("../../test_certs/inter.der");
    const LEAF_DER: &[u8] = include_bytes!("../../test_certs/leaf.der");

    fn cert(raw: &[u8]) -> DecodedCertificate {
        match decode_as(raw, ContentType::Certificate).unwrap() {
            Decoded::Certificate(c) => c,
            Decoded::Crl(_) => unreachable!(),
        }
    }

    fn all(store: &MemoryStore) -> Vec<Certificate> {
        store
            .view(|tx| tx.certificates().map_err(PkiError::from))
            .unwrap()
    }

    #[test]
    fn test_chain_in_order() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();

        let root = ingest_certificate(&store, &files, &cert(ROOT_DER)).unwrap();
        let inter = ingest_certificate(&store, &files, &cert(INTER_DER)).unwrap();
        let leaf = ingest_certificate(&store, &files, &cert(LEAF_DER)).unwrap();

        assert!(root.created && inter.created && leaf.created);
        assert!(root.record.is_root_ca);
        assert_eq!(root.record.parent_id, None);
        assert_eq!(inter.record.parent_id, Some(root.record.id));
        assert_eq!(leaf.record.parent_id, Some(inter.record.id));
        assert_eq!(leaf.record.depth, 3);
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn test_out_of_order_chain_is_repaired() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();

        let leaf = ingest_certificate(&store, &files, &cert(LEAF_DER)).unwrap();
        assert_eq!(leaf.record.parent_id, None);
        assert!(!leaf.record.is_root_ca);
        assert!(leaf.record.is_orphan());

        let inter = ingest_certificate(&store, &files, &cert(INTER_DER)).unwrap();
        assert_eq!(inter.record.parent_id, None);

        let root = ingest_certificate(&store, &files, &cert(ROOT_DER)).unwrap();

        let certs = all(&store);
        let by_id = |id: CertId| certs.iter().find(|c| c.id == id).unwrap().clone();
        assert_eq!(by_id(inter.record.id).parent_id, Some(root.record.id));
        assert_eq!(by_id(leaf.record.id).parent_id, Some(inter.record.id));
        assert_eq!(by_id(leaf.record.id).depth, 3);
        assert_eq!(by_id(root.record.id).numchild, 1);
        // tree order: root, intermediate, leaf
        let order: Vec<CertId> = certs.iter().map(|c| c.id).collect();
        assert_eq!(order, vec![root.record.id, inter.record.id, leaf.record.id]);
    }

    #[test]
    fn test_reupload_is_idempotent() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();
        let decoded = cert(ROOT_DER);

        let first = ingest_certificate(&store, &files, &decoded).unwrap();
        let second = ingest_certificate(&store, &files, &decoded).unwrap();
        let third = ingest_certificate(&store, &files, &decoded).unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert!(!third.created);
        assert_eq!(second.record, first.record);
        assert_eq!(all(&store).len(), 1);
    }

    #[test]
    fn test_missing_file_is_restored() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();
        let decoded = cert(ROOT_DER);

        let first = ingest_certificate(&store, &files, &decoded).unwrap();
        files.delete(&first.record.file).unwrap();

        let again = ingest_certificate(&store, &files, &decoded).unwrap();
        assert!(again.created);
        assert_eq!(again.record.id, first.record.id);
        assert!(files.exists(&again.record.file).unwrap());
        assert_eq!(all(&store).len(), 1);
    }

    #[test]
    fn test_rejected_clash_keeps_stored_file() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();
        let root = cert(ROOT_DER);
        let stored = ingest_certificate(&store, &files, &root).unwrap();

        // Same key identifier, issuer and serial: same file name, and the
        // store rejects the (issuer, serial) pair.
        let mut clash = root.clone();
        clash.subject = DistinguishedName::new([("commonName", "Clash")]);
        clash.fingerprint = "0000".into();
        clash.raw = b"clash".to_vec();
        let result = ingest_certificate(&store, &files, &clash);

        assert!(matches!(
            result,
            Err(PkiError::Store(StoreError::Duplicate { .. }))
        ));
        assert_eq!(files.len(), 1);
        assert_eq!(files.load(&stored.record.file).unwrap().unwrap(), ROOT_DER);
        assert_eq!(all(&store).len(), 1);
    }

    #[test]
    fn test_name_clash_gets_its_own_file() {
        let store = MemoryStore::new();
        let files = MemoryFileStore::new();
        let inter = ingest_certificate(&store, &files, &cert(INTER_DER)).unwrap();

        let mut twin = cert(INTER_DER);
        twin.subject = DistinguishedName::new([("commonName", "Twin")]);
        twin.issuer = DistinguishedName::new([("commonName", "Elsewhere")]);
        twin.fingerprint = "abcdef".into();
        twin.raw = b"twin".to_vec();
        let twin = ingest_certificate(&store, &files, &twin).unwrap();

        assert!(twin.created);
        assert_ne!(twin.record.file, inter.record.file);
        assert_eq!(files.load(&inter.record.file).unwrap().unwrap(), INTER_DER);
        assert_eq!(files.load(&twin.record.file).unwrap().unwrap(), b"twin");
    }
}
