use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::pki::decoder::DecodedCrl;
use crate::pki::errors::{PkiError, PkiResult};
use crate::pki::files::{FileStore, unclaimed_name, with_staged_files};
use crate::pki::hierarchy::Ingested;
use crate::pki::models::{CertId, Certificate, NewRevocationList, RevocationList, crl_file_name};
use crate::pki::store::{PkiStore, StoreTx};

/// Store a decoded CRL against its issuing certificate. Runs as one
/// transaction.
pub fn ingest_crl<S: PkiStore>(
    store: &S,
    files: &dyn FileStore,
    decoded: &DecodedCrl,
) -> PkiResult<Ingested<RevocationList>> {
    with_staged_files(files, |files| {
        store.transaction(|tx| reconcile(tx, files, decoded, Utc::now()))
    })
}

/// Create or update the revocation list of the issuer named by `decoded`.
pub(crate) fn reconcile(
    tx: &mut dyn StoreTx,
    files: &dyn FileStore,
    decoded: &DecodedCrl,
    now: DateTime<Utc>,
) -> PkiResult<Ingested<RevocationList>> {
    let issuer = resolve_issuer(tx, decoded)?;
    store_for(tx, files, &issuer, decoded, now)
}

/// Like [`reconcile`], for a list fetched on behalf of `expected`. A list
/// issued by any other certificate is rejected before anything is written.
pub(crate) fn reconcile_expecting(
    tx: &mut dyn StoreTx,
    files: &dyn FileStore,
    expected: CertId,
    decoded: &DecodedCrl,
    now: DateTime<Utc>,
) -> PkiResult<Ingested<RevocationList>> {
    let issuer = resolve_issuer(tx, decoded)?;
    if issuer.id != expected {
        return Err(PkiError::IssuerMismatch {
            expected,
            found: issuer.to_string(),
        });
    }
    store_for(tx, files, &issuer, decoded, now)
}

/// An update must differ in content and be strictly newer, both by CRL
/// number (when the incoming list has one) and by last update.
fn store_for(
    tx: &mut dyn StoreTx,
    files: &dyn FileStore,
    issuer: &Certificate,
    decoded: &DecodedCrl,
    now: DateTime<Utc>,
) -> PkiResult<Ingested<RevocationList>> {
    let Some(mut crl) = tx.crl_by_issuer(issuer.id)? else {
        let name = unclaimed_name(files, &crl_file_name(issuer), &decoded.fingerprint)?;
        let file = files.save(&name, &decoded.raw)?;
        let crl = tx.insert_crl(NewRevocationList::from_decoded(issuer.id, decoded, file))?;
        info!(
            "Stored revocation list #{} of {}",
            crl.crl_number.as_deref().unwrap_or("-"),
            issuer
        );
        return Ok(Ingested {
            record: crl,
            created: true,
        });
    };

    check_newer(decoded, &crl)?;

    let file = files.save(&crl.file, &decoded.raw)?;
    crl.apply(decoded, file, now);
    tx.update_crl(&crl)?;
    info!(
        "Updated revocation list of {} to #{}",
        issuer,
        crl.crl_number.as_deref().unwrap_or("-")
    );
    Ok(Ingested {
        record: crl,
        created: false,
    })
}

/// Find the certificate that issued `decoded`.
fn resolve_issuer(tx: &dyn StoreTx, decoded: &DecodedCrl) -> PkiResult<Certificate> {
    let describe = || {
        format!(
            "{} [{}]",
            decoded.issuer,
            decoded.issuer_identifier.as_deref().unwrap_or("-")
        )
    };

    let mut candidates =
        tx.certificates_by_subject(&decoded.issuer, decoded.issuer_identifier.as_deref())?;
    if candidates.len() > 1 {
        let count = candidates.len();
        let Some(serial) = &decoded.issuer_serial else {
            return Err(PkiError::CrtMultipleFound {
                issuer: describe(),
                count,
            });
        };
        debug!("{} issuer candidates, narrowing by serial {}", count, serial);
        candidates.retain(|c| &c.serial == serial);
        if candidates.len() > 1 {
            return Err(PkiError::CrtMultipleFound {
                issuer: describe(),
                count: candidates.len(),
            });
        }
    }
    candidates
        .pop()
        .ok_or_else(|| PkiError::CrtNotFound { issuer: describe() })
}

fn check_newer(decoded: &DecodedCrl, stored: &RevocationList) -> PkiResult<()> {
    if decoded.fingerprint == stored.fingerprint {
        return Err(PkiError::Duplicate {
            fingerprint: decoded.fingerprint.clone(),
        });
    }

    if let (Some(incoming), Some(current)) = (&decoded.crl_number, &stored.crl_number)
        && compare_numbers(incoming, current) != Ordering::Greater
    {
        return Err(PkiError::Old {
            incoming: format!("#{incoming}"),
            stored: format!("#{current}"),
        });
    }

    if decoded.last_update <= stored.last_update {
        return Err(PkiError::Old {
            incoming: decoded.last_update.to_rfc3339(),
            stored: stored.last_update.to_rfc3339(),
        });
    }
    Ok(())
}

/// Numeric order of two decimal strings of any length.
fn compare_numbers(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
