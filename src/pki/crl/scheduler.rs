use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tracing::{debug, error, info};

use crate::config::SchedulerConfig;
use crate::pki::errors::{PkiError, PkiResult};
use crate::pki::journal::Journal;
use crate::pki::models::RevocationList;
use crate::pki::store::PkiStore;

use super::sync::{CrlSynchronizer, SyncOutcome};

/// Counts from one pass over the due revocation lists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub updated: usize,
    pub unchanged: usize,
    /// Duplicate or older lists served by a source.
    pub rejected: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.updated + self.unchanged + self.rejected + self.failed
    }
}

/// Active revocation lists whose schedule window is open at `now`.
pub fn due_crls<S: PkiStore>(store: &S, now: NaiveDateTime) -> PkiResult<Vec<RevocationList>> {
    store.view(|tx| {
        let open: BTreeSet<_> = tx
            .schedules()?
            .into_iter()
            .filter(|s| s.active && s.is_open_at(now))
            .map(|s| s.id)
            .collect();
        if open.is_empty() {
            return Ok(Vec::new());
        }

        let due = tx
            .crls()?
            .into_iter()
            .filter(|crl| crl.active && crl.schedule_id.is_some_and(|id| open.contains(&id)))
            .collect();
        Ok::<_, PkiError>(due)
    })
}

/// Update every due revocation list once.
///
/// A failing list never stops the pass. Rejections that only mean "nothing
/// new" are journaled as warnings, everything else as errors.
pub async fn run_due_updates<S: PkiStore>(
    store: &S,
    sync: &CrlSynchronizer<S>,
    journal: &dyn Journal,
    now: NaiveDateTime,
) -> PkiResult<RunSummary> {
    let due = due_crls(store, now)?;
    debug!("{} revocation lists due at {}", due.len(), now);

    let mut summary = RunSummary::default();
    for crl in due {
        match sync.update_crl(crl.id).await {
            Ok(SyncOutcome::Updated { crl, url }) => {
                summary.updated += 1;
                journal.info(&format!(
                    "Revocation list {} updated to #{} from {}",
                    crl.id,
                    crl.crl_number.as_deref().unwrap_or("-"),
                    url
                ));
            }
            Ok(SyncOutcome::UpToDate(_)) => summary.unchanged += 1,
            Err(e) if e.is_benign() => {
                summary.rejected += 1;
                journal.warn(&format!("Revocation list {}: {}", crl.id, e));
            }
            Err(e) => {
                summary.failed += 1;
                journal.error(&format!("Revocation list {} update failed: {}", crl.id, e));
            }
        }
    }
    Ok(summary)
}

/// Periodic driver for [`run_due_updates`].
pub struct CrlScheduler<S: PkiStore> {
    config: SchedulerConfig,
    store: Arc<S>,
    sync: Arc<CrlSynchronizer<S>>,
    journal: Arc<dyn Journal>,
}

impl<S: PkiStore> CrlScheduler<S> {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<S>,
        sync: Arc<CrlSynchronizer<S>>,
        journal: Arc<dyn Journal>,
    ) -> Self {
        Self {
            config,
            store,
            sync,
            journal,
        }
    }

    /// Run one pass now, against local wall-clock time.
    pub async fn trigger_immediate_update(&self) -> PkiResult<RunSummary> {
        run_due_updates(
            self.store.as_ref(),
            self.sync.as_ref(),
            self.journal.as_ref(),
            Local::now().naive_local(),
        )
        .await
    }

    /// Spawn the background loop. It stops when `shutdown` flips to `true`
    /// or its sender is dropped. Returns `None` when scheduling is disabled.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            debug!("CRL scheduler disabled, not started");
            return None;
        }

        let period = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            "Starting CRL scheduler with interval of {} seconds",
            period.as_secs()
        );

        let scheduler = Arc::new(self);
        Some(tokio::spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("CRL scheduler stopping");
                            break;
                        }
                        continue;
                    }
                }

                match scheduler.trigger_immediate_update().await {
                    Ok(summary) if summary.total() > 0 => debug!(
                        "Scheduled CRL pass: {} updated, {} unchanged, {} rejected, {} failed",
                        summary.updated, summary.unchanged, summary.rejected, summary.failed
                    ),
                    Ok(_) => debug!("Scheduled CRL pass: nothing due"),
                    Err(e) => error!("Scheduled CRL pass failed: {}", e),
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::decoder::DistinguishedName;
    use crate::pki::models::{NewCertificate, NewRevocationList, NewUpdateSchedule};
    use crate::pki::store::{MemoryStore, StoreTx};
    use chrono::{NaiveDate, NaiveTime, Utc, Weekday};

    fn at(h: u32, m: u32) -> NaiveDateTime {
        // 2026-10-19 is a Monday
        NaiveDate::from_ymd_opt(2026, 10, 19)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn add_crl(tx: &mut dyn StoreTx, name: &str, schedule: Option<u64>, active: bool) -> RevocationList {
        let now = Utc::now();
        let issuer = tx
            .insert_root(NewCertificate {
                subject: DistinguishedName::new([("commonName", name)]),
                subject_identifier: Some(format!("ski-{name}")),
                serial: "1".into(),
                issuer: DistinguishedName::new([("commonName", name)]),
                issuer_identifier: Some(format!("ski-{name}")),
                issuer_serial: None,
                fingerprint: format!("crt-{name}"),
                file: format!("cdp/crt/{name}.crt"),
                not_before: now,
                not_after: now,
                is_ca: true,
                is_root_ca: true,
                crl_distribution_points: None,
                authority_info_access: None,
            })
            .unwrap();
        let mut crl = tx
            .insert_crl(NewRevocationList {
                issuer_id: issuer.id,
                fingerprint: format!("crl-{name}"),
                crl_number: None,
                last_update: now,
                next_update: None,
                revoked_count: 0,
                file: format!("cdp/crl/{name}.crl"),
            })
            .unwrap();
        crl.schedule_id = schedule;
        crl.active = active;
        crl.urls = vec!["http://a.test/x.crl".into()];
        tx.update_crl(&crl).unwrap();
        crl
    }

    #[test]
    fn test_due_crls_follow_open_active_schedules() {
        let store = MemoryStore::new();
        let (due_id, ids) = store
            .transaction(|tx| {
                let office = tx.insert_schedule(NewUpdateSchedule {
                    name: "office".into(),
                    weekdays: vec![Weekday::Mon, Weekday::Tue],
                    start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                    end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                    active: true,
                })?;
                let paused = tx.insert_schedule(NewUpdateSchedule {
                    name: "paused".into(),
                    weekdays: vec![],
                    start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                    end: NaiveTime::from_hms_opt(23, 59, 0).unwrap(),
                    active: false,
                })?;

                let due = add_crl(tx, "due", Some(office.id), true);
                let inactive = add_crl(tx, "inactive", Some(office.id), false);
                let unscheduled = add_crl(tx, "unscheduled", None, true);
                let paused_crl = add_crl(tx, "paused", Some(paused.id), true);
                Ok::<_, PkiError>((due.id, [inactive.id, unscheduled.id, paused_crl.id]))
            })
            .unwrap();

        let due: Vec<_> = due_crls(&store, at(10, 0)).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(due, vec![due_id]);
        assert!(ids.iter().all(|id| !due.contains(id)));

        assert!(due_crls(&store, at(17, 0)).unwrap().is_empty());
        assert!(due_crls(&store, at(8, 59)).unwrap().is_empty());
    }

    #[test]
    fn test_no_schedules_no_work() {
        let store = MemoryStore::new();
        assert!(due_crls(&store, at(12, 0)).unwrap().is_empty());
    }
}
