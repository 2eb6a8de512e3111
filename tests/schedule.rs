mod common;

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use common::*;
use pkiman::config::SchedulerConfig;
use pkiman::pki::crl::{CrlScheduler, RunSummary, run_due_updates};
use pkiman::pki::journal::JournalLevel;
use pkiman::pki::models::{CrlUpdateSettings, NewUpdateSchedule, RevocationList};
use pkiman::pki::PkiError;
use tokio::sync::watch;

const URL_DOWN: &str = "http://down.example.test/other.crl";

fn noon() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 10, 21)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

fn all_day(h: &Harness) -> u64 {
    h.registry
        .add_schedule(NewUpdateSchedule {
            name: "all day".into(),
            weekdays: vec![],
            start: NaiveTime::MIN,
            end: NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap(),
            active: true,
        })
        .unwrap()
        .id
}

/// A second issuer with its own list, fetched from an unreachable URL.
fn unreachable_crl(h: &Harness, schedule_id: u64) -> RevocationList {
    let crl = foreign_crl(h, &[URL_DOWN]);
    schedule_crl(h, &crl, schedule_id);
    h.registry.crl(crl.id).unwrap().unwrap()
}

fn schedule_crl(h: &Harness, crl: &RevocationList, schedule_id: u64) {
    h.registry
        .configure_crl_updates(
            crl.id,
            CrlUpdateSettings {
                urls: crl.urls.clone(),
                active: true,
                schedule_id: Some(schedule_id),
                ..Default::default()
            },
        )
        .unwrap();
}

#[tokio::test]
async fn test_pass_continues_after_a_failure() {
    let mut transport = MockTransport::new();
    transport
        .expect_probe()
        .withf(|url, _| url == URL_DOWN)
        .returning(|url, _| Err(PkiError::connection(url, "no route to host")));
    transport
        .expect_probe()
        .withf(|url, _| url == URL_A)
        .returning(|_, _| Ok(probe("\"v6\"")));
    transport
        .expect_fetch()
        .withf(|url, _| url == URL_A)
        .times(1)
        .returning(|url, _| Ok(fetched(url, "application/pkix-crl", CRL6_DER)));

    let (h, crl) = seeded(transport, &[URL_A]);
    let schedule_id = all_day(&h);
    // created after the intermediate's list, so it is visited second
    let other = unreachable_crl(&h, schedule_id);
    schedule_crl(&h, &crl, schedule_id);

    let sync = h.registry.synchronizer();
    let summary = run_due_updates(h.store.as_ref(), sync.as_ref(), &h.journal, noon())
        .await
        .unwrap();
    assert_eq!(
        summary,
        RunSummary {
            updated: 1,
            unchanged: 0,
            rejected: 0,
            failed: 1,
        }
    );

    let updated = h.registry.crl(crl.id).unwrap().unwrap();
    assert_eq!(updated.crl_number.as_deref(), Some("6"));
    let untouched = h.registry.crl(other.id).unwrap().unwrap();
    assert_eq!(untouched.f_sync, None);

    let entries = h.journal.last(2);
    assert!(entries.iter().any(|e| e.level == JournalLevel::Error && e.message.contains(URL_DOWN)));
    assert!(entries.iter().any(|e| e.level == JournalLevel::Info));

    // the next pass finds nothing new at the reachable source
    let summary = run_due_updates(h.store.as_ref(), sync.as_ref(), &h.journal, noon())
        .await
        .unwrap();
    assert_eq!(summary.unchanged, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_benign_rejections_are_warnings() {
    let mut transport = MockTransport::new();
    transport
        .expect_probe()
        .returning(|_, _| Ok(probe("\"v5\"")));
    transport
        .expect_fetch()
        .returning(|url, _| Ok(fetched(url, "application/pkix-crl", CRL5_DER)));

    let (h, crl) = seeded(transport, &[URL_A]);
    let schedule_id = all_day(&h);
    schedule_crl(&h, &crl, schedule_id);

    let sync = h.registry.synchronizer();
    let summary = run_due_updates(h.store.as_ref(), sync.as_ref(), &h.journal, noon())
        .await
        .unwrap();
    assert_eq!(summary.rejected, 1);
    assert_eq!(h.journal.last(1)[0].level, JournalLevel::Warn);
}

#[tokio::test]
async fn test_closed_window_runs_nothing() {
    let mut transport = MockTransport::new();
    transport.expect_probe().times(0);

    let (h, crl) = seeded(transport, &[URL_A]);
    let evening = h
        .registry
        .add_schedule(NewUpdateSchedule {
            name: "evening".into(),
            weekdays: vec![],
            start: NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(20, 0, 0).unwrap(),
            active: true,
        })
        .unwrap();
    schedule_crl(&h, &crl, evening.id);

    let sync = h.registry.synchronizer();
    let summary = run_due_updates(h.store.as_ref(), sync.as_ref(), &h.journal, noon())
        .await
        .unwrap();
    assert_eq!(summary, RunSummary::default());
}

#[tokio::test]
async fn test_scheduler_runs_and_stops() {
    let mut transport = MockTransport::new();
    transport
        .expect_probe()
        .returning(|_, _| Ok(probe("\"v6\"")));
    transport
        .expect_fetch()
        .times(1)
        .returning(|url, _| Ok(fetched(url, "application/pkix-crl", CRL6_DER)));

    let (h, crl) = seeded(transport, &[URL_A]);
    let schedule_id = all_day(&h);
    schedule_crl(&h, &crl, schedule_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = CrlScheduler::new(
        SchedulerConfig {
            enabled: true,
            interval_secs: 3600,
        },
        h.store.clone(),
        h.registry.synchronizer(),
        h.registry.journal(),
    );
    let task = scheduler.start(shutdown_rx).expect("scheduler enabled");

    // the first tick fires immediately
    for _ in 0..200 {
        if h.registry.crl(crl.id).unwrap().unwrap().crl_number.as_deref() == Some("6") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        h.registry.crl(crl.id).unwrap().unwrap().crl_number.as_deref(),
        Some("6")
    );

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("scheduler stopped")
        .unwrap();
}

#[tokio::test]
async fn test_disabled_scheduler_does_not_start() {
    let h = harness(MockTransport::new());
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = CrlScheduler::new(
        SchedulerConfig {
            enabled: false,
            interval_secs: 60,
        },
        h.store.clone(),
        h.registry.synchronizer(),
        h.registry.journal(),
    );
    assert!(scheduler.start(shutdown_rx).is_none());
}
