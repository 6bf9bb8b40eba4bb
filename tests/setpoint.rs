mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{amperfied, amperfied_unit, Harness, AMPERFIED_CURRENT};
use tokio::task::JoinSet;
use tokio_test::{assert_err, assert_ok};
use voltage_evse::{ChargeStatus, Charger, ChargerError};

#[tokio::test]
async fn test_below_minimum_rejected_without_write() {
    let harness = Harness::new();
    let unit = amperfied_unit(0);
    let point = amperfied(&harness, &unit).await;

    let err = assert_err!(point.max_current(3).await);
    assert!(matches!(err, ChargerError::InvalidArgument { .. }));
    assert_err!(point.max_current_millis(5.99).await);
    assert_err!(point.max_current(17).await);
    assert_err!(point.max_current(-1).await);

    assert!(unit.writes().is_empty());
}

#[tokio::test]
async fn test_enable_writes_remembered_target() {
    let harness = Harness::new();
    let unit = amperfied_unit(0);
    let point = amperfied(&harness, &unit).await;

    // disabled: the target is remembered, the unit stays at the sentinel
    assert_ok!(point.max_current(16).await);
    assert_eq!(unit.written_values(AMPERFIED_CURRENT), vec![0]);
    assert!(!assert_ok!(point.enabled().await));

    assert_ok!(point.enable(true).await);
    assert_eq!(unit.written_values(AMPERFIED_CURRENT), vec![0, 160]);
    assert!(assert_ok!(point.enabled().await));
}

#[tokio::test]
async fn test_enable_without_target_uses_minimum() {
    let harness = Harness::new();
    let unit = amperfied_unit(0);
    let point = amperfied(&harness, &unit).await;

    assert_ok!(point.enable(true).await);
    assert_eq!(unit.written_values(AMPERFIED_CURRENT), vec![60]);
}

#[tokio::test]
async fn test_zero_current_disables() {
    let harness = Harness::new();
    let unit = amperfied_unit(0);
    let point = amperfied(&harness, &unit).await;

    assert_ok!(point.max_current(12).await);
    assert_ok!(point.enable(true).await);
    assert_ok!(point.max_current(0).await);
    assert!(!assert_ok!(point.enabled().await));

    // re-enabling restores the last non-zero target
    assert_ok!(point.enable(true).await);
    assert_eq!(unit.written_values(AMPERFIED_CURRENT), vec![0, 120, 0, 120]);
}

#[tokio::test]
async fn test_failed_write_keeps_last_accepted_setpoint() {
    let harness = Harness::new();
    let unit = amperfied_unit(0);
    let point = amperfied(&harness, &unit).await;

    assert_ok!(point.max_current(10).await);
    assert_ok!(point.enable(true).await);

    unit.fail_next(ChargerError::connection("broken pipe"));
    let err = assert_err!(point.max_current(14).await);
    assert!(err.is_transport_error());

    unit.fail_next(ChargerError::timeout("write registers", 5000));
    assert_err!(point.enable(false).await);

    // still enabled at 10 A
    assert_ok!(point.enable(true).await);
    assert_eq!(unit.written_values(AMPERFIED_CURRENT), vec![0, 100, 100]);
}

#[tokio::test]
async fn test_fractional_current_rounds_down() {
    let harness = Harness::new();
    let unit = amperfied_unit(0);
    let point = amperfied(&harness, &unit).await;

    assert_ok!(point.enable(true).await);
    assert_ok!(point.max_current_millis(10.59).await);
    assert_eq!(unit.holding(AMPERFIED_CURRENT), 105);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_never_overlap() {
    let harness = Harness::new();
    let unit = amperfied_unit(0);
    let point = Arc::new(amperfied(&harness, &unit).await);
    unit.set_latency(Duration::from_millis(2));

    let mut tasks = JoinSet::new();
    for i in 0..16u8 {
        let point = Arc::clone(&point);
        tasks.spawn(async move {
            if i % 2 == 0 {
                point.status().await.map(|_| ())
            } else {
                point.max_current(6 + i64::from(i % 10)).await
            }
        });
    }
    let enable = Arc::clone(&point);
    tasks.spawn(async move { enable.enable(true).await });

    while let Some(joined) = tasks.join_next().await {
        assert_ok!(joined.unwrap());
    }

    assert!(!unit.overlapped());
    assert_eq!(point.status().await.unwrap(), ChargeStatus::Connected);
}
