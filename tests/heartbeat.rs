mod common;

use std::time::Duration;

use common::{amperfied, amperfied_unit, Harness, AMPERFIED_CURRENT};
use serde_json::json;
use tokio::time::{sleep, Instant};
use tokio_test::assert_ok;
use voltage_evse::sim::SimulatedRegisters;
use voltage_evse::{ChargeStatus, Charger, ChargerError};

fn gaps(times: &[Instant]) -> Vec<Duration> {
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_period_within_half_timeout() {
    let harness = Harness::new();
    let unit = amperfied_unit(10_000);
    let point = amperfied(&harness, &unit).await;

    let policy = point.watchdog().unwrap();
    assert_eq!(policy.timeout(), Duration::from_secs(10));
    assert!(policy.interval() <= policy.timeout() / 2);

    let start = Instant::now();
    assert_ok!(point.max_current(10).await);
    assert_ok!(point.enable(true).await);
    sleep(Duration::from_millis(21_000)).await;

    let values = unit.written_values(AMPERFIED_CURRENT);
    assert_eq!(values, vec![0, 100, 100, 100, 100, 100]);

    let times = unit.write_times(AMPERFIED_CURRENT);
    assert_eq!(times[2] - start, Duration::from_secs(5));
    for gap in gaps(&times[2..]) {
        assert_eq!(gap, Duration::from_secs(5));
    }
}

#[tokio::test(start_paused = true)]
async fn test_nothing_reasserted_before_first_setpoint() {
    let harness = Harness::new();
    let unit = amperfied_unit(10_000);
    let _point = amperfied(&harness, &unit).await;

    sleep(Duration::from_secs(30)).await;
    assert!(unit.writes().is_empty());
    assert_eq!(harness.scheduler.active_entries(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_unit_reasserts_sentinel() {
    let harness = Harness::new();
    let unit = amperfied_unit(10_000);
    let point = amperfied(&harness, &unit).await;

    assert_ok!(point.max_current(16).await);
    assert_ok!(point.enable(true).await);
    assert_ok!(point.enable(false).await);
    sleep(Duration::from_millis(11_000)).await;

    assert_eq!(
        unit.written_values(AMPERFIED_CURRENT),
        vec![0, 160, 0, 0, 0]
    );
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_follows_latest_accepted_value() {
    let harness = Harness::new();
    let unit = amperfied_unit(10_000);
    let point = amperfied(&harness, &unit).await;

    assert_ok!(point.enable(true).await);
    sleep(Duration::from_millis(6_000)).await;

    // rejected and failed commands never reach the heartbeat
    assert!(point.max_current(2).await.is_err());
    unit.fail_next(ChargerError::connection("reset by peer"));
    assert!(point.max_current(8).await.is_err());

    assert_ok!(point.max_current(12).await);
    sleep(Duration::from_millis(5_000)).await;

    assert_eq!(
        unit.written_values(AMPERFIED_CURRENT),
        vec![60, 60, 120, 120]
    );
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_failures_are_swallowed() {
    let harness = Harness::new();
    let unit = amperfied_unit(10_000);
    let point = amperfied(&harness, &unit).await;

    assert_ok!(point.max_current(10).await);
    assert_ok!(point.enable(true).await);

    // the beats at 5s and 10s fail
    sleep(Duration::from_millis(4_000)).await;
    unit.fail_next(ChargerError::connection("no route to host"));
    sleep(Duration::from_millis(5_000)).await;
    unit.fail_next(ChargerError::timeout("write registers", 5000));
    sleep(Duration::from_millis(7_000)).await;

    assert!(harness.scheduler.is_running());
    assert_eq!(harness.scheduler.active_entries(), 1);
    assert_eq!(point.status().await.unwrap(), ChargeStatus::Connected);
    assert_eq!(unit.written_values(AMPERFIED_CURRENT), vec![0, 100, 100]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_heartbeat() {
    let harness = Harness::new();
    let unit = amperfied_unit(10_000);
    let point = amperfied(&harness, &unit).await;

    assert_ok!(point.enable(true).await);
    sleep(Duration::from_millis(6_000)).await;
    point.shutdown().await;
    sleep(Duration::from_secs(30)).await;

    assert_eq!(unit.written_values(AMPERFIED_CURRENT), vec![60, 60]);
    assert_eq!(harness.scheduler.active_entries(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_configured_watchdog_overrides_hardware() {
    let harness = Harness::new();
    let unit = amperfied_unit(0);
    let point = harness
        .registers(
            "wallbox",
            "amperfied",
            &unit,
            json!({ "watchdog": { "timeout_ms": 4000, "interval_ms": 1000 } }),
        )
        .await;

    assert_eq!(point.watchdog().unwrap().interval(), Duration::from_secs(1));
    assert_ok!(point.enable(true).await);
    sleep(Duration::from_millis(3_500)).await;
    assert_eq!(unit.written_values(AMPERFIED_CURRENT), vec![60, 60, 60, 60]);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_register_written_each_beat() {
    let harness = Harness::new();
    let unit = SimulatedRegisters::new();
    unit.set_holding(1000, &[0, 2]);
    unit.set_holding(1004, &[0, 7]);
    unit.set_holding(1602, &[0, 10]);
    let point = harness
        .registers("keba", "keba-modbus", &unit, json!({}))
        .await;

    assert_ok!(point.max_current(10).await);
    assert_ok!(point.enable(true).await);
    sleep(Duration::from_millis(11_000)).await;

    assert_eq!(unit.written_values(5004), vec![10_000, 10_000, 10_000]);
    assert_eq!(unit.written_values(5014), vec![0, 1, 1, 1]);
    assert_eq!(unit.written_values(5018), vec![10, 10]);
}

#[tokio::test(start_paused = true)]
async fn test_units_beat_independently() {
    let harness = Harness::new();
    let fast = amperfied_unit(4_000);
    let slow = amperfied_unit(20_000);

    let a = harness
        .registers("fast", "amperfied", &fast, json!({}))
        .await;
    let b = harness
        .registers("slow", "amperfied", &slow, json!({}))
        .await;
    assert_ok!(a.enable(true).await);
    assert_ok!(b.enable(true).await);

    slow.set_latency(Duration::from_secs(3));
    sleep(Duration::from_millis(13_500)).await;

    // a slow link on one unit does not delay the other
    assert_eq!(fast.written_values(AMPERFIED_CURRENT).len(), 1 + 6);
    assert_eq!(slow.written_values(AMPERFIED_CURRENT).len(), 2);
    assert_eq!(harness.scheduler.active_entries(), 2);
}
