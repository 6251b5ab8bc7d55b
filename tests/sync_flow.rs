//! Scenario tests for the synchronization edge cases: reconnect recovery,
//! buffered unknown-id patches, rejected mutations and session supersession.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;

use fleetsync::api::{InMemoryApi, InMemoryPush};
use fleetsync::model::{
    Alert, AlertKind, FieldMap, GeoPoint, PushMessage, Role, Severity, Vehicle, VehicleStatus,
};
use fleetsync::{ClientConfig, FleetClient, SyncNotice};

fn vehicle(id: &str, status: VehicleStatus, load: f64) -> Vehicle {
    Vehicle {
        id: id.to_string(),
        plate_number: format!("TS09-{}", id),
        driver_id: None,
        driver_name: None,
        status,
        location: GeoPoint {
            lat: 17.4,
            lng: 78.4,
        },
        last_updated: Utc::now(),
        vehicle_type: "Van".to_string(),
        load_capacity: 5000.0,
        current_load: load,
    }
}

fn alert(id: &str) -> Alert {
    Alert {
        id: id.to_string(),
        kind: AlertKind::Maintenance,
        severity: Severity::Low,
        message: format!("Vehicle TS09-{} maintenance due in 3 days", id),
        vehicle_id: None,
        job_id: None,
        created_at: Utc::now(),
        acknowledged: false,
    }
}

fn vehicle_update(id: &str, fields: &[(&str, Value)], version: u64) -> PushMessage {
    let mut data = FieldMap::new();
    data.insert("id".to_string(), Value::from(id));
    for (name, value) in fields {
        data.insert((*name).to_string(), value.clone());
    }
    PushMessage::VehicleUpdate { data, version }
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        snapshot_interval: Duration::from_secs(300),
        reconnect_backoff: Duration::from_millis(20),
        reconnect_backoff_max: Duration::from_millis(100),
        ..ClientConfig::default()
    }
}

fn client_fixture(api: &InMemoryApi, push: &InMemoryPush) -> FleetClient {
    FleetClient::builder()
        .api(Arc::new(api.clone()))
        .push(Arc::new(push.clone()))
        .config(fast_config())
        .build()
        .unwrap()
}

#[test]
fn stale_patch_scenario() -> anyhow::Result<()> {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();

    let api = InMemoryApi::new();
    api.add_user("admin", "admin123", Role::Admin);
    api.set_vehicles(vec![vehicle("V1", VehicleStatus::Idle, 0.0)]);
    let push = InMemoryPush::new();
    let client = client_fixture(&api, &push);

    client.login("admin", "admin123")?;
    let store = client.store().expect("session store");
    wait_until("push connect", || push.is_connected());

    // Patch v5 moves the vehicle to en-route.
    assert!(push.send(vehicle_update(
        "V1",
        &[("status", Value::from("en-route"))],
        5
    )));
    wait_until("en-route visible", || {
        store.snapshot().unwrap().vehicles[0].status == VehicleStatus::EnRoute
    });

    // Stale patch v3 arrives later and must be rejected.
    assert!(push.send(vehicle_update(
        "V1",
        &[("status", Value::from("maintenance"))],
        3
    )));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(
        store.snapshot()?.vehicles[0].status,
        VehicleStatus::EnRoute
    );

    client.logout()?;
    Ok(())
}

#[test]
fn missed_updates_recovered_by_reconnect_reload() -> anyhow::Result<()> {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();

    let api = InMemoryApi::new();
    api.add_user("admin", "admin123", Role::Admin);
    api.set_vehicles(vec![vehicle("v1", VehicleStatus::Idle, 0.0)]);
    let push = InMemoryPush::new();
    let client = client_fixture(&api, &push);

    client.login("admin", "admin123")?;
    let store = client.store().expect("session store");
    let (_subscription, notices) = client.notices();
    wait_until("push connect", || push.is_connected());

    // The connection drops and the backend state moves while we are blind.
    // There is no gap-fill: the missed update is only recoverable through
    // the snapshot reload the reconnect triggers.
    api.set_vehicles(vec![vehicle("v1", VehicleStatus::Maintenance, 500.0)]);
    push.disconnect();

    wait_until("reconnect", || push.is_connected());
    wait_until("missed update recovered", || {
        store.snapshot().unwrap().vehicles[0].status == VehicleStatus::Maintenance
    });

    let mut saw_disconnect = false;
    let mut saw_reconnect = false;
    while let Ok(notice) = notices.try_recv() {
        match notice {
            SyncNotice::PushDisconnected => saw_disconnect = true,
            SyncNotice::PushReconnected => saw_reconnect = true,
            _ => {}
        }
    }
    assert!(saw_disconnect && saw_reconnect);

    client.logout()?;
    Ok(())
}

#[test]
fn unknown_id_patch_lands_after_snapshot_introduces_the_record() -> anyhow::Result<()> {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();

    let api = InMemoryApi::new();
    api.add_user("admin", "admin123", Role::Admin);
    api.set_vehicles(vec![vehicle("v1", VehicleStatus::Idle, 0.0)]);
    let push = InMemoryPush::new();
    let client = client_fixture(&api, &push);

    client.login("admin", "admin123")?;
    let store = client.store().expect("session store");
    wait_until("push connect", || push.is_connected());

    // The push stream races ahead of the snapshot: an update for a vehicle
    // the client has never seen.
    assert!(push.send(vehicle_update(
        "v2",
        &[("current_load", Value::from(1750.0))],
        6
    )));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(store.snapshot()?.vehicles.len(), 1);

    // The next snapshot introduces v2; the buffered patch must be replayed
    // on top of it.
    api.set_vehicles(vec![
        vehicle("v1", VehicleStatus::Idle, 0.0),
        vehicle("v2", VehicleStatus::Idle, 0.0),
    ]);
    push.disconnect();

    wait_until("buffered patch replayed", || {
        let snapshot = store.snapshot().unwrap();
        snapshot
            .vehicles
            .iter()
            .any(|v| v.id == "v2" && v.current_load == 1750.0)
    });

    client.logout()?;
    Ok(())
}

#[test]
fn rejected_acknowledge_rolls_back_and_reports() -> anyhow::Result<()> {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();

    let api = InMemoryApi::new();
    api.add_user("admin", "admin123", Role::Admin);
    api.set_alerts(vec![alert("a1")]);
    let push = InMemoryPush::new();
    let client = client_fixture(&api, &push);

    client.login("admin", "admin123")?;
    let store = client.store().expect("session store");
    let (_subscription, notices) = client.notices();

    // Simulated 500 from the backend.
    api.set_fail_acknowledge(true);
    assert!(client.acknowledge_alert("a1").is_err());

    let (a1, _version) = store.find_alert("a1")?.expect("a1 present");
    assert!(!a1.acknowledged, "local state reverts to unacknowledged");

    let notice = notices.recv_timeout(Duration::from_millis(200))?;
    assert!(matches!(
        notice,
        SyncNotice::AcknowledgeFailed { ref alert_id, .. } if alert_id == "a1"
    ));

    // The backend recovers; the retry goes through.
    api.set_fail_acknowledge(false);
    client.acknowledge_alert("a1")?;
    let (a1, _version) = store.find_alert("a1")?.expect("a1 present");
    assert!(a1.acknowledged);

    client.logout()?;
    Ok(())
}

#[test]
fn superseded_session_never_pollutes_the_next_one() -> anyhow::Result<()> {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();

    let api = InMemoryApi::new();
    api.add_user("admin", "admin123", Role::Admin);
    api.add_user("viewer", "viewer123", Role::Viewer);
    api.set_vehicles(vec![vehicle("v1", VehicleStatus::Idle, 0.0)]);
    let push = InMemoryPush::new();
    let client = client_fixture(&api, &push);

    client.login("admin", "admin123")?;
    let first_store = client.store().expect("first store");

    // Logout then a fresh login. The first session's store stays empty even
    // though its workers may still be winding down.
    client.logout()?;
    client.login("viewer", "viewer123")?;
    let second_store = client.store().expect("second store");

    assert!(first_store.snapshot()?.vehicles.is_empty());
    assert_eq!(second_store.snapshot()?.vehicles.len(), 1);

    // Give any straggling worker from the first session time to misbehave.
    thread::sleep(Duration::from_millis(200));
    assert!(first_store.snapshot()?.vehicles.is_empty());

    client.logout()?;
    Ok(())
}

#[test]
fn transport_failure_keeps_last_known_good_data() -> anyhow::Result<()> {
    let _ = env_logger::Builder::from_default_env().is_test(true).try_init();

    let api = InMemoryApi::new();
    api.add_user("admin", "admin123", Role::Admin);
    api.set_vehicles(vec![vehicle("v1", VehicleStatus::Idle, 0.0)]);
    let push = InMemoryPush::new();
    let client = client_fixture(&api, &push);

    client.login("admin", "admin123")?;
    let store = client.store().expect("session store");
    let (_subscription, notices) = client.notices();
    wait_until("push connect", || push.is_connected());

    // Every fetch now fails. A reconnect-triggered reload reports failures
    // per kind but leaves the stale data readable.
    api.set_fail_fetches(true);
    push.disconnect();

    wait_until("snapshot failure notice", || {
        matches!(
            notices.try_recv(),
            Ok(SyncNotice::SnapshotFailed { .. })
        )
    });
    assert_eq!(store.snapshot()?.vehicles.len(), 1);

    client.logout()?;
    Ok(())
}
