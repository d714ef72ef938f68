//! Scan, refresh and backup phases against the mock transport

use fleetwatch_devkit::{init_logging, BackupTree, MockDevice, MockReply, MockTransport};
use fleetwatch_node::backup;
use fleetwatch_node::probe::identity_url;
use fleetwatch_node::refresh::{self, RefreshOptions};
use fleetwatch_node::scanner::{scan, HostRange, ScanOptions};
use fleetwatch_node::transport::TransportError;
use fleetwatch_node::{DeviceRecord, Registry};
use serde_json::json;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

fn host(suffix: u8) -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, suffix)
}

fn scan_options(first: u32, last: u32, concurrency: usize) -> ScanOptions {
    ScanOptions {
        range: HostRange { first, last },
        concurrency,
        ..ScanOptions::default()
    }
}

#[tokio::test]
async fn test_scan_finds_every_answering_device() {
    init_logging();
    let transport = MockTransport::new();
    for (id, suffix) in [("A", 3), ("B", 5), ("C", 9)] {
        MockDevice::new(id, host(suffix)).install(&transport);
    }

    let registry = scan(&transport, host(1), &scan_options(2, 10, 4)).await;

    assert_eq!(registry.sorted_ids(), vec!["A", "B", "C"]);
    assert_eq!(registry.get("B").unwrap().ip, host(5));
    // one probe per candidate, nothing else
    assert_eq!(transport.call_count(), 9);
}

#[tokio::test]
async fn test_scan_of_empty_subnet() {
    let transport = MockTransport::new();
    let registry = scan(&transport, host(1), &scan_options(2, 63, 64)).await;
    assert!(registry.is_empty());
    assert_eq!(transport.call_count(), 62);
}

#[tokio::test]
async fn test_scan_respects_concurrency_ceiling() {
    let transport = MockTransport::new().with_latency(Duration::from_millis(20));
    MockDevice::new("A", host(3)).install(&transport);

    let registry = scan(&transport, host(1), &scan_options(2, 41, 8)).await;

    assert_eq!(registry.len(), 1);
    assert_eq!(transport.call_count(), 40);
    assert!(transport.peak_in_flight() <= 8, "peak was {}", transport.peak_in_flight());
    assert!(transport.peak_in_flight() > 1);
}

#[tokio::test]
async fn test_scan_duplicate_id_keeps_one_record() {
    let transport = MockTransport::new();
    transport.reply_json(identity_url(host(3), 8888, "id"), json!({"id": "A"}));
    transport.reply_json(identity_url(host(4), 8888, "id"), json!({"id": "A"}));

    let registry = scan(&transport, host(1), &scan_options(2, 10, 4)).await;

    assert_eq!(registry.len(), 1);
    let ip = registry.get("A").unwrap().ip;
    assert!(ip == host(3) || ip == host(4));
}

#[tokio::test]
async fn test_scan_isolates_probe_errors() {
    let transport = MockTransport::new();
    MockDevice::new("A", host(3)).install(&transport);
    transport.reply(
        identity_url(host(4), 8888, "id"),
        MockReply::Fail(TransportError::Other("tls handshake".into())),
    );
    transport.reply_json(identity_url(host(6), 8888, "id"), json!({"status": "no id here"}));

    let registry = scan(&transport, host(1), &scan_options(2, 10, 4)).await;

    assert_eq!(registry.sorted_ids(), vec!["A"]);
}

fn registry_of(devices: &[&MockDevice]) -> Registry {
    devices.iter().map(|d| DeviceRecord::new(d.id.clone(), d.ip)).collect()
}

#[tokio::test]
async fn test_refresh_evicts_failing_devices() {
    let transport = MockTransport::new();
    let healthy = MockDevice::new("A", host(3)).with_status("running");
    let broken = MockDevice::new("B", host(5)).failing_refresh();
    let silent = MockDevice::new("C", host(9)).unreachable_status();
    let complaining = MockDevice::new("D", host(10)).reporting_error("Error on machine ID");
    let html = MockDevice::new("E", host(11)).with_status_reply(MockReply::Raw(200, b"<html>".to_vec()));
    let array = MockDevice::new("F", host(12)).with_status_reply(MockReply::Json(json!([1, 2])));
    let blank = MockDevice::new("G", host(13)).with_status_reply(MockReply::Raw(200, Vec::new()));
    let devices = [&healthy, &broken, &silent, &complaining, &html, &array, &blank];
    for device in devices {
        device.install(&transport);
    }

    let registry = refresh::refresh(&transport, registry_of(&devices), &RefreshOptions::default()).await;

    assert_eq!(registry.sorted_ids(), vec!["A"]);
    assert_eq!(registry.get("A").unwrap().run_status(), Some("running"));
}

#[tokio::test]
async fn test_refresh_merge_is_additive() {
    let transport = MockTransport::new();
    let device = MockDevice::new("A", host(3)).with_status("stopped");
    device.install(&transport);

    let mut record = DeviceRecord::new("A", host(3));
    if let serde_json::Value::Object(fields) = json!({"experimental_info": {"user": "alice"}, "status": "running"}) {
        record.merge(fields);
    }
    let registry: Registry = std::iter::once(record).collect();

    let registry = refresh::refresh(&transport, registry, &RefreshOptions::default()).await;
    let record = registry.get("A").unwrap();

    assert_eq!(record.run_status(), Some("stopped"));
    assert_eq!(record.field("experimental_info"), Some(&json!({"user": "alice"})));
    assert_eq!(record.ip, host(3));
}

#[tokio::test]
async fn test_refresh_respects_its_own_ceiling() {
    let transport = MockTransport::new().with_latency(Duration::from_millis(20));
    let devices: Vec<MockDevice> = (2..=21).map(|s| MockDevice::new(format!("D{s}"), host(s))).collect();
    for device in &devices {
        device.install(&transport);
    }
    let registry: Registry = devices.iter().map(|d| DeviceRecord::new(d.id.clone(), d.ip)).collect();

    let registry = refresh::refresh(&transport, registry, &RefreshOptions::default()).await;

    assert_eq!(registry.len(), 20);
    assert!(transport.peak_in_flight() <= 5);
}

#[tokio::test]
async fn test_backup_staleness_follows_newest_file() {
    let tree = BackupTree::new().unwrap();
    let hour = Duration::from_secs(3600);
    tree.add_file("A", None, "one.db", 3 * hour).unwrap();
    tree.add_file("A", None, "nested/two.db", hour).unwrap();
    tree.add_file("B", None, "old.db", 5 * hour).unwrap();
    tree.add_dir("C", None).unwrap();

    let registry: Registry = ["A", "B", "C", "D"]
        .iter()
        .enumerate()
        .map(|(i, id)| DeviceRecord::new(*id, host(3 + i as u8)))
        .collect();
    let now = SystemTime::now();
    let registry = backup::annotate_at(registry, tree.root(), 64, now).await;

    let a = registry.get("A").unwrap();
    assert_eq!(a.backup_path.as_deref(), Some(tree.device_dir("A", None).as_path()));
    let a_age = a.time_since_backup.unwrap();
    assert!(a_age >= hour - Duration::from_secs(5) && a_age < 2 * hour);

    let b_age = registry.get("B").unwrap().time_since_backup.unwrap();
    assert!(b_age > a_age);

    // empty directory: path known, nothing backed up yet
    let c = registry.get("C").unwrap();
    assert!(c.backup_path.is_some());
    assert_eq!(c.time_since_backup, None);

    // no directory at all, the device stays
    let d = registry.get("D").unwrap();
    assert_eq!(d.backup_path, None);
    assert_eq!(d.time_since_backup, None);
    assert_eq!(registry.len(), 4);
}

#[tokio::test]
async fn test_backup_stays_under_root() {
    let tree = BackupTree::new().unwrap();
    let outside = BackupTree::new().unwrap();
    outside.add_file("X", None, "secret.db", Duration::from_secs(60)).unwrap();
    tree.add_file("A", None, "run.db", Duration::from_secs(60)).unwrap();

    let mut absolute_name = DeviceRecord::new("A", host(3));
    if let serde_json::Value::Object(fields) = json!({"name": outside.root().to_string_lossy()}) {
        absolute_name.merge(fields);
    }
    let mut climbing_name = DeviceRecord::new("B", host(4));
    if let serde_json::Value::Object(fields) = json!({"name": "../A"}) {
        climbing_name.merge(fields);
    }
    let parent_id = DeviceRecord::new("..", host(5));
    let absolute_id = DeviceRecord::new(outside.root().to_string_lossy().into_owned(), host(6));

    let registry: Registry = [absolute_name, climbing_name, parent_id, absolute_id].into_iter().collect();
    let registry = backup::annotate(registry, tree.root(), 4).await;

    assert_eq!(registry.len(), 4);
    for record in registry.records() {
        assert_eq!(record.backup_path, None, "device {:?}", record.id);
        assert_eq!(record.time_since_backup, None, "device {:?}", record.id);
    }
}

#[tokio::test]
async fn test_backup_uses_machine_name_directory() {
    let tree = BackupTree::new().unwrap();
    tree.add_file("A", Some("ETHOSCOPE_001"), "run.db", Duration::from_secs(60)).unwrap();
    // a stray file next to the named directory does not count
    tree.add_file("A", None, "stray.db", Duration::from_secs(10)).unwrap();

    let mut record = DeviceRecord::new("A", host(3));
    if let serde_json::Value::Object(fields) = json!({"name": "ETHOSCOPE_001"}) {
        record.merge(fields);
    }
    let registry: Registry = std::iter::once(record).collect();
    let registry = backup::annotate(registry, tree.root(), 4).await;

    let record = registry.get("A").unwrap();
    assert_eq!(
        record.backup_path.as_deref(),
        Some(tree.device_dir("A", Some("ETHOSCOPE_001")).as_path())
    );
    assert!(record.time_since_backup.unwrap() >= Duration::from_secs(55));
}
