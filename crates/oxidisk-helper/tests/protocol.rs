//! End-to-end protocol tests over the fake HAL: request JSON in, wire JSON
//! out.

use oxidisk_engine::dispatcher::Dispatcher;
use oxidisk_engine::EngineConfig;
use oxidisk_hal::{BatterySnapshot, FakeDisk, FakeHal, FakePartition};
use oxidisk_helper::{dispatch, HelperRequest, HelperResponse};
use serde_json::{json, Value};
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

fn request(action: &str, payload: Value) -> HelperRequest {
    HelperRequest {
        action: action.to_string(),
        payload,
    }
}

fn wire(response: HelperResponse) -> Value {
    serde_json::to_value(&response).unwrap()
}

struct Harness {
    hal: FakeHal,
    dispatcher: Dispatcher,
    tmp: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let hal = FakeHal::new();
        let dispatcher = Dispatcher::new(Arc::new(hal.clone()), EngineConfig::scratch(tmp.path()));
        Self {
            hal,
            dispatcher,
            tmp,
        }
    }

    fn call(&self, action: &str, payload: Value) -> Value {
        wire(dispatch(&self.dispatcher, request(action, payload)))
    }
}

#[test]
fn get_disks_returns_the_normalized_snapshot() {
    let h = Harness::new();
    h.hal.add_disk(
        FakeDisk::external("disk4", 64 * MIB)
            .with_partition(FakePartition::new("disk4s1", MIB, 8 * MIB).named("EFI"))
            .with_partition(FakePartition::new("disk4s2", 16 * MIB, 24 * MIB).named("DATA")),
    );
    h.hal.add_disk(FakeDisk::internal("disk0", 256 * MIB));

    let response = h.call("get_disks", json!({ "includeSystem": false }));
    assert_eq!(response["ok"], true);
    let devices = response["details"].as_array().unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0]["identifier"], "disk4");
    assert_eq!(devices[0]["partitions"].as_array().unwrap().len(), 2);
    assert_eq!(devices[0]["unallocated"].as_array().unwrap().len(), 2);
}

#[test]
fn preflight_blocker_then_wipe_is_refused() {
    // Spec scenario: protected device -> blocker -> PreflightBlocked.
    let h = Harness::new();
    h.hal.add_disk(
        FakeDisk::internal("disk1", 128 * MIB).with_partition(
            FakePartition::new("disk1s1", MIB, 64 * MIB)
                .named("Macintosh HD")
                .with_roles(&["System"]),
        ),
    );

    let verdict = h.call(
        "preflight_partition",
        json!({ "operation": "wipe", "deviceIdentifier": "disk1s1" }),
    );
    assert_eq!(verdict["ok"], true);
    assert_eq!(verdict["details"]["ok"], false);
    assert!(verdict["details"]["blockers"]
        .as_array()
        .unwrap()
        .iter()
        .any(|b| b == "protected:system"));

    let wipe = h.call(
        "wipe_device",
        json!({
            "deviceIdentifier": "disk1s1",
            "tableType": "gpt",
            "formatType": "exfat",
            "label": "X",
        }),
    );
    assert_eq!(wipe["ok"], false);
    assert_eq!(wipe["error"]["kind"], "preflight-blocked");
}

#[test]
fn changing_fs_between_preflight_and_format_is_stale() {
    // Spec scenario: preflight exfat, format fat32 -> PreflightStale.
    let h = Harness::new();
    h.hal.add_disk(
        FakeDisk::external("disk4", 64 * MIB)
            .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB)),
    );

    let verdict = h.call(
        "preflight_partition",
        json!({ "operation": "format", "partitionIdentifier": "disk4s1", "formatType": "exfat" }),
    );
    assert_eq!(verdict["details"]["ok"], true);

    let format = h.call(
        "format_partition",
        json!({
            "partitionIdentifier": "disk4s1",
            "formatType": "fat32",
            "label": "OXI",
        }),
    );
    assert_eq!(format["ok"], false);
    assert_eq!(format["error"]["kind"], "preflight-stale");
}

#[test]
fn fat32_label_policy_is_reported_as_invalid_input() {
    // Spec scenario: create with an over-long fat32 label.
    let h = Harness::new();
    h.hal.add_disk(FakeDisk::external("disk4", 256 * MIB));

    h.call(
        "preflight_partition",
        json!({
            "operation": "create",
            "deviceIdentifier": "disk4",
            "formatType": "fat32",
            "newSize": "100m",
        }),
    );
    let response = h.call(
        "create_partition",
        json!({
            "deviceIdentifier": "disk4",
            "formatType": "fat32",
            "label": "too-long-label-here",
            "size": "100m",
        }),
    );
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["kind"], "invalid-input");
    assert_eq!(response["error"]["details"]["field"], "label");
}

#[test]
fn windows_iso_detection_gates_raw_flash() {
    // Spec scenario: inspect reports windows; raw flash without override
    // fails with InvalidInput{field: "mode"}.
    let h = Harness::new();
    h.hal.add_disk(FakeDisk::external("disk4", 64 * MIB));

    let iso_root = h.tmp.path().join("win-root");
    std::fs::create_dir_all(iso_root.join("sources")).unwrap();
    std::fs::write(iso_root.join("bootmgr"), b"MZ").unwrap();
    std::fs::write(iso_root.join("sources/install.wim"), b"wim").unwrap();
    let iso = h.tmp.path().join("win11.iso");
    std::fs::write(&iso, b"iso").unwrap();
    h.hal.map_attachment(&iso, iso_root);

    let inspection = h.call(
        "inspect_image",
        json!({ "sourcePath": iso.display().to_string() }),
    );
    assert_eq!(inspection["details"]["isWindows"], true);
    assert_eq!(inspection["details"]["brand"], "windows");
    assert_eq!(
        inspection["details"]["reason"],
        "bootmgr+sources/install.wim present"
    );

    h.call(
        "preflight_partition",
        json!({ "operation": "flash", "deviceIdentifier": "disk4" }),
    );
    let flash = h.call(
        "flash_image",
        json!({
            "sourcePath": iso.display().to_string(),
            "targetDevice": "disk4",
            "verify": false,
        }),
    );
    assert_eq!(flash["ok"], false);
    assert_eq!(flash["error"]["kind"], "invalid-input");
    assert_eq!(flash["error"]["details"]["field"], "mode");
}

#[test]
fn flash_round_trip_reports_matching_hashes() {
    let h = Harness::new();
    h.hal.add_disk(FakeDisk::external("disk4", 8 * MIB));
    let image = h.tmp.path().join("linux.img");
    std::fs::write(&image, vec![0xAB; 2 * MIB as usize]).unwrap();

    h.call(
        "preflight_partition",
        json!({ "operation": "flash", "deviceIdentifier": "disk4" }),
    );
    let response = h.call(
        "flash_image",
        json!({
            "sourcePath": image.display().to_string(),
            "targetDevice": "disk4",
            "verify": true,
        }),
    );
    assert_eq!(response["ok"], true, "{response}");
    let details = &response["details"];
    assert_eq!(details["sourceHash"], details["verifiedHash"]);
    assert_eq!(details["bytes"], 2 * MIB);
}

#[test]
fn journal_surface_reports_and_clears_interrupted_operations() {
    // Spec scenario: interrupted move shows up at startup; repair clears it.
    let h = Harness::new();
    h.hal.add_disk(
        FakeDisk::external("disk4", 64 * MIB)
            .with_partition(FakePartition::new("disk4s2", MIB, 32 * MIB).fs("exfat")),
    );

    // Simulate a crash mid-move by seeding the journal slot directly.
    let store = oxidisk_engine::JournalStore::new(
        h.tmp.path().join("operation_journal.json"),
        MIB,
        std::time::Duration::ZERO,
    );
    store
        .begin(
            oxidisk_engine::JournalRecord::new(
                oxidisk_engine::JournalOp::Move,
                "disk4s2",
                "disk4",
            )
            .span(Some(MIB), Some(4 * MIB), 32 * MIB),
        )
        .unwrap();
    store.checkpoint(MIB).unwrap();

    let pending = h.call("get_operation_journal", json!({}));
    assert_eq!(pending["details"]["record"]["operation"], "move");
    assert_eq!(pending["details"]["record"]["device"], "disk4s2");
    assert_eq!(pending["details"]["record"]["lastCopied"], MIB);
    assert_eq!(pending["details"]["devicePresent"], true);

    let resolved = h.call(
        "resolve_operation_journal",
        json!({ "resolution": "repair" }),
    );
    assert_eq!(resolved["ok"], true);

    let after = h.call("get_operation_journal", json!({}));
    assert_eq!(after["details"], Value::Null);
}

#[test]
fn clear_journal_is_idempotent_over_the_wire() {
    let h = Harness::new();
    assert_eq!(h.call("clear_operation_journal", json!({}))["ok"], true);
    assert_eq!(h.call("clear_operation_journal", json!({}))["ok"], true);
}

#[test]
fn sidecar_status_lists_the_whole_catalog() {
    let h = Harness::new();
    let response = h.call("get_sidecar_status", json!({}));
    let entries = response["details"].as_array().unwrap();
    assert!(entries.iter().any(|e| e["name"] == "sgdisk"));
    assert!(entries.iter().all(|e| e["found"] == false));
}

#[test]
fn destructive_request_without_preflight_is_refused_over_the_wire() {
    let h = Harness::new();
    h.hal.add_disk(FakeDisk::external("disk4", 64 * MIB));
    h.hal.set_battery(BatterySnapshot {
        is_laptop: false,
        on_ac: true,
        percent: None,
    });

    let response = h.call(
        "wipe_device",
        json!({
            "deviceIdentifier": "disk4",
            "tableType": "gpt",
            "formatType": "exfat",
            "label": "USB",
        }),
    );
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["kind"], "preflight-required");
}

#[test]
fn unknown_actions_are_invalid_input() {
    let h = Harness::new();
    let response = h.call("frobnicate", json!({}));
    assert_eq!(response["ok"], false);
    assert_eq!(response["error"]["kind"], "invalid-input");
}

#[test]
fn shell_side_actions_are_unsupported_in_the_engine() {
    let h = Harness::new();
    let response = h.call("scan_directory", json!({ "path": "/tmp" }));
    assert_eq!(response["error"]["kind"], "unsupported");
}

#[test]
fn cancel_between_preflight_and_dispatch_is_a_noop() {
    let h = Harness::new();
    h.hal.add_disk(FakeDisk::external("disk4", 64 * MIB));

    h.call(
        "preflight_partition",
        json!({ "operation": "wipe", "deviceIdentifier": "disk4", "formatType": "exfat" }),
    );
    h.call("cancel_helper_operation", json!({}));

    let response = h.call(
        "wipe_device",
        json!({
            "deviceIdentifier": "disk4",
            "tableType": "gpt",
            "formatType": "exfat",
            "label": "USB",
        }),
    );
    assert_eq!(response["ok"], true, "{response}");
}
