// tests/update_flow.rs

//! End-to-end update transactions against a temporary root.

mod common;

use common::{Harness, build_package, component, model_package, quick_wait, write_in_chunks};
use sensor_fwupdate::transaction::find_incomplete_journals;
use sensor_fwupdate::component::RECORD_SIZE;
use sensor_fwupdate::{ParameterStore, ResultCode, StorageItem, TargetComponent, UpdateState};
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const AI: TargetComponent = TargetComponent::AiModel;

fn install(harness: &Harness, version: &str, hash_byte: u8) {
    let package = model_package(version, 256);
    let handle = harness.engine.begin(AI, "dev0", &component(hash_byte)).unwrap();
    write_in_chunks(harness, handle, &package.bytes, 2).unwrap();
    harness.engine.complete(handle).unwrap();
}

#[test]
fn test_install_ai_model() {
    let harness = Harness::new();
    let package = model_package("000000000000", 4000);

    let handle = harness.engine.begin(AI, "dev0", &component(0x11)).unwrap();
    write_in_chunks(&harness, handle, &package.bytes, 3).unwrap();
    assert_eq!(harness.engine.state(handle).unwrap(), UpdateState::Writing);
    assert_eq!(
        harness.engine.bytes_written(handle).unwrap(),
        package.bytes.len() as u64
    );
    harness.engine.complete(handle).unwrap();

    let listed = harness.engine.list_components(AI, "dev0").unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].valid);
    assert_eq!(listed[0].total_size, 4000);
    assert_eq!(listed[0].hash, common::hash(0x11));
    assert_eq!(listed[0].version, "000000000000");
    assert!(!listed[0].update_date.is_empty());

    let rpk = harness.rpk_path("000000000000", 0x11);
    assert_eq!(fs::read(&rpk).unwrap(), package.artifact);

    let json = fs::read_to_string(harness.json_path("000000")).unwrap();
    let descriptor: serde_json::Value = serde_json::from_str(&json).unwrap();
    let entry = &descriptor[harness.config.network_name.as_str()];
    assert_eq!(entry["network_file"], rpk.to_str().unwrap());
    assert_eq!(entry["save_input_tensor"]["div_shift"], 6);
    assert_eq!(
        entry["save_input_tensor"]["div_val"],
        serde_json::json!([64, 65, 66, 1])
    );

    assert!(!harness.config.tmp_dir.exists());
    assert!(
        find_incomplete_journals(&harness.config.journal_dir())
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_cancel_after_partial_write() {
    let harness = Harness::new();
    let package = model_package("000000000000", 4000);

    let handle = harness.engine.begin(AI, "dev0", &component(0x11)).unwrap();
    let partial = &package.bytes[..2048];
    write_in_chunks(&harness, handle, partial, 2).unwrap();
    assert!(harness.config.raw_artifact_path().exists());

    harness.engine.cancel(handle).unwrap();

    assert!(harness.installed().is_empty());
    assert!(!harness.config.tmp_dir.exists());
    assert!(!harness.rpk_path("000000000000", 0x11).exists());
    assert!(
        find_incomplete_journals(&harness.config.journal_dir())
            .unwrap()
            .is_empty()
    );

    // The engine accepts a new transaction afterwards
    let handle = harness.engine.begin(AI, "dev0", &component(0x11)).unwrap();
    assert_eq!(harness.engine.state(handle).unwrap(), UpdateState::Idle);
}

#[test]
fn test_slots_fill_then_exhaust() {
    let harness = Harness::new();
    let capacity = harness.config.max_ai_model_count;

    for n in 0..capacity {
        install(&harness, &format!("0000001000{:02}0000", n), n as u8 + 1);
    }

    let listed = harness.engine.list_components(AI, "dev0").unwrap();
    assert_eq!(listed.len(), capacity);
    assert!(listed.iter().all(|c| c.valid));
    let mut bundles: Vec<_> = listed.iter().map(|c| c.bundle_id()).collect();
    bundles.sort();
    bundles.dedup();
    assert_eq!(bundles.len(), capacity);

    let err = harness.engine.begin(AI, "dev0", &component(0xee)).unwrap_err();
    assert_eq!(err.code(), ResultCode::ResourceExhausted);

    // Beginning with registered content still selects its slot
    let handle = harness.engine.begin(AI, "dev0", &component(1)).unwrap();
    harness.engine.cancel(handle).unwrap();
}

#[test]
fn test_duplicate_bundle_rejected_at_complete() {
    let harness = Harness::new();
    install(&harness, "000000123456", 0x21);
    let before = harness.engine.list_components(AI, "dev0").unwrap();

    // Same bundle identifier, different content
    let package = model_package("999999123456", 256);
    let handle = harness.engine.begin(AI, "dev0", &component(0x22)).unwrap();
    write_in_chunks(&harness, handle, &package.bytes, 1).unwrap();

    let err = harness.engine.complete(handle).unwrap_err();
    assert_eq!(err.code(), ResultCode::AlreadyExists);
    assert_eq!(harness.engine.state(handle).unwrap(), UpdateState::Error);
    harness.engine.cancel(handle).unwrap();

    assert_eq!(harness.engine.list_components(AI, "dev0").unwrap(), before);
    assert!(harness.rpk_path("000000123456", 0x21).exists());
    assert!(harness.json_path("123456").exists());
    assert!(!harness.rpk_path("999999123456", 0x22).exists());
}

#[test]
fn test_rewriting_registered_content_rejected() {
    let harness = Harness::new();
    install(&harness, "000000123456", 0x21);

    let package = model_package("000000123456", 256);
    let handle = harness.engine.begin(AI, "dev0", &component(0x21)).unwrap();
    let err = write_in_chunks(&harness, handle, &package.bytes, 1).unwrap_err();
    assert_eq!(err.code(), ResultCode::AlreadyExists);
    assert_eq!(harness.engine.state(handle).unwrap(), UpdateState::Error);
    harness.engine.cancel(handle).unwrap();

    assert!(harness.rpk_path("000000123456", 0x21).exists());
}

#[test]
fn test_erase_then_complete() {
    let harness = Harness::new();
    install(&harness, "000000111111", 0x31);
    install(&harness, "000000222222", 0x32);

    let handle = harness.engine.begin(AI, "dev0", &component(0x31)).unwrap();
    harness.engine.erase(handle).unwrap();
    assert_eq!(harness.engine.state(handle).unwrap(), UpdateState::EraseDone);
    assert!(!harness.rpk_path("000000111111", 0x31).exists());
    assert!(!harness.json_path("111111").exists());
    harness.engine.complete(handle).unwrap();

    let installed = harness.installed();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].version, "000000222222");
    assert!(harness.rpk_path("000000222222", 0x32).exists());

    // The freed slot is reused
    install(&harness, "000000333333", 0x33);
    let listed = harness.engine.list_components(AI, "dev0").unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].version, "000000333333");
    assert!(listed.iter().all(|c| c.valid));
}

#[test]
fn test_list_includes_free_slots_in_order() {
    let harness = Harness::new();
    install(&harness, "000000111111", 0x31);
    install(&harness, "000000222222", 0x32);

    let handle = harness.engine.begin(AI, "dev0", &component(0x31)).unwrap();
    harness.engine.erase(handle).unwrap();
    harness.engine.complete(handle).unwrap();

    let slots = harness.store.size(StorageItem::FwMgrBinaryInfo1).unwrap() / RECORD_SIZE;
    let listed = harness.engine.list_components(AI, "dev0").unwrap();
    assert_eq!(listed.len(), slots);
    assert_eq!(listed.len(), 2);
    assert!(!listed[0].valid);
    assert!(listed[1].valid);
    assert_eq!(listed[1].version, "000000222222");
}

#[test]
fn test_cancel_after_erase_keeps_erasure() {
    let harness = Harness::new();
    install(&harness, "000000111111", 0x31);

    let handle = harness.engine.begin(AI, "dev0", &component(0x31)).unwrap();
    harness.engine.erase(handle).unwrap();
    harness.engine.cancel(handle).unwrap();

    assert!(harness.installed().is_empty());
    assert!(!harness.rpk_path("000000111111", 0x31).exists());
}

#[test]
fn test_truncated_package_fails_complete() {
    let harness = Harness::new();
    let package = build_package("000000444444", &[128, 128], true, common::RGB_MANIFEST);
    let first_block = 32 + 128 + 64;

    let handle = harness.engine.begin(AI, "dev0", &component(0x41)).unwrap();
    write_in_chunks(&harness, handle, &package.bytes[..first_block + 10], 1).unwrap();

    let err = harness.engine.complete(handle).unwrap_err();
    assert_eq!(err.code(), ResultCode::InvalidData);
    assert_eq!(harness.engine.state(handle).unwrap(), UpdateState::Error);

    harness.engine.cancel(handle).unwrap();
    assert!(harness.installed().is_empty());
    assert!(!harness.config.tmp_dir.exists());
}

#[test]
fn test_converter_failure_is_internal() {
    let harness = Harness::new();
    let manifest = format!("{}fake_converter=fail\n", common::RGB_MANIFEST);
    let package = build_package("000000555555", &[256], false, &manifest);

    let handle = harness.engine.begin(AI, "dev0", &component(0x51)).unwrap();
    write_in_chunks(&harness, handle, &package.bytes, 1).unwrap();
    let err = harness.engine.complete(handle).unwrap_err();
    assert_eq!(err.code(), ResultCode::Internal);

    harness.engine.cancel(handle).unwrap();
    assert!(harness.installed().is_empty());
    assert!(!harness.rpk_path("000000555555", 0x51).exists());
}

#[test]
fn test_converter_timeout_blocks_other_entry_points() {
    let harness = Arc::new(Harness::with_wait(quick_wait()));
    let manifest = format!("{}fake_converter=sleep\n", common::RGB_MANIFEST);
    let package = build_package("000000666666", &[256], false, &manifest);

    let handle = harness.engine.begin(AI, "dev0", &component(0x61)).unwrap();
    write_in_chunks(&harness, handle, &package.bytes, 1).unwrap();

    let worker = {
        let harness = Arc::clone(&harness);
        thread::spawn(move || {
            let started = Instant::now();
            let result = harness.engine.complete(handle);
            (result.map_err(|e| e.code()), started.elapsed())
        })
    };

    // While Complete supervises the converter every entry point is busy
    let mut saw_busy = false;
    while !worker.is_finished() {
        match harness.engine.begin(AI, "dev0", &component(0x62)) {
            Err(e) if e.code() == ResultCode::Busy => saw_busy = true,
            Err(e) => assert_eq!(e.code(), ResultCode::FailedPrecondition),
            Ok(_) => panic!("second transaction opened while one is in progress"),
        }
        thread::sleep(Duration::from_millis(5));
    }

    let (result, elapsed) = worker.join().unwrap();
    assert_eq!(result, Err(ResultCode::DeadlineExceeded));
    assert!(elapsed < quick_wait().total() + Duration::from_secs(2));
    assert!(saw_busy);

    let err = harness.engine.begin(AI, "dev0", &component(0x62)).unwrap_err();
    assert_eq!(err.code(), ResultCode::FailedPrecondition);
    harness.engine.cancel(handle).unwrap();
    assert!(harness.installed().is_empty());
}

#[test]
fn test_second_engine_is_busy() {
    let harness = Harness::new();
    let other = harness.sibling_engine();

    let handle = harness.engine.begin(AI, "dev0", &component(0x71)).unwrap();
    let err = other.begin(AI, "dev0", &component(0x72)).unwrap_err();
    assert_eq!(err.code(), ResultCode::Busy);

    harness.engine.cancel(handle).unwrap();
    let handle = other.begin(AI, "dev0", &component(0x72)).unwrap();
    other.cancel(handle).unwrap();
}

#[test]
fn test_version_comes_from_package() {
    let harness = Harness::new();
    let mut info = component(0x81);
    info.version = "1".to_string();

    let package = model_package("000000818181", 512);
    let handle = harness.engine.begin(AI, "dev0", &info).unwrap();
    write_in_chunks(&harness, handle, &package.bytes, 7).unwrap();
    harness.engine.complete(handle).unwrap();

    let listed = harness.engine.list_components(AI, "dev0").unwrap();
    assert_eq!(listed[0].version, "000000818181");
    assert_eq!(listed[0].total_size, 512);
}
