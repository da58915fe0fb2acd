use cvd_test_utils::VmmBehavior;
use predicates::prelude::*;

mod common;

fn entry(entries: &[serde_json::Value], id: u64) -> &serde_json::Value {
    entries
        .iter()
        .find(|e| e["id"] == id)
        .unwrap_or_else(|| panic!("no instance {id} in {entries:?}"))
}

#[test]
fn test_start_then_stop_releases_everything() {
    let mut ctx = common::cvd();

    ctx.cmd
        .args(["start", "--daemon"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cvd-cvd_1"));

    assert_eq!(ctx.fake.lock_status(1), "I");
    let groups = ctx.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["name"], "cvd");
    assert_eq!(groups[0]["instances"][0]["state"], "RUNNING");

    ctx.new_cmd()
        .args(["stop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped group 'cvd'"));

    assert!(ctx.groups().is_empty());
    assert_eq!(ctx.fake.lock_status(1), "N");
}

#[test]
fn test_explicit_instance_nums() {
    let ctx = common::cvd();

    ctx.new_cmd()
        .args(["--instance_nums=3,7", "start"])
        .assert()
        .success();

    let status = ctx.status();
    let entries = status.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entry(entries, 3)["vsock_cid"], 5);
    assert_eq!(entry(entries, 3)["adb_port"], 6522);
    assert_eq!(entry(entries, 7)["vsock_cid"], 9);
    assert_eq!(entry(entries, 7)["adb_port"], 6526);
    assert_eq!(entry(entries, 7)["device_name"], "cvd-cvd_7");
}

#[test]
fn test_busy_instance_id_fails() {
    let ctx = common::cvd();

    ctx.new_cmd()
        .args(["start", "--instance_nums=3"])
        .assert()
        .success();
    let before = ctx.fake.database();

    ctx.new_cmd()
        .args(["start", "--instance_nums=3", "--group_name=other"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("resources busy"));

    assert_eq!(ctx.fake.database(), before);
}

#[test]
fn test_bad_group_name_is_usage_error() {
    let mut ctx = common::cvd();

    ctx.cmd
        .args(["start", "--group_name=1abc"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("invalid name"));

    assert!(ctx.fake.database().is_none());
    assert_eq!(ctx.fake.lock_status(1), "");
}

#[test]
fn test_assemble_failure_names_the_stage() {
    let mut ctx = common::cvd();
    ctx.fake.fail_assemble(1);

    ctx.cmd
        .arg("start")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("assemble failed with exit code 1"));

    assert!(ctx.groups().is_empty());
    assert_eq!(ctx.fake.lock_status(1), "N");
}

#[test]
fn test_verbose_errors_include_kind() {
    let mut ctx = common::cvd();
    ctx.fake.fail_assemble(4);

    ctx.cmd
        .args(["--verbosity=VERBOSE", "start"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("[ChildFailed]"));
}

#[test]
fn test_heterogeneous_vmm_is_rejected() {
    let mut ctx = common::cvd();
    let config = ctx.fake.root().join("env.json");
    std::fs::write(
        &config,
        r#"{"instances": [{"vm": "crosvm"}, {"vm": "qemu_cli"}]}"#,
    )
    .unwrap();

    ctx.cmd
        .args(["start", &format!("--config_file={}", config.display())])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("conflicting flags"));

    assert!(ctx.fake.database().is_none());
    assert_eq!(ctx.fake.lock_status(1), "");
}

#[test]
fn test_boot_timeout_keeps_group_failed() {
    let mut ctx = common::cvd();
    ctx.fake.set_vmm(VmmBehavior::NeverBoots);

    ctx.cmd
        .args(["start", "--boot_timeout=2"])
        .assert()
        .code(1);

    // run_cvd's teardown must not leave the group STOPPED
    let groups = ctx.groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["instances"][0]["state"], "FAILED");
    assert!(groups[0]["supervisor_pid"].is_null());
    assert_eq!(ctx.fake.lock_status(1), "I");

    ctx.new_cmd().arg("stop").assert().success();
    assert!(ctx.groups().is_empty());
    assert_eq!(ctx.fake.lock_status(1), "N");
}
