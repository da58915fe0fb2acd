use predicates::prelude::*;
use rstest::rstest;

mod common;

#[test]
fn test_help_lists_commands() {
    let mut ctx = common::cvd();

    ctx.cmd
        .arg("help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("status, fleet"));
}

#[test]
fn test_unknown_command_is_usage_error() {
    let mut ctx = common::cvd();

    ctx.cmd
        .arg("launch")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown command 'launch'"))
        .stderr(predicate::str::contains("Usage: cvd"));
}

#[rstest]
#[case("kill-server")]
#[case("restart-server")]
#[case("server-kill")]
fn test_deprecated_commands_are_no_ops(#[case] command: &str) {
    let mut ctx = common::cvd();

    ctx.cmd.arg(command).assert().success().stderr(
        predicate::str::contains(format!("\"{command}\" is deprecated")),
    );
    assert!(ctx.fake.database().is_none());
}

#[rstest]
#[case("status")]
#[case("fleet")]
fn test_status_without_devices(#[case] command: &str) {
    let mut ctx = common::cvd();

    ctx.cmd
        .arg(command)
        .assert()
        .success()
        .stdout(predicate::str::contains("No devices"));
}

#[test]
fn test_status_on_corrupted_registry_still_succeeds() {
    let mut ctx = common::cvd();
    let path = ctx.fake.database_path();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{ not json").unwrap();

    ctx.cmd
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"))
        .stderr(predicate::str::contains("instance database is corrupted"));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
}

#[test]
fn test_status_table_and_filter() {
    let ctx = common::cvd();
    ctx.new_cmd().arg("start").assert().success();

    ctx.new_cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("cvd-cvd_1"))
        .stdout(predicate::str::contains("RUNNING"))
        .stdout(predicate::str::contains("6520"));

    ctx.new_cmd()
        .args(["status", "--group_name=other"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No devices"));
}

#[test]
fn test_reset_clears_registry() {
    let ctx = common::cvd();
    ctx.new_cmd()
        .args(["start", "--num_instances=2"])
        .assert()
        .success();
    assert_eq!(ctx.fake.lock_status(2), "I");

    ctx.new_cmd()
        .args(["reset", "-y"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped all known instances"));

    assert!(ctx.groups().is_empty());
    assert_eq!(ctx.fake.lock_status(1), "N");
    assert_eq!(ctx.fake.lock_status(2), "N");
    assert!(!ctx.fake.home().join(".cvd/cvd").exists());
}

#[test]
fn test_file_log_is_written() {
    let mut ctx = common::cvd();

    ctx.cmd.args(["--file_verbosity=DEBUG", "status"]).assert().success();

    let log = std::fs::read_to_string(ctx.fake.home().join(".cvd/logs/cvd.log")).unwrap();
    assert!(log.contains("Dispatching"));
}
