//! Group launches through `InstanceManager` against a fake host.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use cvd::flags::{SelectorFlags, StartOptions};
use cvd::instances::Query;
use cvd::{CvdError, HostContext, InstanceManager, InstanceState};
use cvd_test_utils::FakeHost;

fn manager(fake: &FakeHost) -> InstanceManager {
    InstanceManager::new(HostContext::from_vars(fake.vars()).unwrap())
}

fn options(args: &[&str]) -> StartOptions {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    StartOptions::parse(SelectorFlags::default(), &args).unwrap()
}

fn not_interrupted() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[test]
fn test_assemble_failure_rolls_back_everything() {
    let fake = FakeHost::new();
    fake.fail_assemble(1);
    let manager = manager(&fake);

    let err = manager
        .start(&options(&["--instance_nums=2"]), not_interrupted())
        .unwrap_err();
    assert!(matches!(err, CvdError::ChildFailed { exit_code: Some(1), .. }));

    assert!(manager.database().snapshot().unwrap().groups.is_empty());
    assert_eq!(fake.lock_status(2), "N");
    let layout = manager.host().layout().group("cvd");
    assert!(!layout.instance_dir(2).exists());
    assert!(!layout.group_dir().exists());
}

#[test]
fn test_supervisor_exit_keeps_group_failed() {
    let fake = FakeHost::new();
    fake.install_run_cvd("echo \"run_cvd $*\"\nexit 1\n");
    let manager = manager(&fake);

    let err = manager.start(&options(&[]), not_interrupted()).unwrap_err();
    assert!(matches!(err, CvdError::ChildFailed { exit_code: Some(1), .. }));

    let group = manager
        .database()
        .find_group(&Query::default().group_name("cvd"))
        .unwrap();
    assert_eq!(group.instances.len(), 1);
    assert_eq!(group.instances[0].state, InstanceState::Failed);
    assert_eq!(fake.lock_status(group.instances[0].id), "I");

    let log = std::fs::read_to_string(
        manager.host().layout().group("cvd").launcher_log_path(),
    )
    .unwrap();
    assert!(log.contains("--group_name=cvd"));
    assert!(log.contains("--instance_database="));
}

#[test]
fn test_boot_timeout_kills_supervisor() {
    let fake = FakeHost::new();
    fake.install_run_cvd("exec sleep 30\n");
    let manager = manager(&fake);

    let mut opts = options(&["--instance_nums=4"]);
    opts.boot_timeout = Duration::from_secs(1);
    let err = manager.start(&opts, not_interrupted()).unwrap_err();
    assert!(matches!(err, CvdError::Timeout(_)));

    let info = manager
        .database()
        .find_instance(&Query::default().instance_id(4))
        .unwrap();
    assert_eq!(info.instance.state, InstanceState::Failed);
    let group = manager
        .database()
        .find_group(&Query::default().group_name(info.group_name))
        .unwrap();
    assert_eq!(group.supervisor_pid, None);

    // A failed group is stopped like any other, which frees its id
    manager
        .stop(&SelectorFlags::default(), &Default::default())
        .unwrap();
    assert_eq!(fake.lock_status(4), "N");
}

#[test]
fn test_interrupted_launch_removes_group() {
    let fake = FakeHost::new();
    let manager = manager(&fake);

    let err = manager
        .start(&options(&["--instance_nums=5"]), Arc::new(AtomicBool::new(true)))
        .unwrap_err();
    assert!(matches!(err, CvdError::Cancelled(_)));
    assert!(manager.database().snapshot().unwrap().groups.is_empty());
    assert_eq!(fake.lock_status(5), "N");
}

#[test]
fn test_busy_id_leaves_registry_unchanged() {
    let fake = FakeHost::new();
    fake.install_run_cvd("exit 1\n");
    let manager = manager(&fake);

    // Leaves a FAILED group holding id 3
    manager
        .start(&options(&["--instance_nums=3"]), not_interrupted())
        .unwrap_err();
    let before = manager.database().snapshot().unwrap();

    let err = manager
        .start(&options(&["--instance_nums=3", "--group_name=other"]), not_interrupted())
        .unwrap_err();
    assert!(matches!(err, CvdError::ResourcesBusy(_)));
    assert_eq!(manager.database().snapshot().unwrap(), before);
    assert_eq!(fake.lock_status(3), "I");
}

#[test]
fn test_heterogeneous_vmm_locks_nothing() {
    let fake = FakeHost::new();
    let manager = manager(&fake);
    let config = fake.root().join("env.json");
    std::fs::write(
        &config,
        r#"{"instances": [{"vm": "crosvm"}, {"vm": "qemu_cli"}]}"#,
    )
    .unwrap();

    let err = manager
        .start(
            &options(&[&format!("--config_file={}", config.display())]),
            not_interrupted(),
        )
        .unwrap_err();
    assert!(matches!(err, CvdError::FlagConflict(_)));
    assert!(fake.database().is_none());
    assert_eq!(fake.lock_status(1), "");
}
