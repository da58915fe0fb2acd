#![allow(dead_code)]

use assert_cmd::Command;
use cvd_test_utils::FakeHost;
use std::time::Duration;

/// One fake host per test: separate HOME, locks dir and host tools, so
/// tests do not contend for instance ids.
pub struct TestContext {
    pub cmd: Command,
    pub fake: FakeHost,
}

impl TestContext {
    /// A `cvd` command bound to this test's host.
    pub fn new_cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_cvd"));
        // You can override this with .timeout(Duration::from_secs(N))
        cmd.timeout(Duration::from_secs(60));
        cmd.env_clear().envs(self.fake.vars());
        cmd
    }

    /// `cvd status --json`, parsed.
    pub fn status(&self) -> serde_json::Value {
        let output = self
            .new_cmd()
            .args(["status", "--json"])
            .output()
            .expect("run cvd status");
        assert!(output.status.success(), "{output:?}");
        serde_json::from_slice(&output.stdout).expect("status prints JSON")
    }

    /// Registry groups, empty when the registry was never written.
    pub fn groups(&self) -> Vec<serde_json::Value> {
        self.fake
            .database()
            .and_then(|db| db["groups"].as_array().cloned())
            .unwrap_or_default()
    }
}

impl Drop for TestContext {
    // Leaves no run_cvd behind when an assertion fails mid-test
    fn drop(&mut self) {
        let _ = self.new_cmd().args(["reset", "-y"]).ok();
    }
}

pub fn cvd() -> TestContext {
    let fake = FakeHost::new();
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cvd"));
    cmd.timeout(Duration::from_secs(60));
    cmd.env_clear().envs(fake.vars());
    TestContext { cmd, fake }
}
