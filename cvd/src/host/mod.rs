//! Host paths and environment.
//!
//! [`HostContext`] is built once at startup from a snapshot of the
//! environment and passed by reference to every component. All path
//! helpers are deterministic given that snapshot.

mod arch;
mod layout;

pub use arch::{Arch, arch_of_host};
pub use layout::{GroupLayout, InstanceLayout, RuntimeLayout, per_instance_dir};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use cvd_shared::constants::{defaults, envs, filenames};
use cvd_shared::errors::{CvdError, CvdResult};

#[derive(Clone, Debug)]
pub struct HostContext {
    vars: HashMap<String, String>,
    home: PathBuf,
}

impl HostContext {
    /// Snapshot the current process environment.
    pub fn from_env() -> CvdResult<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Build a context from explicit variables.
    ///
    /// `HOME` falls back to the passwd entry of the current user; only when
    /// both are missing does this fail with `EnvError`.
    pub fn from_vars<I, K, V>(vars: I) -> CvdResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let home = match vars.get(envs::HOME).filter(|v| !v.is_empty()) {
            Some(home) => PathBuf::from(home),
            None => dirs::home_dir().ok_or_else(|| {
                CvdError::EnvError(format!("{} is not set and no home directory is known", envs::HOME))
            })?,
        };

        Ok(Self { vars, home })
    }

    /// Non-empty value of an environment variable.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// All captured variables, for handing to child processes.
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn user(&self) -> Option<&str> {
        self.var(envs::USER)
    }

    /// Instance id implied by the environment, if any.
    ///
    /// `CUTTLEFISH_INSTANCE` wins over a `vsoc-NN` user name. A malformed
    /// `CUTTLEFISH_INSTANCE` is an error rather than silently ignored.
    pub fn env_instance_id(&self) -> CvdResult<Option<u32>> {
        if let Some(value) = self.var(envs::CUTTLEFISH_INSTANCE) {
            let id = value.trim().parse::<u32>().ok().filter(|id| *id >= 1).ok_or_else(|| {
                CvdError::EnvError(format!(
                    "{} must be a positive integer, got '{}'",
                    envs::CUTTLEFISH_INSTANCE,
                    value
                ))
            })?;
            return Ok(Some(id));
        }

        Ok(self
            .user()
            .and_then(|user| user.strip_prefix(defaults::VSOC_USER_PREFIX))
            .and_then(|suffix| suffix.parse::<u32>().ok())
            .filter(|id| *id >= 1))
    }

    /// Default instance id: env var, else user suffix, else 1.
    pub fn default_instance_id(&self) -> u32 {
        self.env_instance_id().ok().flatten().unwrap_or(1)
    }

    /// Runtime layout rooted at the per-user directory.
    pub fn layout(&self) -> RuntimeLayout {
        RuntimeLayout::new(self.home.join(filenames::PER_USER_DIR))
    }

    /// Host-wide directory holding the instance lock files.
    pub fn locks_dir(&self) -> PathBuf {
        self.var(envs::CVD_LOCKS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(defaults::LOCKS_DIR))
    }

    /// `~/.cuttlefish_config.json`, pointing at the most recent group config.
    pub fn global_config_link(&self) -> PathBuf {
        self.home.join(filenames::GLOBAL_CONFIG_LINK)
    }

    /// Configured host output roots, in search order.
    pub fn host_out_dirs(&self) -> Vec<PathBuf> {
        [envs::ANDROID_HOST_OUT, envs::ANDROID_SOONG_HOST_OUT]
            .iter()
            .filter_map(|name| self.var(name))
            .map(PathBuf::from)
            .collect()
    }

    /// Host artifacts root used for a new group.
    pub fn host_artifacts_path(&self) -> CvdResult<PathBuf> {
        let roots = self.host_out_dirs();
        if roots.is_empty() {
            return Err(CvdError::EnvError(format!(
                "neither {} nor {} is set",
                envs::ANDROID_HOST_OUT,
                envs::ANDROID_SOONG_HOST_OUT
            )));
        }
        Ok(roots
            .iter()
            .find(|root| root.join("bin").is_dir())
            .unwrap_or(&roots[0])
            .clone())
    }

    /// Locate a host binary under the configured host output roots.
    pub fn host_bin(&self, name: &str) -> CvdResult<PathBuf> {
        self.find_under_host_out("bin", name)
    }

    /// Locate a host shared resource under the configured host output roots.
    pub fn host_share(&self, name: &str) -> CvdResult<PathBuf> {
        self.find_under_host_out("usr/share", name)
    }

    /// Guest image path inside `ANDROID_PRODUCT_OUT`.
    pub fn guest_image(&self, name: &str) -> CvdResult<PathBuf> {
        self.product_out()
            .map(|dir| dir.join(name))
            .ok_or_else(|| CvdError::EnvError(format!("{} is not set", envs::ANDROID_PRODUCT_OUT)))
    }

    pub fn product_out(&self) -> Option<PathBuf> {
        self.var(envs::ANDROID_PRODUCT_OUT).map(PathBuf::from)
    }

    fn find_under_host_out(&self, subdir: &str, name: &str) -> CvdResult<PathBuf> {
        let roots = self.host_out_dirs();
        if roots.is_empty() {
            return Err(CvdError::EnvError(format!(
                "cannot locate '{}': neither {} nor {} is set",
                name,
                envs::ANDROID_HOST_OUT,
                envs::ANDROID_SOONG_HOST_OUT
            )));
        }

        let candidates: Vec<PathBuf> = roots.iter().map(|r| r.join(subdir).join(name)).collect();
        for candidate in &candidates {
            if candidate.exists() {
                tracing::trace!(path = %candidate.display(), "Found host artifact");
                return Ok(candidate.clone());
            }
        }

        let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        Err(CvdError::NotFound(format!(
            "host artifact '{}' not found. Searched: {}",
            name,
            searched.join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(extra: &[(&str, &str)]) -> HostContext {
        let mut vars = vec![("HOME", "/home/tester")];
        vars.extend_from_slice(extra);
        HostContext::from_vars(vars).unwrap()
    }

    #[test]
    fn test_default_instance_id_from_env() {
        let ctx = context(&[("CUTTLEFISH_INSTANCE", "4"), ("USER", "vsoc-09")]);
        assert_eq!(ctx.default_instance_id(), 4);
    }

    #[test]
    fn test_default_instance_id_from_user_suffix() {
        let ctx = context(&[("USER", "vsoc-09")]);
        assert_eq!(ctx.default_instance_id(), 9);
        assert_eq!(ctx.env_instance_id().unwrap(), Some(9));
    }

    #[test]
    fn test_default_instance_id_fallback() {
        let ctx = context(&[("USER", "alice")]);
        assert_eq!(ctx.default_instance_id(), 1);
        assert_eq!(ctx.env_instance_id().unwrap(), None);
    }

    #[test]
    fn test_malformed_instance_env_is_error() {
        let ctx = context(&[("CUTTLEFISH_INSTANCE", "zero")]);
        assert!(matches!(ctx.env_instance_id(), Err(CvdError::EnvError(_))));
    }

    #[test]
    fn test_paths_derive_from_home() {
        let ctx = context(&[]);
        assert_eq!(
            ctx.global_config_link(),
            PathBuf::from("/home/tester/.cuttlefish_config.json")
        );
        assert_eq!(
            ctx.layout().per_user_dir(),
            Path::new("/home/tester/.cvd")
        );
        assert_eq!(ctx.locks_dir(), PathBuf::from("/tmp/acloud_cvd_temp"));
    }

    #[test]
    fn test_locks_dir_override() {
        let ctx = context(&[("CVD_LOCKS_DIR", "/var/tmp/locks")]);
        assert_eq!(ctx.locks_dir(), PathBuf::from("/var/tmp/locks"));
    }

    #[test]
    fn test_host_bin_requires_env() {
        let ctx = context(&[]);
        assert!(matches!(ctx.host_bin("assemble_cvd"), Err(CvdError::EnvError(_))));
        assert!(matches!(ctx.guest_image("boot.img"), Err(CvdError::EnvError(_))));
    }

    #[test]
    fn test_host_bin_search_order() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        std::fs::create_dir_all(second.path().join("bin")).unwrap();
        std::fs::write(second.path().join("bin/run_cvd"), "").unwrap();

        let ctx = context(&[
            ("ANDROID_HOST_OUT", first.path().to_str().unwrap()),
            ("ANDROID_SOONG_HOST_OUT", second.path().to_str().unwrap()),
        ]);

        assert_eq!(ctx.host_bin("run_cvd").unwrap(), second.path().join("bin/run_cvd"));
        assert_eq!(ctx.host_artifacts_path().unwrap(), second.path());

        let err = ctx.host_bin("missing").unwrap_err();
        assert!(err.to_string().contains("Searched"));
    }

    #[test]
    fn test_guest_image() {
        let ctx = context(&[("ANDROID_PRODUCT_OUT", "/out/target/product/vsoc_x86_64")]);
        assert_eq!(
            ctx.guest_image("super.img").unwrap(),
            PathBuf::from("/out/target/product/vsoc_x86_64/super.img")
        );
    }
}
