//! Stage 2: run `assemble_cvd` to write the group configuration.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use cvd_shared::constants::{binaries, envs, filenames};
use cvd_shared::errors::{CvdError, CvdResult};

use super::{LaunchContext, LaunchStage, check_exit, wait_child};
use crate::host::HostContext;
use crate::supervisor::LauncherConfig;

const STAGE: &str = "assemble";

#[derive(Debug, Default)]
pub struct AssembleStage {
    wrote_config: bool,
    /// Link target before this stage replaced it, if it did.
    replaced_link: Option<Option<PathBuf>>,
}

impl LaunchStage for AssembleStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn run(&mut self, ctx: &mut LaunchContext<'_>) -> CvdResult<()> {
        let dirs = &ctx.flags.group_creation_directories;
        let layout = ctx.layout();
        let config_path = layout.config_path();
        for dir in [&dirs.home, &dirs.logs_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| CvdError::Io(format!("failed to create {}: {e}", dir.display())))?;
        }

        let program = find_assemble_cvd(ctx.host, &dirs.host_artifacts)?;
        let log_path = dirs.logs_dir.join(filenames::ASSEMBLE_LOG);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| CvdError::Io(format!("failed to open {}: {e}", log_path.display())))?;

        let mut cmd = Command::new(&program);
        cmd.args(&ctx.flags.launch_cvd_flags)
            .env(envs::HOME, &dirs.home)
            .env(envs::ANDROID_HOST_OUT, &dirs.host_artifacts)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);
        if let Some(product_out) = dirs.product_out.first() {
            cmd.env(envs::ANDROID_PRODUCT_OUT, product_out);
        }

        tracing::info!(
            program = %program.display(),
            args = ?ctx.flags.launch_cvd_flags,
            log = %log_path.display(),
            "Running assemble_cvd"
        );
        self.wrote_config = !config_path.exists();
        let mut child = cmd
            .spawn()
            .map_err(|e| CvdError::Io(format!("failed to spawn {}: {e}", program.display())))?;
        let status = wait_child(&mut child, &ctx.interrupted, STAGE)?;
        check_exit(status, STAGE)?;

        let config = LauncherConfig::load(&config_path)?;
        let mut expected = ctx.instance_ids.clone();
        expected.sort_unstable();
        let written = config.instance_ids()?;
        if written != expected {
            return Err(CvdError::Corrupted(format!(
                "{} describes instances {written:?}, expected {expected:?}",
                config_path.display()
            )));
        }

        self.replaced_link = Some(link_global_config(ctx.host, &config_path)?);
        Ok(())
    }

    fn rollback(&mut self, ctx: &LaunchContext<'_>) {
        let layout = ctx.layout();
        for id in &ctx.instance_ids {
            let dir = layout.instance_dir(*id);
            if dir.exists()
                && let Err(e) = std::fs::remove_dir_all(&dir)
            {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to remove instance dir");
            }
        }
        if self.wrote_config {
            let _ = std::fs::remove_file(layout.config_path());
        }

        if let Some(previous) = self.replaced_link.take() {
            let link = ctx.host.global_config_link();
            let _ = std::fs::remove_file(&link);
            if let Some(target) = previous
                && let Err(e) = std::os::unix::fs::symlink(&target, &link)
            {
                tracing::warn!(link = %link.display(), error = %e, "Failed to restore config link");
            }
        }
    }
}

fn find_assemble_cvd(host: &HostContext, host_artifacts: &Path) -> CvdResult<PathBuf> {
    let bundled = host_artifacts.join("bin").join(binaries::ASSEMBLE_CVD);
    if bundled.is_file() {
        return Ok(bundled);
    }
    host.host_bin(binaries::ASSEMBLE_CVD)
}

/// Point `~/.cuttlefish_config.json` at `config_path`, returning the
/// previous link target. A regular file in its place is left alone.
fn link_global_config(host: &HostContext, config_path: &Path) -> CvdResult<Option<PathBuf>> {
    let link = host.global_config_link();
    let previous = match std::fs::symlink_metadata(&link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = std::fs::read_link(&link).ok();
            std::fs::remove_file(&link)
                .map_err(|e| CvdError::Io(format!("failed to replace {}: {e}", link.display())))?;
            target
        }
        Ok(_) => {
            tracing::warn!(path = %link.display(), "Not a symlink, leaving it in place");
            return Ok(None);
        }
        Err(_) => None,
    };

    std::os::unix::fs::symlink(config_path, &link)
        .map_err(|e| CvdError::Io(format!("failed to link {}: {e}", link.display())))?;
    tracing::debug!(link = %link.display(), target = %config_path.display(), "Linked group config");
    Ok(previous)
}
