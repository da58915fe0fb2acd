//! Stage 1: place per-instance artifacts under `target_directory/<n>/`.
//!
//! Local sources are copied; remote builds are left to the `fetch_cvd`
//! host binary. Every placed file is recorded with its SHA-256 in
//! `fetcher_config.json` so a later launch skips it when unchanged.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use cvd_shared::constants::{binaries, envs, filenames};
use cvd_shared::errors::{CvdError, CvdResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{LaunchContext, LaunchStage, check_exit, wait_child};
use crate::flags::FetchArtifact;

const STAGE: &str = "fetch";

/// Manifest of the files placed in a target directory, keyed by their
/// path relative to it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetcherConfig {
    #[serde(default)]
    pub files: BTreeMap<String, FetchedFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedFile {
    pub source: String,
    pub sha256: String,
}

impl FetcherConfig {
    pub fn path(target_directory: &Path) -> PathBuf {
        target_directory.join(filenames::FETCHER_CONFIG)
    }

    /// Load the manifest; a missing one is empty.
    pub fn load(target_directory: &Path) -> CvdResult<Self> {
        let path = Self::path(target_directory);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                CvdError::Corrupted(format!("invalid fetcher config {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(CvdError::Io(format!(
                "failed to read fetcher config {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn save(&self, target_directory: &Path) -> CvdResult<()> {
        let path = Self::path(target_directory);
        let mut temp = tempfile::NamedTempFile::new_in(target_directory)?;
        temp.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
        temp.persist(&path).map_err(|e| {
            CvdError::Io(format!("failed to write fetcher config {}: {}", path.display(), e.error))
        })?;
        Ok(())
    }

    /// Whether `key` is recorded and the file on disk still has the
    /// recorded hash (and `expected`, when given).
    pub fn is_current(&self, key: &str, path: &Path, expected: Option<&str>) -> CvdResult<bool> {
        let Some(recorded) = self.files.get(key) else {
            return Ok(false);
        };
        if expected.is_some_and(|sha| !sha.eq_ignore_ascii_case(&recorded.sha256)) {
            return Ok(false);
        }
        if !path.is_file() {
            return Ok(false);
        }
        Ok(sha256_file(path)? == recorded.sha256)
    }
}

/// Lower-case hex SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> CvdResult<String> {
    let mut file = File::open(path)
        .map_err(|e| CvdError::Io(format!("failed to open {}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| CvdError::Io(format!("failed to hash {}: {e}", path.display())))?;
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Default)]
pub struct FetchStage {
    /// Files placed by this run, in creation order.
    created: Vec<PathBuf>,
    created_target: bool,
}

impl FetchStage {
    fn place_local(
        &mut self,
        target: &Path,
        artifact: &FetchArtifact,
        manifest: &mut FetcherConfig,
    ) -> CvdResult<()> {
        let key = format!("{}/{}", artifact.instance_index, artifact.name);
        let dest = target.join(artifact.instance_index.to_string()).join(&artifact.name);

        if manifest.is_current(&key, &dest, artifact.sha256.as_deref())? {
            tracing::debug!(artifact = %key, "Artifact up to date, skipping");
            return Ok(());
        }

        if !artifact.source.is_file() {
            return Err(CvdError::NotFound(format!(
                "artifact source {} does not exist",
                artifact.source.display()
            )));
        }
        if let Some(dir) = dest.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| CvdError::Io(format!("failed to create {}: {e}", dir.display())))?;
        }

        let existed = dest.exists();
        std::fs::copy(&artifact.source, &dest).map_err(|e| {
            CvdError::Io(format!(
                "failed to copy {} to {}: {e}",
                artifact.source.display(),
                dest.display()
            ))
        })?;
        if !existed {
            self.created.push(dest.clone());
        }

        let sha256 = sha256_file(&dest)?;
        if let Some(expected) = &artifact.sha256
            && !expected.eq_ignore_ascii_case(&sha256)
        {
            return Err(CvdError::Corrupted(format!(
                "checksum mismatch for {}: expected {expected}, got {sha256}",
                artifact.source.display()
            )));
        }

        tracing::info!(artifact = %key, source = %artifact.source.display(), "Placed artifact");
        manifest.files.insert(
            key,
            FetchedFile {
                source: artifact.source.display().to_string(),
                sha256,
            },
        );
        Ok(())
    }

    fn run_fetch_cvd(&self, ctx: &LaunchContext<'_>) -> CvdResult<()> {
        let program = ctx.host.host_bin(binaries::FETCH_CVD)?;
        let dirs = &ctx.flags.group_creation_directories;
        std::fs::create_dir_all(&dirs.logs_dir)?;
        let log_path = dirs.logs_dir.join(filenames::FETCH_LOG);
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;

        tracing::info!(
            program = %program.display(),
            args = ?ctx.flags.fetch_cvd_flags,
            "Running fetch_cvd"
        );
        let mut child = Command::new(&program)
            .args(&ctx.flags.fetch_cvd_flags)
            .env(envs::HOME, &dirs.home)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|e| CvdError::Io(format!("failed to spawn {}: {e}", program.display())))?;

        let status = wait_child(&mut child, &ctx.interrupted, STAGE)?;
        check_exit(status, STAGE)
    }

    /// Record whatever `fetch_cvd` left in the per-instance directories.
    fn record_fetched(&self, target: &Path, count: usize, manifest: &mut FetcherConfig) -> CvdResult<()> {
        for index in 0..count {
            let dir = target.join(index.to_string());
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let key = format!("{index}/{}", entry.file_name().to_string_lossy());
                let sha256 = sha256_file(&path)?;
                manifest
                    .files
                    .entry(key)
                    .and_modify(|f| f.sha256.clone_from(&sha256))
                    .or_insert_with(|| FetchedFile {
                        source: binaries::FETCH_CVD.to_string(),
                        sha256,
                    });
            }
        }
        Ok(())
    }
}

impl LaunchStage for FetchStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn run(&mut self, ctx: &mut LaunchContext<'_>) -> CvdResult<()> {
        if !ctx.flags.needs_fetch() {
            tracing::debug!(group = %ctx.group_name, "Nothing to fetch");
            return Ok(());
        }

        let target = ctx.flags.target_directory.clone();
        if !target.exists() {
            std::fs::create_dir_all(&target).map_err(|e| {
                CvdError::Io(format!("failed to create {}: {e}", target.display()))
            })?;
            self.created_target = true;
        }

        let mut manifest = FetcherConfig::load(&target)?;
        let artifacts = ctx.flags.fetch_artifacts.clone();
        let outcome = artifacts.iter().try_for_each(|artifact| {
            ctx.check_interrupted(STAGE)?;
            self.place_local(&target, artifact, &mut manifest)
        });
        // Keep what was placed even when a later artifact failed
        manifest.save(&target)?;
        outcome?;

        if !ctx.flags.fetch_cvd_flags.is_empty() {
            self.run_fetch_cvd(ctx)?;
            self.record_fetched(&target, ctx.instance_ids.len(), &mut manifest)?;
            manifest.save(&target)?;
        }
        Ok(())
    }

    fn rollback(&mut self, ctx: &LaunchContext<'_>) {
        if self.created_target {
            let target = &ctx.flags.target_directory;
            if let Err(e) = std::fs::remove_dir_all(target) {
                tracing::warn!(path = %target.display(), error = %e, "Failed to remove fetch target");
            }
            self.created.clear();
            return;
        }
        for path in self.created.drain(..).rev() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove fetched file");
            }
        }
    }
}
