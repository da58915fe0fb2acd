use std::path::PathBuf;
use std::time::Duration;

use cvd_shared::constants::defaults;
use cvd_shared::errors::{CvdError, CvdResult};

use super::argv::{Flag, parse_flags, split_list};
use super::env_spec::{EnvSpec, InstanceSpec};
use super::selector::{self, SelectorFlags};
use super::{VECTORIZED_FLAGS, is_known_launch_flag, start_flag_kind, start_options};
use crate::host::{Arch, HostContext};
use crate::instances::{IdRequest, Instance, VmmMode};

const UNDEFOK: &str = "undefok";
const VM_MANAGER: &str = "vm_manager";
const WEBRTC_DEVICE_ID: &str = "webrtc_device_id";
const SYSTEM_IMAGE_DIR: &str = "system_image_dir";

// ============================================================================
// START OPTIONS
// ============================================================================

/// Parsed arguments of `cvd start`.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub selector: SelectorFlags,
    pub config_file: Option<PathBuf>,
    pub overrides: Vec<String>,
    pub boot_timeout: Duration,
    pub daemon: bool,
    /// Everything else, in the order given.
    pub forwarded: Vec<Flag>,
}

impl StartOptions {
    /// Split `args` into dispatcher options and forwarded launch flags.
    ///
    /// `global` carries selector flags given before the subcommand; the
    /// same selector given on both sides must agree.
    pub fn parse(global: SelectorFlags, args: &[String]) -> CvdResult<Self> {
        let flags = parse_flags(args, start_flag_kind)?;
        let selector = global.merge(SelectorFlags::from_flags(&flags)?)?;
        selector.validate()?;

        let mut options = StartOptions {
            selector,
            config_file: None,
            overrides: Vec::new(),
            boot_timeout: Duration::from_secs(defaults::BOOT_TIMEOUT_SECS),
            daemon: false,
            forwarded: Vec::new(),
        };

        for flag in flags {
            match flag.name.as_str() {
                name if selector::is_selector_flag(name) => {}
                start_options::CONFIG_FILE => options.config_file = Some(PathBuf::from(&flag.value)),
                start_options::OVERRIDE => options.overrides.push(flag.value),
                start_options::BOOT_TIMEOUT => {
                    let secs = flag.value.parse::<u64>().ok().filter(|s| *s > 0).ok_or_else(|| {
                        CvdError::InvalidArgument(format!(
                            "--boot_timeout expects a positive number of seconds, got '{}'",
                            flag.value
                        ))
                    })?;
                    options.boot_timeout = Duration::from_secs(secs);
                }
                start_options::DAEMON => options.daemon = flag.as_bool()?,
                _ => options.forwarded.push(flag),
            }
        }

        Ok(options)
    }

    pub fn env_spec(&self) -> CvdResult<EnvSpec> {
        EnvSpec::load(self.config_file.as_deref(), &self.overrides)
    }

    /// Last forwarded value of `name`.
    fn forwarded_value(&self, name: &str) -> Option<&str> {
        self.forwarded
            .iter()
            .rev()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }
}

// ============================================================================
// OUTPUT RECORDS
// ============================================================================

/// Directories a new group is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCreationDirectories {
    pub group_dir: PathBuf,
    pub home: PathBuf,
    pub host_artifacts: PathBuf,
    /// One product directory per instance.
    pub product_out: Vec<PathBuf>,
    pub target_directory: PathBuf,
    pub logs_dir: PathBuf,
}

/// A local artifact to place under `target_directory/<instance_index>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchArtifact {
    pub instance_index: usize,
    pub source: PathBuf,
    pub name: String,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CvdFlags {
    /// Canonical `--key=value` flags for `assemble_cvd`, `--undefok` last.
    pub launch_cvd_flags: Vec<String>,
    pub selector_flags: SelectorFlags,
    /// Arguments for `fetch_cvd`; empty when nothing remote is needed.
    pub fetch_cvd_flags: Vec<String>,
    pub fetch_artifacts: Vec<FetchArtifact>,
    pub target_directory: PathBuf,
    pub group_creation_directories: GroupCreationDirectories,
    pub vmm_mode: VmmMode,
}

impl CvdFlags {
    pub fn needs_fetch(&self) -> bool {
        !self.fetch_cvd_flags.is_empty() || !self.fetch_artifacts.is_empty()
    }
}

/// Entry `i` of `values` for each of `count` instances; indices past the
/// end fall back to entry 0.
pub fn vectorize(values: &[String], count: usize) -> Vec<String> {
    if values.is_empty() {
        return Vec::new();
    }
    (0..count)
        .map(|i| values.get(i).unwrap_or(&values[0]).clone())
        .collect()
}

// ============================================================================
// ASSEMBLER
// ============================================================================

pub struct FlagAssembler<'a> {
    ctx: &'a HostContext,
    options: &'a StartOptions,
    spec: EnvSpec,
    host_arch: Arch,
}

impl<'a> FlagAssembler<'a> {
    pub fn new(
        ctx: &'a HostContext,
        options: &'a StartOptions,
        spec: EnvSpec,
        host_arch: Arch,
    ) -> Self {
        Self {
            ctx,
            options,
            spec,
            host_arch,
        }
    }

    pub fn spec(&self) -> &EnvSpec {
        &self.spec
    }

    pub fn instance_count(&self) -> CvdResult<usize> {
        self.options.selector.instance_count(self.spec.instances.len())
    }

    pub fn id_request(&self) -> CvdResult<IdRequest> {
        let count = self.instance_count()?;
        self.options.selector.id_request(self.ctx, count)
    }

    /// Group name requested by the selector or the environment specification.
    pub fn requested_group_name(&self) -> CvdResult<Option<String>> {
        let from_selector = self.options.selector.target_group()?;
        match (from_selector, &self.spec.common.group_name) {
            (Some(a), Some(b)) if &a != b => Err(CvdError::FlagConflict(format!(
                "--group_name={a} disagrees with the configured group name '{b}'"
            ))),
            (Some(a), _) => Ok(Some(a)),
            (None, b) => Ok(b.clone()),
        }
    }

    /// Instance names for `ids`: selector names, else configured names,
    /// else `cvd_<id>`.
    pub fn instance_names(&self, ids: &[u32]) -> CvdResult<Vec<String>> {
        if let Some(names) = self.options.selector.target_instance_names()? {
            return Ok(names);
        }
        Ok(ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                self.spec
                    .instances
                    .get(i)
                    .and_then(|inst| inst.name.clone())
                    .unwrap_or_else(|| Instance::default_name(*id))
            })
            .collect())
    }

    /// The single VM manager of a group of `count` instances.
    pub fn vmm_mode(&self, count: usize) -> CvdResult<VmmMode> {
        let explicit: Vec<Option<VmmMode>> = match self.options.forwarded_value(VM_MANAGER) {
            Some(value) => vectorize(&split_list(value), count)
                .iter()
                .map(|v| v.parse().map(Some))
                .collect::<CvdResult<_>>()?,
            None => (0..count)
                .map(|i| match self.spec.instances.get(i) {
                    Some(inst) => inst.vm_manager(),
                    None => Ok(None),
                })
                .collect::<CvdResult<_>>()?,
        };

        let mut resolved = Vec::with_capacity(count);
        for (i, choice) in explicit.iter().enumerate() {
            let target = self.target_arch(i)?;
            let compatible = self.host_arch.is_host_compatible(target);
            let mode = choice.unwrap_or(if compatible {
                VmmMode::Crosvm
            } else {
                VmmMode::QemuCli
            });
            resolved.push((mode, target, compatible));
        }

        let Some(&(first, _, _)) = resolved.first() else {
            return Err(CvdError::InvalidArgument("no instances requested".to_string()));
        };
        if resolved.iter().any(|(mode, _, _)| *mode != first) {
            let modes: Vec<&str> = resolved.iter().map(|(m, _, _)| m.as_str()).collect();
            return Err(CvdError::FlagConflict(format!(
                "all instances of a group must use the same vm manager, got {}",
                modes.join(",")
            )));
        }
        if first == VmmMode::Crosvm
            && let Some((_, target, _)) = resolved.iter().find(|(_, _, compatible)| !compatible)
        {
            return Err(CvdError::Unsupported(format!(
                "crosvm cannot run {target} guests on a {} host",
                self.host_arch
            )));
        }
        Ok(first)
    }

    fn target_arch(&self, index: usize) -> CvdResult<Arch> {
        Ok(self
            .spec
            .instances
            .get(index)
            .map(InstanceSpec::target_arch)
            .transpose()?
            .flatten()
            .unwrap_or(self.host_arch))
    }

    /// Build the flag sets for a group named `group_name` holding `ids`.
    pub fn assemble(&self, group_name: &str, ids: &[u32]) -> CvdResult<CvdFlags> {
        let count = ids.len();
        let vmm_mode = self.vmm_mode(count)?;
        let layout = self.ctx.layout().group(group_name);
        let target_directory = layout.artifacts_dir();

        let fetch_cvd_flags = self.fetch_cvd_flags(count, &target_directory);
        let fetch_artifacts = self.fetch_artifacts(count)?;
        let fetching = !fetch_cvd_flags.is_empty() || !fetch_artifacts.is_empty();

        let host_artifacts = match &self.spec.common.host_package {
            Some(path) => path.clone(),
            None => self.ctx.host_artifacts_path()?,
        };
        let product_out: Vec<PathBuf> = (0..count)
            .map(|i| {
                if fetching {
                    target_directory.join(i.to_string())
                } else {
                    self.ctx
                        .product_out()
                        .unwrap_or_else(|| host_artifacts.clone())
                }
            })
            .collect();

        let instance_nums: Vec<String> = ids.iter().map(u32::to_string).collect();
        let device_ids: Vec<String> = ids.iter().map(|id| format!("cvd-{id}")).collect();
        let mut launch = vec![
            Flag::new(selector::NUM_INSTANCES, count.to_string()),
            Flag::new(selector::INSTANCE_NUMS, instance_nums.join(",")),
            Flag::new(VM_MANAGER, vmm_mode.as_str()),
            Flag::new(WEBRTC_DEVICE_ID, device_ids.join(",")),
            Flag::new(
                SYSTEM_IMAGE_DIR,
                product_out
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        ];

        for name in VECTORIZED_FLAGS {
            if let Some(values) = self.vector_values(name, count) {
                launch.push(Flag::new(name, values.join(",")));
            }
        }

        let mut undefok: Vec<String> = Vec::new();
        for flag in &self.options.forwarded {
            let name = flag.name.as_str();
            if name == UNDEFOK {
                for entry in split_list(&flag.value) {
                    if !entry.is_empty() && !undefok.contains(&entry) {
                        undefok.push(entry);
                    }
                }
                continue;
            }
            if name == VM_MANAGER || VECTORIZED_FLAGS.contains(&name) {
                continue;
            }
            if (name == WEBRTC_DEVICE_ID || name == SYSTEM_IMAGE_DIR)
                && let Some(generated) = launch.iter_mut().find(|f| f.name == name)
            {
                generated.value = flag.value.clone();
                continue;
            }
            if !is_known_launch_flag(name) && !undefok.iter().any(|u| u == name) {
                undefok.push(name.to_string());
            }
            launch.push(flag.clone());
        }

        let mut launch_cvd_flags: Vec<String> = launch.iter().map(Flag::to_arg).collect();
        if !undefok.is_empty() {
            launch_cvd_flags.push(Flag::new(UNDEFOK, undefok.join(",")).to_arg());
        }

        tracing::debug!(
            group = group_name,
            ?ids,
            vmm = %vmm_mode,
            fetching,
            "Assembled launch flags"
        );

        Ok(CvdFlags {
            launch_cvd_flags,
            selector_flags: self.options.selector.clone(),
            fetch_cvd_flags,
            fetch_artifacts,
            target_directory: target_directory.clone(),
            group_creation_directories: GroupCreationDirectories {
                group_dir: layout.group_dir().to_path_buf(),
                home: layout.home_dir(),
                host_artifacts,
                product_out,
                target_directory,
                logs_dir: layout.logs_dir(),
            },
            vmm_mode,
        })
    }

    /// Per-instance values of a vectorized flag. A forwarded value wins
    /// over the environment specification; instances the specification
    /// leaves unset get an empty entry.
    fn vector_values(&self, name: &str, count: usize) -> Option<Vec<String>> {
        if let Some(value) = self.options.forwarded_value(name) {
            return Some(vectorize(&split_list(value), count));
        }

        let values: Vec<Option<String>> = (0..count)
            .map(|i| self.spec.instances.get(i).and_then(|inst| spec_value(inst, name)))
            .collect();
        if values.iter().all(Option::is_none) {
            return None;
        }
        Some(values.into_iter().map(Option::unwrap_or_default).collect())
    }

    fn fetch_cvd_flags(&self, count: usize, target_directory: &std::path::Path) -> Vec<String> {
        let builds: Vec<Option<&str>> = (0..count)
            .map(|i| {
                self.spec
                    .instances
                    .get(i)
                    .and_then(|inst| inst.disk.default_build.as_deref())
            })
            .collect();
        if builds.iter().all(Option::is_none) {
            return Vec::new();
        }

        let mut flags = vec![
            Flag::new("target_directory", target_directory.display().to_string()).to_arg(),
            Flag::new(
                "default_build",
                builds
                    .iter()
                    .map(|b| b.unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join(","),
            )
            .to_arg(),
        ];
        flags.extend(self.spec.fetch.flags.iter().cloned());
        flags
    }

    fn fetch_artifacts(&self, count: usize) -> CvdResult<Vec<FetchArtifact>> {
        self.spec
            .fetch
            .artifacts
            .iter()
            .map(|artifact| {
                if artifact.instance >= count {
                    return Err(CvdError::InvalidArgument(format!(
                        "artifact {} targets instance {} of a {count}-instance group",
                        artifact.source.display(),
                        artifact.instance
                    )));
                }
                let name = match &artifact.name {
                    Some(name) => name.clone(),
                    None => artifact
                        .source
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .ok_or_else(|| {
                            CvdError::InvalidArgument(format!(
                                "artifact source {} has no file name",
                                artifact.source.display()
                            ))
                        })?,
                };
                Ok(FetchArtifact {
                    instance_index: artifact.instance,
                    source: artifact.source.clone(),
                    name,
                    sha256: artifact.sha256.clone(),
                })
            })
            .collect()
    }
}

fn spec_value(instance: &InstanceSpec, name: &str) -> Option<String> {
    let disk = &instance.disk;
    match name {
        "boot_image" => disk.boot_image.clone(),
        "super_image" => disk.super_image.clone(),
        "initramfs_path" => disk.initramfs_path.clone(),
        "kernel_path" => disk.kernel_path.clone(),
        "vendor_boot_image" => disk.vendor_boot_image.clone(),
        other => instance.vm_setting(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> HostContext {
        HostContext::from_vars([
            ("HOME", "/home/t"),
            ("ANDROID_HOST_OUT", "/host"),
            ("ANDROID_PRODUCT_OUT", "/product"),
        ])
        .unwrap()
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn options(list: &[&str]) -> StartOptions {
        StartOptions::parse(SelectorFlags::default(), &args(list)).unwrap()
    }

    fn spec(value: serde_json::Value) -> EnvSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_start_options_split() {
        let opts = options(&[
            "--instance_nums=3,7",
            "--config_file=/c.json",
            "--override",
            "common.group_name=x",
            "--boot_timeout=30",
            "--daemon",
            "--gpu_mode=none",
        ]);
        assert_eq!(opts.selector.instance_nums, Some(vec![3, 7]));
        assert_eq!(opts.config_file, Some(PathBuf::from("/c.json")));
        assert_eq!(opts.overrides, vec!["common.group_name=x"]);
        assert_eq!(opts.boot_timeout, Duration::from_secs(30));
        assert!(opts.daemon);
        assert_eq!(opts.forwarded, vec![Flag::new("gpu_mode", "none")]);
    }

    #[test]
    fn test_start_options_bad_timeout() {
        let err = StartOptions::parse(SelectorFlags::default(), &args(&["--boot_timeout=0"]))
            .unwrap_err();
        assert!(matches!(err, CvdError::InvalidArgument(_)));
    }

    #[test]
    fn test_explicit_ids_flags() {
        let ctx = ctx();
        let opts = options(&["--instance_nums=3,7"]);
        let assembler = FlagAssembler::new(&ctx, &opts, EnvSpec::default(), Arch::X86_64);

        assert_eq!(assembler.id_request().unwrap(), IdRequest::Explicit(vec![3, 7]));
        let flags = assembler.assemble("cvd", &[3, 7]).unwrap();
        assert_eq!(
            flags.launch_cvd_flags,
            vec![
                "--num_instances=2",
                "--instance_nums=3,7",
                "--vm_manager=crosvm",
                "--webrtc_device_id=cvd-3,cvd-7",
                "--system_image_dir=/product,/product",
            ]
        );
        assert!(!flags.needs_fetch());
        assert_eq!(
            flags.group_creation_directories.home,
            PathBuf::from("/home/t/.cvd/cvd/home")
        );
    }

    #[test]
    fn test_heterogeneous_vmm_rejected() {
        let ctx = ctx();
        let opts = options(&[]);
        let env = spec(json!({"instances": [{"vm": "crosvm"}, {"vm": "qemu_cli"}]}));
        let assembler = FlagAssembler::new(&ctx, &opts, env, Arch::X86_64);
        assert!(matches!(assembler.vmm_mode(2), Err(CvdError::FlagConflict(_))));
    }

    #[test]
    fn test_vmm_default_by_arch() {
        let ctx = ctx();
        let opts = options(&[]);
        let env = spec(json!({"instances": [{"target_arch": "arm64"}]}));
        let assembler = FlagAssembler::new(&ctx, &opts, env.clone(), Arch::X86_64);
        assert_eq!(assembler.vmm_mode(1).unwrap(), VmmMode::QemuCli);

        let assembler = FlagAssembler::new(&ctx, &opts, env, Arch::Arm64);
        assert_eq!(assembler.vmm_mode(1).unwrap(), VmmMode::Crosvm);
    }

    #[test]
    fn test_crosvm_on_foreign_arch_unsupported() {
        let ctx = ctx();
        let opts = options(&["--vm_manager=crosvm"]);
        let env = spec(json!({"instances": [{"target_arch": "riscv64"}]}));
        let assembler = FlagAssembler::new(&ctx, &opts, env, Arch::X86_64);
        assert!(matches!(assembler.vmm_mode(1), Err(CvdError::Unsupported(_))));
    }

    #[test]
    fn test_vectorize_fallback() {
        let values = args(&["a", "b"]);
        assert_eq!(vectorize(&values, 3), vec!["a", "b", "a"]);
        assert_eq!(vectorize(&args(&["x"]), 2), vec!["x", "x"]);
        assert!(vectorize(&[], 2).is_empty());
    }

    #[test]
    fn test_vectorized_flags_from_spec_and_cli() {
        let ctx = ctx();
        let opts = options(&["--cpus=2,4"]);
        let env = spec(json!({"instances": [
            {"disk": {"boot_image": "/a/boot.img"}, "vm": {"cpus": 8, "memory_mb": 4096}},
            {"vm": {"crosvm": {"memory_mb": 2048}}}
        ]}));
        let assembler = FlagAssembler::new(&ctx, &opts, env, Arch::X86_64);
        let flags = assembler.assemble("cvd", &[1, 2]).unwrap().launch_cvd_flags;

        assert!(flags.contains(&"--boot_image=/a/boot.img,".to_string()));
        assert!(flags.contains(&"--cpus=2,4".to_string()));
        assert!(flags.contains(&"--memory_mb=4096,2048".to_string()));
    }

    #[test]
    fn test_undefok_lists_unknown_flags_once() {
        let ctx = ctx();
        let opts = options(&[
            "--gpu_mode=none",
            "--mystery=1",
            "--undefok=other",
            "--mystery=2",
            "--verbose_boot",
        ]);
        let assembler = FlagAssembler::new(&ctx, &opts, EnvSpec::default(), Arch::X86_64);
        let flags = assembler.assemble("cvd", &[1]).unwrap().launch_cvd_flags;

        assert_eq!(flags.last().unwrap(), "--undefok=mystery,other,verbose_boot");
        assert_eq!(flags.iter().filter(|f| f.starts_with("--undefok")).count(), 1);
        let forwarded: Vec<&String> = flags
            .iter()
            .filter(|f| f.starts_with("--mystery") || f.starts_with("--gpu_mode"))
            .collect();
        assert_eq!(forwarded, vec!["--gpu_mode=none", "--mystery=1", "--mystery=2"]);
    }

    #[test]
    fn test_no_undefok_when_all_known() {
        let ctx = ctx();
        let opts = options(&["--gpu_mode=none"]);
        let assembler = FlagAssembler::new(&ctx, &opts, EnvSpec::default(), Arch::X86_64);
        let flags = assembler.assemble("cvd", &[1]).unwrap().launch_cvd_flags;
        assert!(flags.iter().all(|f| !f.starts_with("--undefok")));
    }

    #[test]
    fn test_fetch_plan() {
        let ctx = ctx();
        let opts = options(&[]);
        let env = spec(json!({
            "instances": [{"disk": {"default_build": "main/phone"}}, {}],
            "fetch": {
                "artifacts": [{"instance": 1, "source": "/img/super.img"}],
                "flags": ["--keep_downloaded_archives"]
            }
        }));
        let assembler = FlagAssembler::new(&ctx, &opts, env, Arch::X86_64);
        let flags = assembler.assemble("phones", &[1, 2]).unwrap();

        assert!(flags.needs_fetch());
        assert_eq!(
            flags.fetch_cvd_flags,
            vec![
                "--target_directory=/home/t/.cvd/phones/artifacts",
                "--default_build=main/phone,",
                "--keep_downloaded_archives",
            ]
        );
        assert_eq!(flags.fetch_artifacts[0].name, "super.img");
        assert_eq!(
            flags.group_creation_directories.product_out,
            vec![
                PathBuf::from("/home/t/.cvd/phones/artifacts/0"),
                PathBuf::from("/home/t/.cvd/phones/artifacts/1"),
            ]
        );
    }

    #[test]
    fn test_artifact_out_of_range() {
        let ctx = ctx();
        let opts = options(&[]);
        let env = spec(json!({"fetch": {"artifacts": [{"instance": 3, "source": "/x.img"}]}}));
        let assembler = FlagAssembler::new(&ctx, &opts, env, Arch::X86_64);
        assert!(matches!(
            assembler.assemble("cvd", &[1]),
            Err(CvdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_names_and_group() {
        let ctx = ctx();
        let opts = options(&["--group_name=phones"]);
        let env = spec(json!({"instances": [{"name": "a"}, {}]}));
        let assembler = FlagAssembler::new(&ctx, &opts, env, Arch::X86_64);
        assert_eq!(assembler.requested_group_name().unwrap().as_deref(), Some("phones"));
        assert_eq!(assembler.instance_names(&[4, 5]).unwrap(), vec!["a", "cvd_5"]);

        let env = spec(json!({"common": {"group_name": "tablets"}}));
        let assembler = FlagAssembler::new(&ctx, &opts, env, Arch::X86_64);
        assert!(matches!(
            assembler.requested_group_name(),
            Err(CvdError::FlagConflict(_))
        ));
    }
}
