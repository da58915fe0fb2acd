//! JSON environment specification.
//!
//! ```json
//! {
//!   "common": { "group_name": "phones", "host_package": "/opt/cvd-host" },
//!   "instances": [
//!     { "name": "phone", "vm": { "vm_manager": "crosvm", "cpus": 4, "memory_mb": 4096 },
//!       "target_arch": "x86_64",
//!       "disk": { "boot_image": "/img/boot.img", "default_build": "aosp-main/aosp_cf_x86_64_phone-userdebug" } },
//!     { "name": "tablet", "vm": "crosvm" }
//!   ],
//!   "fetch": { "artifacts": [ { "instance": 0, "source": "/img/super.img", "sha256": "..." } ] }
//! }
//! ```
//!
//! The document is patched with `path=value` overrides before it is
//! typed, so overrides may introduce fields the file does not have.

use std::path::{Path, PathBuf};

use cvd_shared::errors::{CvdError, CvdResult};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::host::Arch;
use crate::instances::VmmMode;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvSpec {
    #[serde(default)]
    pub common: CommonSpec,
    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
    #[serde(default)]
    pub fetch: FetchSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CommonSpec {
    pub group_name: Option<String>,
    pub host_package: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InstanceSpec {
    pub name: Option<String>,
    /// `"crosvm"`, `{"vm_manager": "crosvm", ...}` or `{"crosvm": {...}}`.
    pub vm: Option<Value>,
    pub target_arch: Option<String>,
    #[serde(default)]
    pub disk: DiskSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DiskSpec {
    pub boot_image: Option<String>,
    pub super_image: Option<String>,
    pub initramfs_path: Option<String>,
    pub kernel_path: Option<String>,
    pub vendor_boot_image: Option<String>,
    /// Remote build to fetch for this instance.
    pub default_build: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FetchSpec {
    #[serde(default)]
    pub artifacts: Vec<ArtifactSpec>,
    /// Extra flags handed to `fetch_cvd` verbatim.
    #[serde(default)]
    pub flags: Vec<String>,
}

/// A local file to place in `target_directory/<instance>/`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArtifactSpec {
    #[serde(default)]
    pub instance: usize,
    pub source: PathBuf,
    /// File name in the target directory; defaults to the source name.
    pub name: Option<String>,
    /// Expected lowercase hex SHA-256 of the source.
    pub sha256: Option<String>,
}

impl InstanceSpec {
    pub fn vm_manager(&self) -> CvdResult<Option<VmmMode>> {
        let Some(vm) = &self.vm else {
            return Ok(None);
        };
        match vm {
            Value::String(name) => name.parse().map(Some),
            Value::Object(fields) => {
                if let Some(name) = fields.get("vm_manager") {
                    let name = name.as_str().ok_or_else(|| {
                        CvdError::InvalidArgument("vm.vm_manager must be a string".to_string())
                    })?;
                    return name.parse().map(Some);
                }
                let backends: Vec<&String> = fields
                    .keys()
                    .filter(|k| k.parse::<VmmMode>().is_ok())
                    .collect();
                match backends.as_slice() {
                    [] => Ok(None),
                    [one] => one.parse().map(Some),
                    _ => Err(CvdError::FlagConflict(format!(
                        "instance '{}' names several vm managers",
                        self.name.as_deref().unwrap_or("?")
                    ))),
                }
            }
            Value::Null => Ok(None),
            other => Err(CvdError::InvalidArgument(format!(
                "vm must be a string or an object, got {other}"
            ))),
        }
    }

    /// A numeric VM setting (`cpus`, `memory_mb`), looked up in the vm
    /// object and in a nested backend object.
    pub fn vm_setting(&self, key: &str) -> Option<String> {
        let Some(Value::Object(fields)) = &self.vm else {
            return None;
        };
        fields
            .get(key)
            .or_else(|| {
                fields
                    .values()
                    .filter_map(Value::as_object)
                    .find_map(|backend| backend.get(key))
            })
            .and_then(scalar_to_string)
    }

    pub fn target_arch(&self) -> CvdResult<Option<Arch>> {
        self.target_arch.as_deref().map(str::parse).transpose()
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl EnvSpec {
    /// Load `path` (when given), apply `overrides`, and type the result.
    pub fn load(path: Option<&Path>, overrides: &[String]) -> CvdResult<Self> {
        let mut document = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    CvdError::Io(format!("failed to read config file {}: {e}", path.display()))
                })?;
                serde_json::from_str(&text).map_err(|e| {
                    CvdError::InvalidArgument(format!(
                        "config file {} is not valid JSON: {e}",
                        path.display()
                    ))
                })?
            }
            None => Value::Object(Map::new()),
        };

        for entry in overrides {
            apply_override(&mut document, entry)?;
        }

        serde_json::from_value(document)
            .map_err(|e| CvdError::InvalidArgument(format!("invalid environment specification: {e}")))
    }
}

/// Apply one `dotted.path=value` override to `document`.
///
/// Numeric segments index arrays; indexing one past the end appends.
/// Missing objects along the path are created. The value is parsed as
/// JSON, falling back to a plain string.
pub fn apply_override(document: &mut Value, entry: &str) -> CvdResult<()> {
    let (path, raw_value) = entry.split_once('=').ok_or_else(|| {
        CvdError::InvalidArgument(format!("override '{entry}' must have the form path=value"))
    })?;
    if path.is_empty() || path.split('.').any(str::is_empty) {
        return Err(CvdError::InvalidArgument(format!(
            "override path '{path}' has an empty segment"
        )));
    }
    let value = serde_json::from_str(raw_value).unwrap_or_else(|_| Value::String(raw_value.to_string()));

    let segments: Vec<&str> = path.split('.').collect();
    let mut current = document;
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        current = step(current, segment, path)?;
        if last {
            *current = value;
            return Ok(());
        }
    }
    Ok(())
}

fn step<'a>(node: &'a mut Value, segment: &str, path: &str) -> CvdResult<&'a mut Value> {
    if node.is_null() {
        *node = if segment.parse::<usize>().is_ok() {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
    }

    match node {
        Value::Array(items) => {
            let index: usize = segment.parse().map_err(|_| {
                CvdError::InvalidArgument(format!(
                    "override '{path}': '{segment}' indexes an array but is not a number"
                ))
            })?;
            if index == items.len() {
                items.push(Value::Null);
            }
            let len = items.len();
            items.get_mut(index).ok_or_else(|| {
                CvdError::InvalidArgument(format!(
                    "override '{path}': index {index} is out of range ({len} elements)"
                ))
            })
        }
        Value::Object(fields) => Ok(fields.entry(segment.to_string()).or_insert(Value::Null)),
        _ => Err(CvdError::InvalidArgument(format!(
            "override '{path}': '{segment}' descends into a scalar"
        ))),
    }
}
