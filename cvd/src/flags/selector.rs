//! Selector flags: which group and which instance ids a command targets.

use cvd_shared::errors::{CvdError, CvdResult};

use super::argv::{Flag, split_list};
use crate::host::HostContext;
use crate::instances::IdRequest;
use crate::instances::types::{split_device_name, validate_group_name, validate_instance_name};

pub const GROUP_NAME: &str = "group_name";
pub const INSTANCE_NAME: &str = "instance_name";
pub const DEVICE_NAME: &str = "device_name";
pub const BASE_INSTANCE_NUM: &str = "base_instance_num";
pub const NUM_INSTANCES: &str = "num_instances";
pub const INSTANCE_NUMS: &str = "instance_nums";

/// Names of every selector flag.
pub const SELECTOR_FLAGS: [&str; 6] = [
    GROUP_NAME,
    INSTANCE_NAME,
    DEVICE_NAME,
    BASE_INSTANCE_NUM,
    NUM_INSTANCES,
    INSTANCE_NUMS,
];

pub fn is_selector_flag(name: &str) -> bool {
    SELECTOR_FLAGS.contains(&name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectorFlags {
    pub group_name: Option<String>,
    pub instance_names: Option<Vec<String>>,
    pub device_name: Option<String>,
    pub base_instance_num: Option<u32>,
    pub num_instances: Option<usize>,
    pub instance_nums: Option<Vec<u32>>,
}

impl SelectorFlags {
    /// Collect selector values from parsed flags, ignoring other flags.
    pub fn from_flags(flags: &[Flag]) -> CvdResult<Self> {
        let mut selector = SelectorFlags::default();
        for flag in flags {
            let parsed = match flag.name.as_str() {
                GROUP_NAME => SelectorFlags {
                    group_name: Some(flag.value.clone()),
                    ..Default::default()
                },
                INSTANCE_NAME => SelectorFlags {
                    instance_names: Some(split_list(&flag.value)),
                    ..Default::default()
                },
                DEVICE_NAME => SelectorFlags {
                    device_name: Some(flag.value.clone()),
                    ..Default::default()
                },
                BASE_INSTANCE_NUM => SelectorFlags {
                    base_instance_num: Some(parse_id(BASE_INSTANCE_NUM, &flag.value)?),
                    ..Default::default()
                },
                NUM_INSTANCES => SelectorFlags {
                    num_instances: Some(parse_count(&flag.value)?),
                    ..Default::default()
                },
                INSTANCE_NUMS => SelectorFlags {
                    instance_nums: Some(parse_instance_nums(&flag.value)?),
                    ..Default::default()
                },
                _ => continue,
            };
            selector = selector.merge(parsed)?;
        }
        Ok(selector)
    }

    /// Combine two sources; the same flag with different values conflicts.
    pub fn merge(self, other: SelectorFlags) -> CvdResult<Self> {
        Ok(SelectorFlags {
            group_name: merge_field(GROUP_NAME, self.group_name, other.group_name)?,
            instance_names: merge_field(INSTANCE_NAME, self.instance_names, other.instance_names)?,
            device_name: merge_field(DEVICE_NAME, self.device_name, other.device_name)?,
            base_instance_num: merge_field(
                BASE_INSTANCE_NUM,
                self.base_instance_num,
                other.base_instance_num,
            )?,
            num_instances: merge_field(NUM_INSTANCES, self.num_instances, other.num_instances)?,
            instance_nums: merge_field(INSTANCE_NUMS, self.instance_nums, other.instance_nums)?,
        })
    }

    /// Name checks and `--device_name` exclusivity.
    pub fn validate(&self) -> CvdResult<()> {
        if self.device_name.is_some() && (self.group_name.is_some() || self.instance_names.is_some())
        {
            return Err(CvdError::FlagConflict(
                "--device_name cannot be combined with --group_name or --instance_name".to_string(),
            ));
        }
        if let Some(device) = &self.device_name {
            split_device_name(device)?;
        }
        if let Some(group) = &self.group_name {
            validate_group_name(group)?;
        }
        if let Some(names) = &self.instance_names {
            for (i, name) in names.iter().enumerate() {
                validate_instance_name(name)?;
                if names[..i].contains(name) {
                    return Err(CvdError::FlagConflict(format!(
                        "instance name '{name}' is given twice"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Group name, from `--group_name` or the group part of `--device_name`.
    pub fn target_group(&self) -> CvdResult<Option<String>> {
        if let Some(device) = &self.device_name {
            return Ok(Some(split_device_name(device)?.0.to_string()));
        }
        Ok(self.group_name.clone())
    }

    /// Instance names, from `--instance_name` or `--device_name`.
    pub fn target_instance_names(&self) -> CvdResult<Option<Vec<String>>> {
        if let Some(device) = &self.device_name {
            return Ok(Some(vec![split_device_name(device)?.1.to_string()]));
        }
        Ok(self.instance_names.clone())
    }

    /// Number of instances to start.
    ///
    /// `--instance_nums` wins over `--num_instances`, which wins over the
    /// instance count of the environment specification (`spec_count`,
    /// zero when absent); every given source must agree.
    pub fn instance_count(&self, spec_count: usize) -> CvdResult<usize> {
        let count = match (&self.instance_nums, self.num_instances) {
            (Some(nums), Some(n)) if nums.len() != n => {
                return Err(CvdError::FlagConflict(format!(
                    "--num_instances={n} disagrees with {} --instance_nums",
                    nums.len()
                )));
            }
            (Some(nums), _) => nums.len(),
            (None, Some(n)) => n,
            (None, None) if spec_count > 0 => spec_count,
            (None, None) => self
                .target_instance_names()?
                .map(|names| names.len())
                .unwrap_or(1),
        };

        if spec_count > 0 && spec_count != count {
            return Err(CvdError::FlagConflict(format!(
                "the environment specification has {spec_count} instances but {count} were requested"
            )));
        }
        if let Some(names) = self.target_instance_names()?
            && names.len() != count
        {
            return Err(CvdError::FlagConflict(format!(
                "{} instance names given for {count} instances",
                names.len()
            )));
        }
        Ok(count)
    }

    /// Ids to allocate for `count` instances.
    ///
    /// Base id precedence: `--base_instance_num`, the smallest of
    /// `--instance_nums`, `CUTTLEFISH_INSTANCE`, the `vsoc-NN` user
    /// suffix. With none of them any free ids are taken, lowest first.
    pub fn id_request(&self, ctx: &HostContext, count: usize) -> CvdResult<IdRequest> {
        if let Some(nums) = &self.instance_nums {
            let smallest = nums.iter().copied().min().unwrap_or(0);
            if let Some(base) = self.base_instance_num
                && base != smallest
            {
                return Err(CvdError::FlagConflict(format!(
                    "--base_instance_num={base} disagrees with --instance_nums starting at {smallest}"
                )));
            }
            return Ok(IdRequest::Explicit(nums.clone()));
        }

        let base = match self.base_instance_num {
            Some(base) => Some(base),
            None => ctx.env_instance_id()?,
        };
        Ok(match base {
            Some(base) => IdRequest::Explicit(contiguous(base, count)?),
            None => IdRequest::Any { count },
        })
    }
}

fn contiguous(base: u32, count: usize) -> CvdResult<Vec<u32>> {
    let count = u32::try_from(count)
        .map_err(|_| CvdError::InvalidArgument(format!("too many instances: {count}")))?;
    let end = base
        .checked_add(count)
        .ok_or_else(|| CvdError::InvalidArgument("instance ids overflow".to_string()))?;
    Ok((base..end).collect())
}

fn merge_field<T: PartialEq + std::fmt::Debug>(
    name: &str,
    left: Option<T>,
    right: Option<T>,
) -> CvdResult<Option<T>> {
    match (left, right) {
        (Some(l), Some(r)) if l != r => Err(CvdError::FlagConflict(format!(
            "--{name} is given twice with different values ({l:?} and {r:?})"
        ))),
        (Some(l), _) => Ok(Some(l)),
        (None, r) => Ok(r),
    }
}

fn parse_id(flag: &str, value: &str) -> CvdResult<u32> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|id| *id >= 1)
        .ok_or_else(|| {
            CvdError::InvalidArgument(format!("--{flag} expects a positive integer, got '{value}'"))
        })
}

fn parse_count(value: &str) -> CvdResult<usize> {
    value
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n >= 1)
        .ok_or_else(|| {
            CvdError::InvalidArgument(format!(
                "--{NUM_INSTANCES} expects a positive integer, got '{value}'"
            ))
        })
}

fn parse_instance_nums(value: &str) -> CvdResult<Vec<u32>> {
    let mut nums = Vec::new();
    for item in split_list(value) {
        let id = parse_id(INSTANCE_NUMS, &item)?;
        if nums.contains(&id) {
            return Err(CvdError::InvalidArgument(format!(
                "--{INSTANCE_NUMS} lists {id} twice"
            )));
        }
        nums.push(id);
    }
    Ok(nums)
}
