//! Mount specifications.
//!
//! A [`MountSpec`] is an ordered list of mounts which, applied to an empty
//! directory, materialize a writable view of a snapshot.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use crate::error::{DiffError, Result};

/// A single mount instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Filesystem type (e.g., "bind", "overlay", "tmpfs")
    #[serde(rename = "type")]
    pub mount_type: String,

    /// Mount source (device, directory, or pseudo-source such as "overlay")
    pub source: String,

    /// Path relative to the mount root; `None` mounts onto the root itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Mount options (e.g., "rbind", "ro", "lowerdir=...")
    #[serde(default)]
    pub options: Vec<String>,
}

impl Mount {
    pub fn new(mount_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            mount_type: mount_type.into(),
            source: source.into(),
            target: None,
            options: Vec::new(),
        }
    }

    /// Convenience constructor for a recursive read-write bind mount.
    pub fn bind(source: impl AsRef<Path>) -> Self {
        Self {
            mount_type: "bind".to_string(),
            source: source.as_ref().display().to_string(),
            target: None,
            options: vec!["rbind".to_string(), "rw".to_string()],
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Resolve where this mount lands beneath `root`.
    ///
    /// Rejects targets that would escape the root.
    pub fn mount_point(&self, root: &Path) -> Result<PathBuf> {
        let Some(target) = &self.target else {
            return Ok(root.to_path_buf());
        };

        let mut path = root.to_path_buf();
        for component in Path::new(target).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir | Component::RootDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(DiffError::MountError(format!(
                        "mount target '{}' escapes the mount root",
                        target
                    )));
                }
            }
        }
        Ok(path)
    }
}

/// Parses `type=bind,source=/x,target=sub,options=rbind,ro`.
///
/// `options=` must come last: everything after it is the comma-separated
/// option list, so mount data such as `lowerdir=/l2:/l1` passes through
/// untouched.
impl FromStr for Mount {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self> {
        let (fields, tail) = match s.strip_prefix("options=") {
            Some(tail) => ("", Some(tail)),
            None => match s.split_once(",options=") {
                Some((fields, tail)) => (fields, Some(tail)),
                None => (s, None),
            },
        };

        let mut mount_type = None;
        let mut source = None;
        let mut target = None;

        for field in fields.split(',').filter(|f| !f.is_empty()) {
            let (key, value) = field.split_once('=').ok_or_else(|| {
                DiffError::MountError(format!(
                    "invalid mount field '{}' (expected key=value)",
                    field
                ))
            })?;
            match key {
                "type" => mount_type = Some(value.to_string()),
                "source" | "src" => source = Some(value.to_string()),
                "target" | "dst" => target = Some(value.to_string()),
                other => {
                    return Err(DiffError::MountError(format!(
                        "unknown mount field '{}'",
                        other
                    )))
                }
            }
        }

        let options = tail
            .map(|t| {
                t.split(',')
                    .filter(|o| !o.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            mount_type: mount_type
                .ok_or_else(|| DiffError::MountError(format!("mount '{}' has no type", s)))?,
            source: source
                .ok_or_else(|| DiffError::MountError(format!("mount '{}' has no source", s)))?,
            target,
            options,
        })
    }
}

/// Ordered mounts materializing one writable filesystem view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MountSpec(Vec<Mount>);

impl MountSpec {
    pub fn new(mounts: Vec<Mount>) -> Self {
        Self(mounts)
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<Mount>> for MountSpec {
    fn from(mounts: Vec<Mount>) -> Self {
        Self(mounts)
    }
}
