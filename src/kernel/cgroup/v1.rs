//! Named cgroup v1 hierarchy used purely for membership tracking.
//!
//! No controllers are attached (`none,name=<hierarchy>`); only `cgroup.procs`,
//! `notify_on_release` and the root `release_agent` file matter.

use crate::config::types::{LvpeekError, Result};
use crate::kernel::cgroup::backend::{group_dir, parent_group, GroupBackend};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

#[derive(Debug, Default, Clone, Copy)]
pub struct CgroupV1;

impl CgroupV1 {
    pub fn new() -> Self {
        Self
    }

    fn write_control(root: &Path, group: &str, file: &str, value: &str) -> Result<()> {
        let path = group_dir(root, group).join(file);
        fs::write(&path, value).map_err(|e| {
            LvpeekError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to write {:?} to {}: {}", value, path.display(), e),
            ))
        })
    }
}

impl GroupBackend for CgroupV1 {
    fn backend_name(&self) -> &str {
        "cgroup-v1"
    }

    fn set_release_agent(&self, root: &Path, agent: &Path) -> Result<()> {
        Self::write_control(root, "/", "release_agent", &agent.to_string_lossy())?;
        log::debug!("Registered release agent {}", agent.display());
        Ok(())
    }

    fn exists(&self, root: &Path, group: &str) -> bool {
        group_dir(root, group).is_dir()
    }

    fn create(&self, root: &Path, group: &str) -> Result<()> {
        let path = group_dir(root, group);
        match fs::create_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(LvpeekError::GroupExists(group.to_string()))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(LvpeekError::GroupNotFound(parent_group(group).to_string()))
            }
            Err(e) => Err(LvpeekError::GroupCreateFailed(format!(
                "mkdir {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn remove(&self, root: &Path, group: &str) -> Result<()> {
        let path = group_dir(root, group);
        match fs::remove_dir(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(LvpeekError::GroupNotFound(group.to_string()))
            }
            // The kernel answers EBUSY for a cgroup with members or children
            Err(e)
                if e.raw_os_error() == Some(libc::EBUSY)
                    || e.raw_os_error() == Some(libc::ENOTEMPTY) =>
            {
                Err(LvpeekError::GroupNotEmpty(group.to_string()))
            }
            Err(e) => Err(LvpeekError::Io(std::io::Error::new(
                e.kind(),
                format!("rmdir {}: {}", path.display(), e),
            ))),
        }
    }

    fn attach(&self, root: &Path, group: &str, pid: u32) -> Result<()> {
        Self::write_control(root, group, "cgroup.procs", &pid.to_string())
    }

    fn members(&self, root: &Path, group: &str) -> Result<Vec<u32>> {
        let path = group_dir(root, group).join("cgroup.procs");
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LvpeekError::GroupNotFound(group.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect())
    }

    fn set_notify_on_release(&self, root: &Path, group: &str, enabled: bool) -> Result<()> {
        Self::write_control(root, group, "notify_on_release", if enabled { "1" } else { "0" })
    }
}
