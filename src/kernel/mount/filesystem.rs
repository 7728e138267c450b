/// Mount operations used by the lifecycle
use crate::config::types::{LvpeekError, Result};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::Path;

/// What an unmount request found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountOutcome {
    Unmounted,
    NotMounted,
}

/// The process's view of the mount table
pub trait MountTable: Send + Sync {
    /// Move the calling process into a private mount namespace
    fn isolate_namespace(&self) -> Result<()>;
    /// Mount the named group-tracking hierarchy at `target`
    fn mount_group_hierarchy(&self, hierarchy_name: &str, target: &Path) -> Result<()>;
    /// Mount a block device read-only, probing the type when `fstype` is None
    fn mount_readonly(&self, device: &Path, target: &Path, fstype: Option<&str>) -> Result<()>;
    /// Unmount `target`; a target that is not mounted is not an error
    fn unmount(&self, target: &Path) -> Result<UnmountOutcome>;
}

/// Mount table backed by the real kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMountTable;

impl SystemMountTable {
    pub fn new() -> Self {
        Self
    }

    /// Block filesystems the kernel knows, in registration order
    fn candidate_filesystems() -> Result<Vec<String>> {
        let content = fs::read_to_string("/proc/filesystems").map_err(|e| {
            LvpeekError::MountFailed(format!("Failed to read /proc/filesystems: {}", e))
        })?;
        Ok(parse_block_filesystems(&content))
    }
}

/// Entries of /proc/filesystems that are not flagged `nodev`
pub fn parse_block_filesystems(content: &str) -> Vec<String> {
    content
        .lines()
        .filter(|line| !line.trim_start().is_empty() && !line.starts_with("nodev"))
        .map(|line| line.trim().to_string())
        .collect()
}

impl MountTable for SystemMountTable {
    fn isolate_namespace(&self) -> Result<()> {
        crate::kernel::namespace::isolate_mount_namespace()
    }

    fn mount_group_hierarchy(&self, hierarchy_name: &str, target: &Path) -> Result<()> {
        let options = format!("none,name={}", hierarchy_name);
        mount(
            Some("cgroup"),
            target,
            Some("cgroup"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
            Some(options.as_str()),
        )
        .map_err(|e| {
            LvpeekError::MountFailed(format!(
                "cgroup hierarchy {} at {}: {}",
                options,
                target.display(),
                e
            ))
        })?;

        log::debug!("Mounted cgroup hierarchy {} at {}", options, target.display());
        Ok(())
    }

    fn mount_readonly(&self, device: &Path, target: &Path, fstype: Option<&str>) -> Result<()> {
        let flags = MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;

        let candidates = match fstype {
            Some(fstype) => vec![fstype.to_string()],
            None => Self::candidate_filesystems()?,
        };

        let mut errors = Vec::new();
        for candidate in &candidates {
            match mount(
                Some(device),
                target,
                Some(candidate.as_str()),
                flags,
                None::<&str>,
            ) {
                Ok(()) => {
                    log::info!(
                        "Mounted {} read-only at {} ({})",
                        device.display(),
                        target.display(),
                        candidate
                    );
                    return Ok(());
                }
                Err(e) => errors.push(format!("{}: {}", candidate, e)),
            }
        }

        Err(LvpeekError::MountFailed(format!(
            "{} at {}: {}",
            device.display(),
            target.display(),
            if errors.is_empty() {
                "no block filesystem types available".to_string()
            } else {
                errors.join(", ")
            }
        )))
    }

    fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => {
                log::debug!("Unmounted {}", target.display());
                Ok(UnmountOutcome::Unmounted)
            }
            // EINVAL: not a mount point; ENOENT: path already gone
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                log::debug!("{} was not mounted", target.display());
                Ok(UnmountOutcome::NotMounted)
            }
            Err(e) => Err(LvpeekError::UnmountFailed(format!(
                "{}: {}",
                target.display(),
                e
            ))),
        }
    }
}
