/// Private mount namespace for one lifecycle process tree
///
/// Hierarchy and snapshot mounts made after isolation stay invisible to the
/// rest of the system and disappear with the last process in the namespace.
use crate::config::types::{LvpeekError, Result};

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};

/// Check if mount namespaces are available to this process
pub fn is_supported() -> bool {
    std::path::Path::new("/proc/self/ns/mnt").exists()
}

/// Detach the calling process's mount table from the rest of the system
///
/// Irreversible for the lifetime of the process. Must run before any mount.
pub fn isolate_mount_namespace() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNS).map_err(|e| {
        LvpeekError::Namespace(format!("Failed to unshare mount namespace: {}", e))
    })?;

    harden_mount_propagation()?;

    log::info!("Entered private mount namespace");
    Ok(())
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL)
///
/// Without this, shared propagation on `/` (the systemd default) would leak
/// our mounts back to the host despite the new namespace.
pub fn harden_mount_propagation() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .map_err(|e| {
        LvpeekError::Namespace(format!(
            "Failed to make mount propagation private (MS_PRIVATE|MS_REC on /): {}",
            e
        ))
    })?;

    log::debug!("Mount propagation hardened: / set to MS_PRIVATE|MS_REC");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_supported_does_not_panic() {
        let _ = is_supported();
    }
}
