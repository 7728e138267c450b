//! Group backend abstraction over the mounted tracking hierarchy.
//!
//! `root` is always the hierarchy's mount point and `group` an absolute
//! group path inside it (`/` is the hierarchy root itself).

use crate::config::types::Result;
use std::path::{Path, PathBuf};

pub trait GroupBackend: Send + Sync {
    fn backend_name(&self) -> &str;
    /// Register the program the kernel runs when a notifying group empties
    fn set_release_agent(&self, root: &Path, agent: &Path) -> Result<()>;
    fn exists(&self, root: &Path, group: &str) -> bool;
    /// Create one group level
    ///
    /// `GroupExists` when the level is already there, `GroupNotFound` naming
    /// the parent when the parent is missing.
    fn create(&self, root: &Path, group: &str) -> Result<()>;
    /// Remove one group level; `GroupNotFound` / `GroupNotEmpty` when applicable
    fn remove(&self, root: &Path, group: &str) -> Result<()>;
    /// Move `pid` (and its threads) into `group`
    fn attach(&self, root: &Path, group: &str, pid: u32) -> Result<()>;
    fn members(&self, root: &Path, group: &str) -> Result<Vec<u32>>;
    fn set_notify_on_release(&self, root: &Path, group: &str, enabled: bool) -> Result<()>;
}

/// Directory of `group` under the hierarchy mounted at `root`
pub fn group_dir(root: &Path, group: &str) -> PathBuf {
    let relative = group.trim_start_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Parent of `group`; top-level groups hang off `/`
pub fn parent_group(group: &str) -> &str {
    match group.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &group[..idx],
    }
}

/// Every group from the top-level ancestor down to `group` itself
///
/// `/vg/lv/snap` yields `/vg`, `/vg/lv`, `/vg/lv/snap`.
pub fn group_lineage(group: &str) -> Vec<String> {
    let mut lineage = Vec::new();
    let mut current = String::new();
    for component in group.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        lineage.push(current.clone());
    }
    lineage
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_dir() {
        let root = Path::new("/run/lvpeek/s/cgroup");
        assert_eq!(group_dir(root, "/"), PathBuf::from("/run/lvpeek/s/cgroup"));
        assert_eq!(
            group_dir(root, "/data/app/s"),
            PathBuf::from("/run/lvpeek/s/cgroup/data/app/s")
        );
    }

    #[test]
    fn test_group_lineage() {
        assert_eq!(
            group_lineage("/data/app/s"),
            vec!["/data", "/data/app", "/data/app/s"]
        );
        assert!(group_lineage("/").is_empty());
    }

    #[test]
    fn test_parent_group() {
        assert_eq!(parent_group("/data/app/s"), "/data/app");
        assert_eq!(parent_group("/data"), "/");
    }
}
