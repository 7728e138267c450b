//! Tracked-group lifecycle on top of a [`GroupBackend`] and a [`MountTable`].
//!
//! The hierarchy is only mounted while the tracker needs it. Group state is
//! kernel-resident, so unmounting right after joining leaves the group (and
//! the caller's membership) intact; teardown mounts it again in its own
//! namespace to remove the group.

use crate::config::types::{LvpeekError, Result};
use crate::kernel::cgroup::backend::{group_lineage, GroupBackend};
use crate::kernel::mount::MountTable;
use crate::safety::workspace::Workspace;
use std::path::{Path, PathBuf};

/// Lineage walks before a vanishing ancestor is reported as a failure
const LINEAGE_ATTEMPTS: usize = 3;

/// A mounted view of the tracking hierarchy
#[derive(Debug)]
pub struct HierarchyHandle {
    mount_point: PathBuf,
}

impl HierarchyHandle {
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

/// A group the calling process joined, with the levels it had to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedGroup {
    path: String,
    pid: u32,
    /// Creation order: top-level ancestor first, leaf last
    created: Vec<String>,
}

impl JoinedGroup {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn created(&self) -> &[String] {
        &self.created
    }
}

pub struct GroupTracker<'a> {
    mounts: &'a dyn MountTable,
    groups: &'a dyn GroupBackend,
    hierarchy_name: &'a str,
}

impl<'a> GroupTracker<'a> {
    pub fn new(
        mounts: &'a dyn MountTable,
        groups: &'a dyn GroupBackend,
        hierarchy_name: &'a str,
    ) -> Self {
        Self {
            mounts,
            groups,
            hierarchy_name,
        }
    }

    /// Mount the hierarchy in the workspace and register the release agent
    pub fn bind_hierarchy(&self, workspace: &Workspace, release_agent: &Path) -> Result<HierarchyHandle> {
        if !release_agent.is_absolute() {
            return Err(LvpeekError::Config(format!(
                "Release agent must be an absolute path: {}",
                release_agent.display()
            )));
        }

        let hierarchy = self.rebind_hierarchy(workspace)?;

        if let Err(e) = self
            .groups
            .set_release_agent(hierarchy.mount_point(), release_agent)
        {
            if let Err(unmount_err) = self.unbind_hierarchy(hierarchy) {
                log::warn!("Failed to unbind hierarchy after error: {}", unmount_err);
            }
            return Err(e);
        }

        log::info!(
            "Bound hierarchy name={} at {} (release agent {})",
            self.hierarchy_name,
            workspace.tracking_dir().display(),
            release_agent.display()
        );
        Ok(hierarchy)
    }

    /// Mount the hierarchy without touching the release agent
    pub fn rebind_hierarchy(&self, workspace: &Workspace) -> Result<HierarchyHandle> {
        let mount_point = workspace.tracking_dir();
        self.mounts
            .mount_group_hierarchy(self.hierarchy_name, &mount_point)?;
        Ok(HierarchyHandle { mount_point })
    }

    /// Handle for a hierarchy this process already has mounted in `workspace`
    pub fn mounted_hierarchy(&self, workspace: &Workspace) -> HierarchyHandle {
        HierarchyHandle {
            mount_point: workspace.tracking_dir(),
        }
    }

    /// Create every missing level of `group`, join it, and enable release notification
    ///
    /// On failure nothing this call created is left behind.
    pub fn create_and_join(&self, hierarchy: &HierarchyHandle, group: &str) -> Result<JoinedGroup> {
        self.create_and_join_pid(hierarchy, group, std::process::id())
    }

    pub fn create_and_join_pid(
        &self,
        hierarchy: &HierarchyHandle,
        group: &str,
        pid: u32,
    ) -> Result<JoinedGroup> {
        let root = hierarchy.mount_point();
        let lineage = group_lineage(group);
        let leaf = match lineage.last() {
            Some(leaf) => leaf.clone(),
            None => {
                return Err(LvpeekError::GroupCreateFailed(format!(
                    "refusing to join the hierarchy root ({:?})",
                    group
                )))
            }
        };

        let created = self.create_lineage(root, &lineage)?;

        if let Err(e) = self.groups.attach(root, &leaf, pid) {
            self.remove_created(root, &created);
            return Err(LvpeekError::GroupCreateFailed(format!(
                "join {} as {}: {}",
                leaf, pid, e
            )));
        }

        if let Err(e) = self.groups.set_notify_on_release(root, &leaf, true) {
            self.leave(root, pid);
            self.remove_created(root, &created);
            return Err(LvpeekError::GroupCreateFailed(format!(
                "notify_on_release for {}: {}",
                leaf, e
            )));
        }

        log::info!("Process {} joined tracked group {}", pid, leaf);
        Ok(JoinedGroup {
            path: leaf,
            pid,
            created,
        })
    }

    /// Create `lineage` top-down, returning the levels this call created
    ///
    /// Ancestors are shared with other lifecycles of the same volume group,
    /// which may create or remove them concurrently. Every level is created
    /// outright; an ancestor that already exists belongs to someone else, and
    /// a parent that disappears mid-walk restarts the walk.
    fn create_lineage(&self, root: &Path, lineage: &[String]) -> Result<Vec<String>> {
        let mut created = Vec::new();
        let mut attempt = 1;
        let mut index = 0;

        while let Some(level) = lineage.get(index) {
            let is_leaf = index + 1 == lineage.len();
            match self.groups.create(root, level) {
                Ok(()) => created.push(level.clone()),
                Err(LvpeekError::GroupExists(_)) if !is_leaf => {}
                Err(LvpeekError::GroupNotFound(parent)) if attempt < LINEAGE_ATTEMPTS => {
                    log::debug!(
                        "Parent {} of {} vanished, retrying (attempt {})",
                        parent,
                        level,
                        attempt
                    );
                    attempt += 1;
                    index = 0;
                    continue;
                }
                Err(e) => {
                    self.remove_created(root, &created);
                    return Err(LvpeekError::GroupCreateFailed(format!("{}: {}", level, e)));
                }
            }
            index += 1;
        }

        Ok(created)
    }

    pub fn unbind_hierarchy(&self, hierarchy: HierarchyHandle) -> Result<()> {
        self.mounts.unmount(hierarchy.mount_point())?;
        log::debug!("Unbound hierarchy at {}", hierarchy.mount_point().display());
        Ok(())
    }

    /// Remove the leaf group once it is empty
    ///
    /// Returns `GroupNotFound` when already gone; callers doing teardown treat
    /// that as success. Members are never killed.
    pub fn remove_group(&self, hierarchy: &HierarchyHandle, group: &str) -> Result<()> {
        let root = hierarchy.mount_point();
        if !self.groups.exists(root, group) {
            return Err(LvpeekError::GroupNotFound(group.to_string()));
        }

        match self.groups.members(root, group) {
            Ok(members) if !members.is_empty() => {
                return Err(LvpeekError::GroupNotEmpty(format!(
                    "{} (members: {:?})",
                    group, members
                )));
            }
            Ok(_) => {}
            Err(e) if e.is_already_clean() => return Err(e),
            Err(e) => log::debug!("Could not list members of {}: {}", group, e),
        }

        self.groups.remove(root, group)?;
        log::info!("Removed tracked group {}", group);
        Ok(())
    }

    /// Undo a join performed by this very process during setup
    ///
    /// Notification is switched off first so that leaving does not make the
    /// kernel spawn a teardown racing with this one.
    pub fn dismantle(&self, hierarchy: &HierarchyHandle, joined: &JoinedGroup) -> Result<()> {
        let root = hierarchy.mount_point();

        if let Err(e) = self
            .groups
            .set_notify_on_release(root, joined.path(), false)
        {
            log::warn!("Failed to disable notify_on_release on {}: {}", joined.path(), e);
        }
        self.groups.attach(root, "/", joined.pid())?;

        for level in joined.created().iter().rev() {
            match self.groups.remove(root, level) {
                Ok(()) => log::debug!("Removed group {}", level),
                Err(LvpeekError::GroupNotFound(_)) => {}
                Err(e) if level == joined.path() => return Err(e),
                // Another lifecycle may be using a shared ancestor
                Err(e) => log::debug!("Leaving ancestor group {}: {}", level, e),
            }
        }

        log::info!("Dismantled tracked group {}", joined.path());
        Ok(())
    }

    fn leave(&self, root: &Path, pid: u32) {
        if let Err(e) = self.groups.attach(root, "/", pid) {
            log::warn!("Failed to move {} back to the hierarchy root: {}", pid, e);
        }
    }

    fn remove_created(&self, root: &Path, created: &[String]) {
        for level in created.iter().rev() {
            match self.groups.remove(root, level) {
                Ok(()) => {}
                // A sibling lifecycle moved into an ancestor meanwhile
                Err(e @ LvpeekError::GroupNotEmpty(_)) => {
                    log::debug!("Leaving partially created group {}: {}", level, e)
                }
                Err(e) => log::warn!("Failed to remove partially created group {}: {}", level, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::workspace::WorkspaceAllocator;
    use crate::testing::fakes::{FakeMountTable, MemoryGroupBackend};
    use std::sync::Mutex;

    fn setup() -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        let workspace = WorkspaceAllocator::new(dir.path())
            .allocate("lvpeek-test")
            .unwrap();
        (dir, workspace)
    }

    #[test]
    fn test_bind_registers_absolute_agent() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");

        let hierarchy = tracker
            .bind_hierarchy(&workspace, Path::new("/usr/bin/lvpeek-release-agent"))
            .unwrap();
        assert!(mounts.is_mounted(&workspace.tracking_dir()));
        assert_eq!(
            groups.release_agent(),
            Some(PathBuf::from("/usr/bin/lvpeek-release-agent"))
        );

        tracker.unbind_hierarchy(hierarchy).unwrap();
        assert!(!mounts.is_mounted(&workspace.tracking_dir()));
    }

    #[test]
    fn test_bind_rejects_relative_agent() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");

        assert!(tracker
            .bind_hierarchy(&workspace, Path::new("lvpeek-release-agent"))
            .is_err());
        assert!(mounts.calls().is_empty());
    }

    #[test]
    fn test_join_creates_lineage_and_survives_unbind() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");

        let hierarchy = tracker
            .bind_hierarchy(&workspace, Path::new("/agent"))
            .unwrap();
        let joined = tracker
            .create_and_join_pid(&hierarchy, "/data/app/s1", 100)
            .unwrap();
        tracker.unbind_hierarchy(hierarchy).unwrap();

        assert_eq!(joined.created(), ["/data", "/data/app", "/data/app/s1"]);
        assert_eq!(groups.members_of("/data/app/s1"), vec![100]);
        assert!(groups.notify_enabled("/data/app/s1"));
    }

    #[test]
    fn test_join_reuses_existing_ancestors() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        tracker
            .create_and_join_pid(&hierarchy, "/data/app/s1", 100)
            .unwrap();
        let second = tracker
            .create_and_join_pid(&hierarchy, "/data/app/s2", 200)
            .unwrap();
        assert_eq!(second.created(), ["/data/app/s2"]);
    }

    #[test]
    fn test_create_and_join_uses_calling_process() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        let joined = tracker.create_and_join(&hierarchy, "/data/app/s1").unwrap();
        assert_eq!(joined.pid(), std::process::id());
        assert_eq!(groups.members_of("/data/app/s1"), vec![std::process::id()]);
    }

    /// Runs `sibling` against the shared groups just before `trigger` is created
    struct Interleaved<'a> {
        groups: &'a MemoryGroupBackend,
        trigger: &'a str,
        sibling: Mutex<Option<Box<dyn FnOnce(&MemoryGroupBackend) + Send + 'a>>>,
    }

    impl<'a> Interleaved<'a> {
        fn new(
            groups: &'a MemoryGroupBackend,
            trigger: &'a str,
            sibling: impl FnOnce(&MemoryGroupBackend) + Send + 'a,
        ) -> Self {
            Self {
                groups,
                trigger,
                sibling: Mutex::new(Some(Box::new(sibling))),
            }
        }
    }

    impl GroupBackend for Interleaved<'_> {
        fn backend_name(&self) -> &str {
            "interleaved"
        }
        fn set_release_agent(&self, root: &Path, agent: &Path) -> Result<()> {
            self.groups.set_release_agent(root, agent)
        }
        fn exists(&self, root: &Path, group: &str) -> bool {
            self.groups.exists(root, group)
        }
        fn create(&self, root: &Path, group: &str) -> Result<()> {
            if group == self.trigger {
                if let Some(sibling) = self.sibling.lock().unwrap().take() {
                    sibling(self.groups);
                }
            }
            self.groups.create(root, group)
        }
        fn remove(&self, root: &Path, group: &str) -> Result<()> {
            self.groups.remove(root, group)
        }
        fn attach(&self, root: &Path, group: &str, pid: u32) -> Result<()> {
            self.groups.attach(root, group, pid)
        }
        fn members(&self, root: &Path, group: &str) -> Result<Vec<u32>> {
            self.groups.members(root, group)
        }
        fn set_notify_on_release(&self, root: &Path, group: &str, enabled: bool) -> Result<()> {
            self.groups.set_notify_on_release(root, group, enabled)
        }
    }

    #[test]
    fn test_join_tolerates_sibling_creating_shared_ancestor() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let root = workspace.tracking_dir();
        let racing = Interleaved::new(&groups, "/data", |shared| {
            shared.create(&root, "/data").unwrap();
        });
        let tracker = GroupTracker::new(&mounts, &racing, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        let joined = tracker
            .create_and_join_pid(&hierarchy, "/data/app/s1", 1)
            .unwrap();
        assert_eq!(joined.created(), ["/data/app", "/data/app/s1"]);

        // Unwinding leaves the ancestor this lifecycle did not create
        tracker.dismantle(&hierarchy, &joined).unwrap();
        assert_eq!(groups.groups(), vec!["/data"]);
    }

    #[test]
    fn test_join_retries_when_sibling_removes_ancestor() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let root = workspace.tracking_dir();
        groups.create(&root, "/data").unwrap();
        groups.create(&root, "/data/app").unwrap();

        // The sibling that made /data/app unwinds just before our leaf mkdir
        let racing = Interleaved::new(&groups, "/data/app/s1", |shared| {
            shared.remove(&root, "/data/app").unwrap();
            shared.remove(&root, "/data").unwrap();
        });
        let tracker = GroupTracker::new(&mounts, &racing, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        let joined = tracker
            .create_and_join_pid(&hierarchy, "/data/app/s1", 1)
            .unwrap();
        assert_eq!(joined.created(), ["/data", "/data/app", "/data/app/s1"]);
        assert_eq!(groups.members_of("/data/app/s1"), vec![1]);
    }

    #[test]
    fn test_dismantle_keeps_ancestor_holding_sibling() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        let first = tracker
            .create_and_join_pid(&hierarchy, "/data/app/s1", 1)
            .unwrap();
        let sibling = tracker
            .create_and_join_pid(&hierarchy, "/data/web/s2", 2)
            .unwrap();
        assert_eq!(first.created(), ["/data", "/data/app", "/data/app/s1"]);

        tracker.dismantle(&hierarchy, &first).unwrap();
        assert_eq!(groups.groups(), vec!["/data", "/data/web", "/data/web/s2"]);
        assert_eq!(groups.members_of(sibling.path()), vec![2]);
    }

    #[test]
    fn test_join_existing_leaf_fails() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        tracker.create_and_join_pid(&hierarchy, "/a/b/c", 1).unwrap();
        assert!(matches!(
            tracker.create_and_join_pid(&hierarchy, "/a/b/c", 2),
            Err(LvpeekError::GroupCreateFailed(_))
        ));
    }

    #[test]
    fn test_failed_join_unwinds_created_levels() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        groups.fail_notify(true);
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        let result = tracker.create_and_join_pid(&hierarchy, "/data/app/s1", 100);
        assert!(matches!(result, Err(LvpeekError::GroupCreateFailed(_))));
        assert!(groups.groups().is_empty());
        assert_eq!(groups.members_of("/"), vec![100]);
    }

    #[test]
    fn test_remove_group_states() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        tracker.create_and_join_pid(&hierarchy, "/v/l/s", 7).unwrap();
        assert!(matches!(
            tracker.remove_group(&hierarchy, "/v/l/s"),
            Err(LvpeekError::GroupNotEmpty(_))
        ));

        groups.drain("/v/l/s");
        tracker.remove_group(&hierarchy, "/v/l/s").unwrap();
        assert!(matches!(
            tracker.remove_group(&hierarchy, "/v/l/s"),
            Err(LvpeekError::GroupNotFound(_))
        ));
    }

    #[test]
    fn test_dismantle_disables_notify_and_leaves() {
        let (_dir, workspace) = setup();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");
        let hierarchy = tracker.rebind_hierarchy(&workspace).unwrap();

        let joined = tracker
            .create_and_join_pid(&hierarchy, "/v/l/s", 7)
            .unwrap();
        tracker.dismantle(&hierarchy, &joined).unwrap();

        assert!(groups.groups().is_empty());
        assert_eq!(groups.members_of("/"), vec![7]);
        assert_eq!(groups.releases_fired(), 0);
    }
}
