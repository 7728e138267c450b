/// Setup unwind stack
///
/// Every setup step records what it created immediately after creating it.
/// On any later failure the stack is unwound in reverse creation order, best
/// effort, so that no tracked group, snapshot, mount, or workspace outlives a
/// failed setup.
use crate::config::types::{LvpeekError, Result};
use crate::kernel::cgroup::{GroupBackend, GroupTracker, JoinedGroup};
use crate::kernel::mount::MountTable;
use crate::safety::workspace::Workspace;
use crate::volume::VolumeManager;
use log::{debug, info, warn};
use std::path::PathBuf;

/// Resources created by setup, in the order they are created
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupResource {
    Workspace(Workspace),
    HierarchyMount(PathBuf),
    TrackedGroup(JoinedGroup),
    Snapshot { volume_group: String, name: String },
    VolumeMount(PathBuf),
}

impl SetupResource {
    fn describe(&self) -> String {
        match self {
            Self::Workspace(ws) => format!("workspace {}", ws.dir().display()),
            Self::HierarchyMount(path) => format!("hierarchy mount {}", path.display()),
            Self::TrackedGroup(group) => format!("tracked group {}", group.path()),
            Self::Snapshot { volume_group, name } => format!("snapshot {}/{}", volume_group, name),
            Self::VolumeMount(path) => format!("volume mount {}", path.display()),
        }
    }
}

/// Collaborators needed to undo setup steps
pub struct UnwindContext<'a> {
    pub mounts: &'a dyn MountTable,
    pub groups: &'a dyn GroupBackend,
    pub volumes: &'a dyn VolumeManager,
    pub hierarchy_name: &'a str,
}

#[derive(Debug, Default)]
pub struct UnwindStack {
    entries: Vec<SetupResource>,
}

impl UnwindStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called immediately after the resource was created
    pub fn record(&mut self, resource: SetupResource) {
        debug!("Recording {}", resource.describe());
        self.entries.push(resource);
    }

    /// Drop an entry that a later step released on its own
    pub fn forget(&mut self, resource: &SetupResource) {
        self.entries.retain(|entry| entry != resource);
    }

    pub fn entries(&self) -> &[SetupResource] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn workspace(&self) -> Option<&Workspace> {
        self.entries.iter().find_map(|entry| match entry {
            SetupResource::Workspace(ws) => Some(ws),
            _ => None,
        })
    }

    /// Undo everything recorded, newest first
    ///
    /// Each entry is attempted regardless of earlier failures; the failures
    /// are returned together.
    pub fn unwind(&mut self, ctx: &UnwindContext<'_>) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        info!("Unwinding {} setup steps", self.entries.len());

        let workspace = self.workspace().cloned();
        let mut failures = Vec::new();

        while let Some(entry) = self.entries.pop() {
            let hierarchy_mounted = self
                .entries
                .iter()
                .any(|e| matches!(e, SetupResource::HierarchyMount(_)));

            match Self::undo(&entry, ctx, workspace.as_ref(), hierarchy_mounted) {
                Ok(()) => debug!("Undid {}", entry.describe()),
                Err(e) => {
                    let msg = format!("{}: {}", entry.describe(), e);
                    warn!("Failed to undo {}", msg);
                    failures.push(msg);
                }
            }
        }

        if failures.is_empty() {
            info!("Setup unwound cleanly");
            Ok(())
        } else {
            Err(LvpeekError::TeardownIncomplete {
                snapshot: workspace
                    .map(|ws| ws.name().to_string())
                    .unwrap_or_else(|| "<none>".to_string()),
                failures,
            })
        }
    }

    fn undo(
        entry: &SetupResource,
        ctx: &UnwindContext<'_>,
        workspace: Option<&Workspace>,
        hierarchy_mounted: bool,
    ) -> Result<()> {
        match entry {
            SetupResource::VolumeMount(path) | SetupResource::HierarchyMount(path) => {
                ctx.mounts.unmount(path).map(|_| ())
            }
            SetupResource::Snapshot { volume_group, name } => {
                ctx.volumes.remove_snapshot(volume_group, name)
            }
            SetupResource::TrackedGroup(joined) => {
                let workspace = workspace.ok_or_else(|| {
                    LvpeekError::Config("tracked group recorded without a workspace".to_string())
                })?;
                let tracker = GroupTracker::new(ctx.mounts, ctx.groups, ctx.hierarchy_name);

                if hierarchy_mounted {
                    let hierarchy = tracker.mounted_hierarchy(workspace);
                    return tracker.dismantle(&hierarchy, joined);
                }

                let hierarchy = tracker.rebind_hierarchy(workspace)?;
                let result = tracker.dismantle(&hierarchy, joined);
                if let Err(e) = tracker.unbind_hierarchy(hierarchy) {
                    warn!("Failed to unbind hierarchy after unwinding group: {}", e);
                }
                result
            }
            SetupResource::Workspace(ws) => ws.release(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::workspace::WorkspaceAllocator;
    use crate::testing::fakes::{FakeMountTable, FakeVolumeManager, MemoryGroupBackend};
    use std::path::Path;

    #[test]
    fn test_record_and_forget() {
        let mut stack = UnwindStack::new();
        assert!(stack.is_empty());

        let mount = SetupResource::HierarchyMount(PathBuf::from("/run/lvpeek/s/cgroup"));
        stack.record(mount.clone());
        stack.record(SetupResource::VolumeMount(PathBuf::from("/run/lvpeek/s/volume")));
        stack.forget(&mount);

        assert_eq!(stack.entries().len(), 1);
    }

    #[test]
    fn test_unwind_reverses_everything() {
        let root = tempfile::tempdir().unwrap();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let volumes = FakeVolumeManager::new();
        volumes.add_volume("data", "app");

        let workspace = WorkspaceAllocator::new(root.path()).allocate("snap").unwrap();
        let mut stack = UnwindStack::new();
        stack.record(SetupResource::Workspace(workspace.clone()));

        let tracker = GroupTracker::new(&mounts, &groups, "lvpeek");
        let hierarchy = tracker
            .bind_hierarchy(&workspace, Path::new("/agent"))
            .unwrap();
        let joined = tracker
            .create_and_join_pid(&hierarchy, "/data/app/snap", 11)
            .unwrap();
        stack.record(SetupResource::TrackedGroup(joined));
        tracker.unbind_hierarchy(hierarchy).unwrap();

        volumes.create_snapshot("data", "app", "snap", 8).unwrap();
        stack.record(SetupResource::Snapshot {
            volume_group: "data".to_string(),
            name: "snap".to_string(),
        });

        let ctx = UnwindContext {
            mounts: &mounts,
            groups: &groups,
            volumes: &volumes,
            hierarchy_name: "lvpeek",
        };
        stack.unwind(&ctx).unwrap();

        assert!(stack.is_empty());
        assert!(!volumes.snapshot_exists("data", "snap").unwrap());
        assert!(groups.groups().is_empty());
        assert!(!workspace.exists());
        assert!(mounts.mounted().is_empty());
    }

    #[test]
    fn test_unwind_attempts_every_entry() {
        let root = tempfile::tempdir().unwrap();
        let mounts = FakeMountTable::new();
        let groups = MemoryGroupBackend::new();
        let volumes = FakeVolumeManager::new();

        let workspace = WorkspaceAllocator::new(root.path()).allocate("snap").unwrap();
        let mut stack = UnwindStack::new();
        stack.record(SetupResource::Workspace(workspace.clone()));
        // Never created, so removal fails
        stack.record(SetupResource::Snapshot {
            volume_group: "data".to_string(),
            name: "snap".to_string(),
        });

        let ctx = UnwindContext {
            mounts: &mounts,
            groups: &groups,
            volumes: &volumes,
            hierarchy_name: "lvpeek",
        };
        let err = stack.unwind(&ctx).unwrap_err();
        assert!(err.to_string().contains("snapshot data/snap"));
        assert!(!workspace.exists());
    }
}
