/// In-memory stand-ins for the kernel and LVM seams
///
/// Group state lives in the backend rather than under a mount point, the way
/// cgroup state is kernel-resident: every mount of the same named hierarchy
/// sees the same groups.
use crate::config::types::{LvpeekError, Result};
use crate::kernel::cgroup::backend::{parent_group, GroupBackend};
use crate::kernel::mount::{MountTable, UnmountOutcome};
use crate::volume::VolumeManager;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not hide the state from the others
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct MountState {
    mounted: BTreeSet<PathBuf>,
    calls: Vec<String>,
    isolations: usize,
    fail_volume_mount: bool,
}

/// Mount table recording every call
#[derive(Debug, Default)]
pub struct FakeMountTable {
    state: Mutex<MountState>,
}

impl FakeMountTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls in order, e.g. `mount-hierarchy lvpeek /run/lvpeek/s/cgroup`
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        lock(&self.state).mounted.iter().cloned().collect()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        lock(&self.state).mounted.contains(target)
    }

    pub fn isolations(&self) -> usize {
        lock(&self.state).isolations
    }

    pub fn fail_volume_mount(&self, fail: bool) {
        lock(&self.state).fail_volume_mount = fail;
    }

    fn mount_at(state: &mut MountState, target: &Path) -> Result<()> {
        if !state.mounted.insert(target.to_path_buf()) {
            return Err(LvpeekError::MountFailed(format!(
                "{} is already a mount point",
                target.display()
            )));
        }
        Ok(())
    }
}

impl MountTable for FakeMountTable {
    fn isolate_namespace(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.isolations += 1;
        state.calls.push("isolate".to_string());
        Ok(())
    }

    fn mount_group_hierarchy(&self, hierarchy_name: &str, target: &Path) -> Result<()> {
        let mut state = lock(&self.state);
        state
            .calls
            .push(format!("mount-hierarchy {} {}", hierarchy_name, target.display()));
        Self::mount_at(&mut state, target)
    }

    fn mount_readonly(&self, device: &Path, target: &Path, fstype: Option<&str>) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(format!(
            "mount-ro {} {} {}",
            device.display(),
            target.display(),
            fstype.unwrap_or("auto")
        ));
        if state.fail_volume_mount {
            return Err(LvpeekError::MountFailed(format!(
                "{}: injected failure",
                device.display()
            )));
        }
        Self::mount_at(&mut state, target)
    }

    fn unmount(&self, target: &Path) -> Result<UnmountOutcome> {
        let mut state = lock(&self.state);
        state.calls.push(format!("unmount {}", target.display()));
        if state.mounted.remove(target) {
            Ok(UnmountOutcome::Unmounted)
        } else {
            Ok(UnmountOutcome::NotMounted)
        }
    }

}

#[derive(Debug, Default)]
struct GroupState {
    release_agent: Option<PathBuf>,
    /// Non-root groups and their notify_on_release flag
    groups: BTreeMap<String, bool>,
    /// pid -> group; pids never attached are not tracked at all
    membership: BTreeMap<u32, String>,
    releases: Vec<String>,
    fail_notify: bool,
}

impl GroupState {
    fn known(&self, group: &str) -> bool {
        group == "/" || self.groups.contains_key(group)
    }

    fn has_children(&self, group: &str) -> bool {
        let prefix = format!("{}/", group);
        self.groups.keys().any(|g| g.starts_with(&prefix))
    }

    fn is_empty(&self, group: &str) -> bool {
        !self.membership.values().any(|g| g == group) && !self.has_children(group)
    }

    /// Fire the release notification the kernel would send
    fn check_release(&mut self, group: &str) {
        if group == "/" {
            return;
        }
        if self.groups.get(group).copied().unwrap_or(false) && self.is_empty(group) {
            self.releases.push(group.to_string());
        }
    }
}

/// Group hierarchy held in memory
#[derive(Debug, Default)]
pub struct MemoryGroupBackend {
    state: Mutex<GroupState>,
}

impl MemoryGroupBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release_agent(&self) -> Option<PathBuf> {
        lock(&self.state).release_agent.clone()
    }

    pub fn members_of(&self, group: &str) -> Vec<u32> {
        lock(&self.state)
            .membership
            .iter()
            .filter(|(_, g)| g.as_str() == group)
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn notify_enabled(&self, group: &str) -> bool {
        lock(&self.state).groups.get(group).copied().unwrap_or(false)
    }

    /// Every group except the hierarchy root
    pub fn groups(&self) -> Vec<String> {
        lock(&self.state).groups.keys().cloned().collect()
    }

    /// Every member of `group` exits
    pub fn drain(&self, group: &str) {
        let mut state = lock(&self.state);
        state.membership.retain(|_, g| g != group);
        state.check_release(group);
    }

    /// Groups the kernel would have handed to the release agent, oldest first
    pub fn releases(&self) -> Vec<String> {
        lock(&self.state).releases.clone()
    }

    pub fn releases_fired(&self) -> usize {
        lock(&self.state).releases.len()
    }

    pub fn fail_notify(&self, fail: bool) {
        lock(&self.state).fail_notify = fail;
    }
}

impl GroupBackend for MemoryGroupBackend {
    fn backend_name(&self) -> &str {
        "memory"
    }

    fn set_release_agent(&self, _root: &Path, agent: &Path) -> Result<()> {
        lock(&self.state).release_agent = Some(agent.to_path_buf());
        Ok(())
    }

    fn exists(&self, _root: &Path, group: &str) -> bool {
        lock(&self.state).known(group)
    }

    fn create(&self, _root: &Path, group: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.known(group) {
            return Err(LvpeekError::GroupExists(group.to_string()));
        }
        let parent = parent_group(group);
        if !state.known(parent) {
            return Err(LvpeekError::GroupNotFound(parent.to_string()));
        }
        state.groups.insert(group.to_string(), false);
        Ok(())
    }

    fn remove(&self, _root: &Path, group: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if group == "/" || !state.groups.contains_key(group) {
            return Err(LvpeekError::GroupNotFound(group.to_string()));
        }
        if !state.is_empty(group) {
            return Err(LvpeekError::GroupNotEmpty(group.to_string()));
        }
        state.groups.remove(group);
        Ok(())
    }

    fn attach(&self, _root: &Path, group: &str, pid: u32) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.known(group) {
            return Err(LvpeekError::GroupNotFound(group.to_string()));
        }
        let previous = state.membership.insert(pid, group.to_string());
        if let Some(previous) = previous {
            if previous != group {
                state.check_release(&previous);
            }
        }
        Ok(())
    }

    fn members(&self, _root: &Path, group: &str) -> Result<Vec<u32>> {
        if !lock(&self.state).known(group) {
            return Err(LvpeekError::GroupNotFound(group.to_string()));
        }
        Ok(self.members_of(group))
    }

    fn set_notify_on_release(&self, _root: &Path, group: &str, enabled: bool) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_notify {
            return Err(LvpeekError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("notify_on_release for {}: injected failure", group),
            )));
        }
        match state.groups.get_mut(group) {
            Some(flag) => {
                *flag = enabled;
                Ok(())
            }
            None => Err(LvpeekError::GroupNotFound(group.to_string())),
        }
    }
}

#[derive(Debug, Default)]
struct VolumeState {
    /// Volume group -> logical volumes, snapshots included
    volumes: BTreeMap<String, BTreeSet<String>>,
    /// (volume group, snapshot) -> origin volume
    snapshots: BTreeMap<(String, String), String>,
    fail_create: bool,
    fail_remove: bool,
}

/// Volume manager keeping logical volumes in memory
#[derive(Debug, Default)]
pub struct FakeVolumeManager {
    state: Mutex<VolumeState>,
}

impl FakeVolumeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_volume(&self, volume_group: &str, volume: &str) {
        lock(&self.state)
            .volumes
            .entry(volume_group.to_string())
            .or_default()
            .insert(volume.to_string());
    }

    /// Snapshot names currently present in `volume_group`
    pub fn snapshots(&self, volume_group: &str) -> Vec<String> {
        lock(&self.state)
            .snapshots
            .keys()
            .filter(|(vg, _)| vg == volume_group)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn fail_create(&self, fail: bool) {
        lock(&self.state).fail_create = fail;
    }

    pub fn fail_remove(&self, fail: bool) {
        lock(&self.state).fail_remove = fail;
    }
}

impl VolumeManager for FakeVolumeManager {
    fn create_snapshot(
        &self,
        volume_group: &str,
        volume: &str,
        name: &str,
        size_mib: u64,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_create {
            return Err(LvpeekError::SnapshotCreateFailed(format!(
                "{}/{}: injected failure",
                volume_group, name
            )));
        }
        if size_mib == 0 {
            return Err(LvpeekError::SnapshotCreateFailed("size must be positive".to_string()));
        }
        let volumes = match state.volumes.get_mut(volume_group) {
            Some(volumes) if volumes.contains(volume) => volumes,
            _ => {
                return Err(LvpeekError::SnapshotCreateFailed(format!(
                    "origin {}/{} not found",
                    volume_group, volume
                )))
            }
        };
        if !volumes.insert(name.to_string()) {
            return Err(LvpeekError::SnapshotCreateFailed(format!(
                "{}/{} already exists",
                volume_group, name
            )));
        }
        state
            .snapshots
            .insert((volume_group.to_string(), name.to_string()), volume.to_string());
        Ok(())
    }

    fn remove_snapshot(&self, volume_group: &str, name: &str) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_remove {
            return Err(LvpeekError::SnapshotRemoveFailed(format!(
                "{}/{}: injected failure",
                volume_group, name
            )));
        }
        let key = (volume_group.to_string(), name.to_string());
        if state.snapshots.remove(&key).is_none() {
            return Err(LvpeekError::SnapshotRemoveFailed(format!(
                "{}/{} not found",
                volume_group, name
            )));
        }
        if let Some(volumes) = state.volumes.get_mut(volume_group) {
            volumes.remove(name);
        }
        Ok(())
    }

    fn snapshot_exists(&self, volume_group: &str, name: &str) -> Result<bool> {
        Ok(lock(&self.state)
            .snapshots
            .contains_key(&(volume_group.to_string(), name.to_string())))
    }

    fn list_volumes(&self, volume_group: &str) -> Result<Vec<String>> {
        match lock(&self.state).volumes.get(volume_group) {
            Some(volumes) => Ok(volumes.iter().cloned().collect()),
            None => Err(LvpeekError::Process(format!(
                "Volume group \"{}\" not found",
                volume_group
            ))),
        }
    }
}
