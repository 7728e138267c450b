/// Per-lifecycle workspace
///
/// `<workspace_root>/<snapshot_name>/` holding exactly two mount points:
/// `cgroup/` for the tracking hierarchy and `volume/` for the snapshot.
/// The directory name equals the snapshot name, so teardown can find it from
/// the group path alone.
use crate::config::types::{LvpeekError, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const TRACKING_DIR: &str = "cgroup";
const VOLUME_DIR: &str = "volume";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    name: String,
    dir: PathBuf,
}

impl Workspace {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Mount point of the tracking hierarchy
    pub fn tracking_dir(&self) -> PathBuf {
        self.dir.join(TRACKING_DIR)
    }

    /// Mount point of the snapshot filesystem
    pub fn volume_dir(&self) -> PathBuf {
        self.dir.join(VOLUME_DIR)
    }

    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    /// Recreate missing mount points so teardown can mount the hierarchy again
    pub fn reopen(&self) -> Result<()> {
        for dir in [self.tracking_dir(), self.volume_dir()] {
            fs::create_dir_all(&dir).map_err(|source| LvpeekError::WorkspaceCreationFailed {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Remove both mount points and the workspace directory
    ///
    /// Never recursive: anything left inside points at a leaked mount or
    /// file, and is reported as residue instead of being deleted. Every
    /// directory is attempted even if an earlier one could not be removed.
    pub fn release(&self) -> Result<()> {
        let mut residue = Vec::new();

        for dir in [self.volume_dir(), self.tracking_dir(), self.dir.clone()] {
            match fs::remove_dir(&dir) {
                Ok(()) => log::debug!("Removed {}", dir.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    log::debug!("Already removed: {}", dir.display());
                }
                Err(e) => {
                    log::warn!("Failed to remove workspace directory {}: {}", dir.display(), e);
                    residue.push(dir);
                }
            }
        }

        if residue.is_empty() {
            Ok(())
        } else {
            Err(LvpeekError::WorkspaceResidue(residue))
        }
    }
}

/// Allocates and locates workspaces under one root
#[derive(Debug, Clone)]
pub struct WorkspaceAllocator {
    root: PathBuf,
}

impl WorkspaceAllocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a fresh workspace named `name`
    ///
    /// Fails if the directory already exists, so two lifecycles can never
    /// share a workspace.
    pub fn allocate(&self, name: &str) -> Result<Workspace> {
        crate::core::identity::validate_component("workspace name", name)?;

        fs::create_dir_all(&self.root).map_err(|source| LvpeekError::WorkspaceCreationFailed {
            path: self.root.clone(),
            source,
        })?;

        let workspace = self.locate(name);
        fs::create_dir(workspace.dir()).map_err(|source| {
            LvpeekError::WorkspaceCreationFailed {
                path: workspace.dir().to_path_buf(),
                source,
            }
        })?;

        for dir in [workspace.tracking_dir(), workspace.volume_dir()] {
            if let Err(source) = fs::create_dir(&dir) {
                if let Err(e) = workspace.release() {
                    log::warn!("Failed to undo partial workspace: {}", e);
                }
                return Err(LvpeekError::WorkspaceCreationFailed { path: dir, source });
            }
        }

        log::info!("Allocated workspace {}", workspace.dir().display());
        Ok(workspace)
    }

    /// The workspace a given snapshot was allocated, without touching disk
    pub fn locate(&self, name: &str) -> Workspace {
        Workspace {
            name: name.to_string(),
            dir: self.root.join(name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_creates_mount_points() {
        let root = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(root.path().join("lvpeek"));

        let workspace = allocator.allocate("snap-1").unwrap();
        assert!(workspace.tracking_dir().is_dir());
        assert!(workspace.volume_dir().is_dir());
        assert_eq!(workspace.dir(), root.path().join("lvpeek").join("snap-1"));
        assert_eq!(fs::read_dir(workspace.dir()).unwrap().count(), 2);
    }

    #[test]
    fn test_allocate_refuses_existing_name() {
        let root = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(root.path());

        allocator.allocate("snap-1").unwrap();
        assert!(matches!(
            allocator.allocate("snap-1"),
            Err(LvpeekError::WorkspaceCreationFailed { .. })
        ));
    }

    #[test]
    fn test_allocate_rejects_unsafe_name() {
        let root = tempfile::tempdir().unwrap();
        assert!(WorkspaceAllocator::new(root.path()).allocate("../x").is_err());
    }

    #[test]
    fn test_locate_matches_allocate() {
        let root = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(root.path());
        let allocated = allocator.allocate("snap-2").unwrap();
        assert_eq!(allocator.locate("snap-2"), allocated);
    }

    #[test]
    fn test_release_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let workspace = WorkspaceAllocator::new(root.path()).allocate("snap-3").unwrap();

        workspace.release().unwrap();
        assert!(!workspace.exists());
        workspace.release().unwrap();
    }

    #[test]
    fn test_release_reports_residue_and_keeps_going() {
        let root = tempfile::tempdir().unwrap();
        let workspace = WorkspaceAllocator::new(root.path()).allocate("snap-4").unwrap();
        fs::write(workspace.volume_dir().join("leaked"), b"x").unwrap();

        match workspace.release() {
            Err(LvpeekError::WorkspaceResidue(paths)) => {
                assert_eq!(paths, vec![workspace.volume_dir(), workspace.dir().to_path_buf()]);
            }
            other => panic!("expected residue, got {:?}", other),
        }
        assert!(!workspace.tracking_dir().exists());
    }

    #[test]
    fn test_reopen_restores_mount_points() {
        let root = tempfile::tempdir().unwrap();
        let allocator = WorkspaceAllocator::new(root.path());
        let workspace = allocator.locate("snap-5");

        workspace.reopen().unwrap();
        assert!(workspace.tracking_dir().is_dir());
        assert!(workspace.volume_dir().is_dir());
        workspace.release().unwrap();
    }
}
