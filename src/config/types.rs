/// Core types shared by the lvpeek lifecycle
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Parameters of one setup invocation, validated by the configuration source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupRequest {
    /// Volume group holding the origin volume
    pub volume_group: String,
    /// Logical volume to snapshot
    pub volume: String,
    /// Snapshot size in MiB (2^20 bytes)
    pub size_mib: u64,
    /// Command to run inside the snapshot; empty means the user's shell
    pub command: Vec<String>,
    /// Explicit filesystem type for the read-only mount
    pub filesystem: Option<String>,
}

/// Parameters of one teardown invocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownRequest {
    /// Slash-separated group path handed over by the kernel, e.g. `/vg/lv/snap`
    pub group_path: String,
}

/// The single immutable value produced by the configuration source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleRequest {
    Setup(SetupRequest),
    Teardown(TeardownRequest),
}

impl LifecycleRequest {
    pub fn mode_name(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::Teardown(_) => "teardown",
        }
    }
}

/// Errors raised by the snapshot lifecycle
#[derive(Error, Debug)]
pub enum LvpeekError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Malformed group path: {0}")]
    MalformedPath(String),

    #[error("Failed to create workspace {}: {source}", path.display())]
    WorkspaceCreationFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Workspace residue left behind: {}", .0.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "))]
    WorkspaceResidue(Vec<PathBuf>),

    #[error("Failed to create tracked group: {0}")]
    GroupCreateFailed(String),

    #[error("Tracked group already exists: {0}")]
    GroupExists(String),

    #[error("Tracked group still has members: {0}")]
    GroupNotEmpty(String),

    #[error("Tracked group not found: {0}")]
    GroupNotFound(String),

    #[error("Failed to create snapshot: {0}")]
    SnapshotCreateFailed(String),

    #[error("Failed to remove snapshot: {0}")]
    SnapshotRemoveFailed(String),

    #[error("Mount failed: {0}")]
    MountFailed(String),

    #[error("Unmount failed: {0}")]
    UnmountFailed(String),

    #[error("Namespace isolation error: {0}")]
    Namespace(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Teardown of {snapshot} incomplete: {}", failures.join("; "))]
    TeardownIncomplete {
        snapshot: String,
        failures: Vec<String>,
    },
}

impl LvpeekError {
    /// Whether teardown may treat this error as convergence already reached
    pub fn is_already_clean(&self) -> bool {
        matches!(self, Self::GroupNotFound(_))
    }
}

/// Result type for lvpeek operations
pub type Result<T> = std::result::Result<T, LvpeekError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LvpeekError::GroupNotEmpty("/data/app/snap".to_string());
        assert_eq!(err.to_string(), "Tracked group still has members: /data/app/snap");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = LvpeekError::from(io_err);
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_residue_lists_paths() {
        let err = LvpeekError::WorkspaceResidue(vec![
            PathBuf::from("/run/lvpeek/a/volume"),
            PathBuf::from("/run/lvpeek/a"),
        ]);
        let text = err.to_string();
        assert!(text.contains("/run/lvpeek/a/volume"));
        assert!(text.contains(", /run/lvpeek/a"));
    }

    #[test]
    fn test_teardown_incomplete_joins_failures() {
        let err = LvpeekError::TeardownIncomplete {
            snapshot: "lvpeek-x".to_string(),
            failures: vec!["one".to_string(), "two".to_string()],
        };
        assert_eq!(err.to_string(), "Teardown of lvpeek-x incomplete: one; two");
    }

    #[test]
    fn test_only_group_not_found_counts_as_clean() {
        assert!(LvpeekError::GroupNotFound("x".into()).is_already_clean());
        assert!(!LvpeekError::GroupNotEmpty("x".into()).is_already_clean());
    }

    #[test]
    fn test_mode_name() {
        let req = LifecycleRequest::Teardown(TeardownRequest {
            group_path: "/vg/lv/snap".to_string(),
        });
        assert_eq!(req.mode_name(), "teardown");
    }
}
