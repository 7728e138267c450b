/// Configuration loading from /etc/lvpeek/config.json
///
/// Setup and the kernel-spawned teardown must agree on every value here, and
/// the release agent runs with no inherited environment, so the file location
/// is fixed rather than taken from the environment.
use crate::config::types::{LvpeekError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lvpeek/config.json";
pub const DEFAULT_WORKSPACE_ROOT: &str = "/run/lvpeek";
pub const DEFAULT_HIERARCHY_NAME: &str = "lvpeek";
pub const DEFAULT_SNAPSHOT_PREFIX: &str = "lvpeek";
pub const DEFAULT_SIZE_MIB: u64 = 1024;
pub const DEFAULT_JOURNAL_PATH: &str = "/var/log/lvpeek.log";
pub const RELEASE_AGENT_BINARY: &str = "lvpeek-release-agent";

/// Volume manager command names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LvmConfig {
    pub lvcreate: String,
    pub lvremove: String,
    pub lvs: String,
}

impl Default for LvmConfig {
    fn default() -> Self {
        Self {
            lvcreate: "lvcreate".to_string(),
            lvremove: "lvremove".to_string(),
            lvs: "lvs".to_string(),
        }
    }
}

/// Full config.json structure; every field is optional in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LvpeekConfig {
    /// Parent of the per-invocation workspaces
    pub workspace_root: PathBuf,
    /// Name of the cgroup-v1 hierarchy used for tracking (`name=` mount option)
    pub hierarchy_name: String,
    /// Prefix of generated snapshot names
    pub snapshot_prefix: String,
    /// Snapshot size used when the caller gives none
    pub default_size_mib: u64,
    /// Filesystem type for the read-only mount; probed when unset
    pub filesystem: Option<String>,
    /// Operator journal receiving one line per teardown
    pub journal_path: Option<PathBuf>,
    /// Release agent override; defaults to the binary next to the current executable
    pub release_agent: Option<PathBuf>,
    pub lvm: LvmConfig,
}

impl Default for LvpeekConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            hierarchy_name: DEFAULT_HIERARCHY_NAME.to_string(),
            snapshot_prefix: DEFAULT_SNAPSHOT_PREFIX.to_string(),
            default_size_mib: DEFAULT_SIZE_MIB,
            filesystem: None,
            journal_path: Some(PathBuf::from(DEFAULT_JOURNAL_PATH)),
            release_agent: None,
            lvm: LvmConfig::default(),
        }
    }
}

impl LvpeekConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            LvpeekError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: LvpeekConfig = serde_json::from_str(&content).map_err(|e| {
            LvpeekError::Config(format!("Failed to parse config JSON {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from_file(path)
    }

    /// Load the system-wide configuration
    pub fn load_default() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.workspace_root.is_absolute() {
            return Err(LvpeekError::Config(format!(
                "workspace_root must be absolute: {}",
                self.workspace_root.display()
            )));
        }
        if self.hierarchy_name.is_empty()
            || !self
                .hierarchy_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(LvpeekError::Config(format!(
                "Invalid hierarchy_name: {:?}",
                self.hierarchy_name
            )));
        }
        crate::core::identity::validate_component("snapshot_prefix", &self.snapshot_prefix)
            .map_err(|e| LvpeekError::Config(e.to_string()))?;
        if self.default_size_mib == 0 {
            return Err(LvpeekError::Config(
                "default_size_mib must be greater than 0".to_string(),
            ));
        }
        if let Some(agent) = &self.release_agent {
            if !agent.is_absolute() {
                return Err(LvpeekError::Config(format!(
                    "release_agent must be absolute: {}",
                    agent.display()
                )));
            }
        }
        Ok(())
    }

    /// Absolute path of the release agent, resolved now
    ///
    /// The kernel spawns the agent later with its own working directory, so a
    /// relative path would not survive.
    pub fn resolve_release_agent(&self) -> Result<PathBuf> {
        if let Some(agent) = &self.release_agent {
            return Ok(agent.clone());
        }

        let exe = std::env::current_exe().map_err(|e| {
            LvpeekError::Config(format!("Failed to resolve current executable: {}", e))
        })?;
        let exe = exe.canonicalize().unwrap_or(exe);
        Ok(exe.with_file_name(RELEASE_AGENT_BINARY))
    }
}
