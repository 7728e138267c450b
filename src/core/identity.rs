//! Snapshot identity and its group-path encoding.
//!
//! One identity keys a whole lifecycle: the tracked group lives at
//! `/<volume_group>/<volume>/<snapshot_name>` inside the tracking hierarchy,
//! the snapshot carries `snapshot_name`, and the workspace directory is named
//! after the snapshot. Teardown recovers everything from the path alone.

use crate::config::types::{LvpeekError, Result};
use std::fmt;
use std::path::PathBuf;

/// Characters allowed in every identity component besides ASCII alphanumerics
const EXTRA_SAFE_CHARS: [char; 4] = ['.', '_', '+', '-'];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SnapshotIdentity {
    volume_group: String,
    volume: String,
    snapshot_name: String,
}

/// Check one component against the safe charset
pub fn validate_component(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LvpeekError::InvalidIdentity(format!("{} is empty", field)));
    }
    if value.contains('/') {
        return Err(LvpeekError::InvalidIdentity(format!(
            "{} contains '/': {:?}",
            field, value
        )));
    }
    // "." and ".." would alias directories in the hierarchy
    if value == "." || value == ".." {
        return Err(LvpeekError::InvalidIdentity(format!(
            "{} may not be {:?}",
            field, value
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || EXTRA_SAFE_CHARS.contains(c)))
    {
        return Err(LvpeekError::InvalidIdentity(format!(
            "{} contains unsafe character {:?}: {:?}",
            field, bad, value
        )));
    }
    Ok(())
}

impl SnapshotIdentity {
    pub fn new(
        volume_group: impl Into<String>,
        volume: impl Into<String>,
        snapshot_name: impl Into<String>,
    ) -> Result<Self> {
        let identity = Self {
            volume_group: volume_group.into(),
            volume: volume.into(),
            snapshot_name: snapshot_name.into(),
        };
        validate_component("volume group", &identity.volume_group)?;
        validate_component("volume", &identity.volume)?;
        validate_component("snapshot name", &identity.snapshot_name)?;
        Ok(identity)
    }

    /// Identity with a freshly generated, collision-free snapshot name
    pub fn generate(volume_group: &str, volume: &str, prefix: &str) -> Result<Self> {
        Self::new(volume_group, volume, generate_snapshot_name(prefix))
    }

    pub fn volume_group(&self) -> &str {
        &self.volume_group
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn snapshot_name(&self) -> &str {
        &self.snapshot_name
    }

    /// `<vg>/<lv>` as the volume manager addresses the origin
    pub fn origin(&self) -> String {
        format!("{}/{}", self.volume_group, self.volume)
    }

    /// Block device of the snapshot once created
    pub fn snapshot_device(&self) -> PathBuf {
        PathBuf::from("/dev")
            .join(&self.volume_group)
            .join(&self.snapshot_name)
    }

    pub fn encode(&self) -> Result<String> {
        encode(self)
    }
}

impl fmt::Display for SnapshotIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.volume_group, self.volume, self.snapshot_name
        )
    }
}

/// `<prefix>-%Y%m%d-%H%M%S-<12 hex>`: time-ordered for operators, random for uniqueness
pub fn generate_snapshot_name(prefix: &str) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", prefix, stamp, &random[..12])
}

/// Join the three components into the absolute group path
pub fn encode(identity: &SnapshotIdentity) -> Result<String> {
    // Fields are private and validated on construction; re-check anyway since
    // a path with an extra '/' would address a different group.
    validate_component("volume group", &identity.volume_group)?;
    validate_component("volume", &identity.volume)?;
    validate_component("snapshot name", &identity.snapshot_name)?;
    Ok(format!(
        "/{}/{}/{}",
        identity.volume_group, identity.volume, identity.snapshot_name
    ))
}

/// Split an absolute group path back into its identity
pub fn decode(path: &str) -> Result<SnapshotIdentity> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| LvpeekError::MalformedPath(format!("not absolute: {:?}", path)))?;

    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(LvpeekError::MalformedPath(format!(
            "expected /<volume_group>/<volume>/<snapshot_name>, got {:?}",
            path
        )));
    }

    SnapshotIdentity::new(parts[0], parts[1], parts[2])
        .map_err(|e| LvpeekError::MalformedPath(format!("{:?}: {}", path, e)))
}
