//! Volume manager seam
//!
//! Only what the lifecycle needs: create and remove a snapshot, plus an
//! existence check for idempotent teardown and a listing for diagnostics.

pub mod lvm;

use crate::config::types::Result;

pub use lvm::LvmCommands;

pub trait VolumeManager: Send + Sync {
    /// Create `name` as a snapshot of `<volume_group>/<volume>` sized `size_mib`
    fn create_snapshot(&self, volume_group: &str, volume: &str, name: &str, size_mib: u64)
        -> Result<()>;
    fn remove_snapshot(&self, volume_group: &str, name: &str) -> Result<()>;
    fn snapshot_exists(&self, volume_group: &str, name: &str) -> Result<bool>;
    /// Logical volume names in `volume_group`
    fn list_volumes(&self, volume_group: &str) -> Result<Vec<String>>;
}
