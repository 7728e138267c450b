//! LVM2 command-line backend.
//!
//! ```text
//! lvcreate --snapshot /dev/<vg>/<lv> --name <snap> --size <n>M
//! lvremove --force <vg>/<snap>
//! lvs --noheadings -o lv_name <vg>
//! ```

use crate::config::config::LvmConfig;
use crate::config::types::{LvpeekError, Result};
use crate::volume::VolumeManager;
use std::process::{Command, Stdio};

/// The release agent inherits no PATH from the kernel, so commands run with this one
pub const COMMAND_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone, Default)]
pub struct LvmCommands {
    config: LvmConfig,
}

/// Failure of one external command, kept as text for the error taxonomy
#[derive(Debug)]
struct CommandFailure(String);

impl LvmCommands {
    pub fn new(config: LvmConfig) -> Self {
        Self { config }
    }

    fn run(&self, program: &str, args: &[&str]) -> std::result::Result<String, CommandFailure> {
        log::debug!("Running {} {:?}", program, args);
        let output = Command::new(program)
            .args(args)
            .env("PATH", COMMAND_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| CommandFailure(format!("Failed to execute {} {:?}: {}", program, args, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CommandFailure(format!(
                "{} {:?} failed (exit {}): {}",
                program,
                args,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Volume names from `lvs --noheadings -o lv_name` output
pub fn parse_lv_names(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl VolumeManager for LvmCommands {
    fn create_snapshot(
        &self,
        volume_group: &str,
        volume: &str,
        name: &str,
        size_mib: u64,
    ) -> Result<()> {
        let origin = format!("/dev/{}/{}", volume_group, volume);
        let size = format!("{}M", size_mib);
        self.run(
            &self.config.lvcreate,
            &["--snapshot", &origin, "--name", name, "--size", &size],
        )
        .map_err(|e| LvpeekError::SnapshotCreateFailed(e.0))?;

        log::info!("Created snapshot {}/{} of {} ({})", volume_group, name, origin, size);
        Ok(())
    }

    fn remove_snapshot(&self, volume_group: &str, name: &str) -> Result<()> {
        let target = format!("{}/{}", volume_group, name);
        self.run(&self.config.lvremove, &["--force", &target])
            .map_err(|e| LvpeekError::SnapshotRemoveFailed(e.0))?;

        log::info!("Removed snapshot {}", target);
        Ok(())
    }

    fn snapshot_exists(&self, volume_group: &str, name: &str) -> Result<bool> {
        Ok(self
            .list_volumes(volume_group)?
            .iter()
            .any(|volume| volume == name))
    }

    fn list_volumes(&self, volume_group: &str) -> Result<Vec<String>> {
        let output = self
            .run(&self.config.lvs, &["--noheadings", "-o", "lv_name", volume_group])
            .map_err(|e| LvpeekError::Process(e.0))?;
        Ok(parse_lv_names(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lv_names() {
        let output = "  root                             \n  home\n\n  lvpeek-20240101-000000-abc\n";
        assert_eq!(
            parse_lv_names(output),
            vec!["root", "home", "lvpeek-20240101-000000-abc"]
        );
    }

    #[test]
    fn test_missing_binary_maps_to_create_failure() {
        let lvm = LvmCommands::new(LvmConfig {
            lvcreate: "/nonexistent/lvcreate".to_string(),
            ..LvmConfig::default()
        });
        assert!(matches!(
            lvm.create_snapshot("data", "app", "s", 16),
            Err(LvpeekError::SnapshotCreateFailed(_))
        ));
    }

    #[test]
    fn test_failing_command_maps_to_remove_failure() {
        let lvm = LvmCommands::new(LvmConfig {
            lvremove: "false".to_string(),
            ..LvmConfig::default()
        });
        match lvm.remove_snapshot("data", "s") {
            Err(LvpeekError::SnapshotRemoveFailed(msg)) => assert!(msg.contains("exit 1")),
            other => panic!("expected remove failure, got {:?}", other),
        }
    }

    #[test]
    fn test_listing_uses_configured_binary() {
        // `echo` prints its arguments, standing in for lvs output
        let lvm = LvmCommands::new(LvmConfig {
            lvs: "echo".to_string(),
            ..LvmConfig::default()
        });
        let names = lvm.list_volumes("data").unwrap();
        assert_eq!(names, vec!["--noheadings -o lv_name data"]);
        assert!(!lvm.snapshot_exists("data", "s").unwrap());
    }
}
