use crate::config::config::LvpeekConfig;
use crate::config::types::{LifecycleRequest, SetupRequest, TeardownRequest};
use crate::exec::SnapshotController;
use anyhow::{Context, Result};
use clap::Parser;
use env_logger::{Builder, Env};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CliMode {
    /// `lvpeek`: operator entry point
    Peek,
    /// `lvpeek-release-agent`: spawned by the kernel when a group empties
    ReleaseAgent,
}

impl CliMode {
    fn primary_binary(self) -> &'static str {
        match self {
            Self::Peek => "lvpeek",
            Self::ReleaseAgent => crate::config::config::RELEASE_AGENT_BINARY,
        }
    }
}

/// Run a command against a throwaway read-only snapshot of a logical volume
///
/// The snapshot is removed automatically once the command and every process
/// it started have exited.
#[derive(Parser, Debug)]
#[command(name = "lvpeek", author, version, about, long_about = None)]
struct PeekCli {
    /// Volume group of the origin volume
    #[arg(
        short = 'g',
        long = "volume-group",
        value_name = "VG",
        value_parser = parse_volume_name,
        required_unless_present = "release"
    )]
    volume_group: Option<String>,

    /// Logical volume to snapshot
    #[arg(
        short = 'l',
        long = "logical-volume",
        value_name = "LV",
        value_parser = parse_volume_name,
        required_unless_present = "release"
    )]
    logical_volume: Option<String>,

    /// Snapshot size in MiB (default from config, 1024)
    #[arg(short = 's', long, value_name = "MIB", value_parser = parse_size)]
    size: Option<u64>,

    /// Filesystem type of the volume (probed when omitted)
    #[arg(short = 'f', long = "format", value_name = "FSTYPE", value_parser = parse_fstype)]
    format: Option<String>,

    /// Debug logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Tear down the lifecycle of a tracked group by hand
    #[arg(
        long,
        hide = true,
        value_name = "GROUP_PATH",
        value_parser = parse_group_path,
        conflicts_with_all = ["volume_group", "logical_volume", "size", "format", "command"]
    )]
    release: Option<String>,

    /// Command to run inside the snapshot (default: your shell)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

/// Release agent registered with the tracking hierarchy
#[derive(Parser, Debug)]
#[command(name = "lvpeek-release-agent", author, version, about, long_about = None)]
struct AgentCli {
    /// Path of the group that just emptied, e.g. /vg/lv/snapshot
    #[arg(value_name = "GROUP_PATH", value_parser = parse_group_path)]
    group_path: String,
}

impl PeekCli {
    fn into_request(self, config: &LvpeekConfig) -> Result<LifecycleRequest> {
        if let Some(group_path) = self.release {
            return Ok(LifecycleRequest::Teardown(TeardownRequest { group_path }));
        }

        let volume_group = self
            .volume_group
            .context("--volume-group is required")?;
        let volume = self
            .logical_volume
            .context("--logical-volume is required")?;

        Ok(LifecycleRequest::Setup(SetupRequest {
            volume_group,
            volume,
            size_mib: self.size.unwrap_or(config.default_size_mib),
            command: self.command,
            filesystem: self.format,
        }))
    }
}

fn parse_volume_name(value: &str) -> std::result::Result<String, String> {
    crate::core::identity::validate_component("name", value)
        .map(|_| value.to_string())
        .map_err(|_| format!("{:?} must match [A-Za-z0-9+_.-]+", value))
}

fn parse_size(value: &str) -> std::result::Result<u64, String> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("{:?} is not a size in MiB", value));
    }
    match value.parse::<u64>() {
        Ok(0) => Err("size must be greater than 0".to_string()),
        Ok(size) => Ok(size),
        Err(e) => Err(format!("{:?}: {}", value, e)),
    }
}

fn parse_fstype(value: &str) -> std::result::Result<String, String> {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        Ok(value.to_string())
    } else {
        Err(format!("{:?} is not a filesystem type", value))
    }
}

fn parse_group_path(value: &str) -> std::result::Result<String, String> {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+_./-".contains(c))
    {
        Ok(value.to_string())
    } else {
        Err(format!("{:?} must match [A-Za-z0-9+_./-]+", value))
    }
}

enum ParsedArgs {
    Peek(PeekCli),
    Agent(AgentCli),
}

impl ParsedArgs {
    fn verbose(&self) -> bool {
        match self {
            Self::Peek(cli) => cli.verbose,
            Self::Agent(_) => false,
        }
    }

    fn into_request(self, config: &LvpeekConfig) -> Result<LifecycleRequest> {
        match self {
            Self::Peek(cli) => cli.into_request(config),
            Self::Agent(cli) => Ok(LifecycleRequest::Teardown(TeardownRequest {
                group_path: cli.group_path,
            })),
        }
    }
}

/// Turn argv into the single request the controller consumes
///
/// `args` includes the program name, as with `std::env::args`.
pub fn parse_request<I, T>(mode: CliMode, args: I, config: &LvpeekConfig) -> Result<LifecycleRequest>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let parsed = match mode {
        CliMode::Peek => ParsedArgs::Peek(PeekCli::try_parse_from(args)?),
        CliMode::ReleaseAgent => ParsedArgs::Agent(AgentCli::try_parse_from(args)?),
    };
    parsed.into_request(config)
}

fn init_logging(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", if verbose { "debug" } else { "info" });
    // Already initialised when embedded in tests
    let _ = Builder::from_env(env).try_init();
}

pub fn run(mode: CliMode) -> Result<()> {
    // Parse first so --help and usage errors have no side effects
    let parsed = match mode {
        CliMode::Peek => ParsedArgs::Peek(PeekCli::parse()),
        CliMode::ReleaseAgent => ParsedArgs::Agent(AgentCli::parse()),
    };
    init_logging(parsed.verbose());

    let config = LvpeekConfig::load_default().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    let request = parsed.into_request(&config)?;

    if !nix::unistd::geteuid().is_root() {
        eprintln!(
            "Warning: {} needs root privileges for mounts, namespaces and LVM",
            mode.primary_binary()
        );
    }
    if !crate::kernel::namespace::is_supported() {
        log::warn!("Mount namespaces appear unavailable on this host");
    }

    log::debug!(
        "{} starting in {} mode",
        mode.primary_binary(),
        request.mode_name()
    );
    let controller = SnapshotController::system(config);
    controller
        .run(&request)
        .with_context(|| format!("{} failed", request.mode_name()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LvpeekConfig {
        LvpeekConfig::default()
    }

    #[test]
    fn test_setup_with_command() {
        let request = parse_request(
            CliMode::Peek,
            ["lvpeek", "-g", "data", "-l", "app", "-s", "512", "--", "ls", "-la"],
            &config(),
        )
        .unwrap();

        assert_eq!(
            request,
            LifecycleRequest::Setup(SetupRequest {
                volume_group: "data".to_string(),
                volume: "app".to_string(),
                size_mib: 512,
                command: vec!["ls".to_string(), "-la".to_string()],
                filesystem: None,
            })
        );
    }

    #[test]
    fn test_setup_defaults() {
        let request = parse_request(
            CliMode::Peek,
            ["lvpeek", "--volume-group", "data", "--logical-volume", "app", "-f", "xfs"],
            &config(),
        )
        .unwrap();

        match request {
            LifecycleRequest::Setup(setup) => {
                assert_eq!(setup.size_mib, 1024);
                assert!(setup.command.is_empty());
                assert_eq!(setup.filesystem.as_deref(), Some("xfs"));
            }
            other => panic!("expected setup, got {:?}", other),
        }
    }

    #[test]
    fn test_release_option() {
        let request =
            parse_request(CliMode::Peek, ["lvpeek", "--release", "/data/app/s"], &config()).unwrap();
        assert_eq!(
            request,
            LifecycleRequest::Teardown(TeardownRequest {
                group_path: "/data/app/s".to_string()
            })
        );
    }

    #[test]
    fn test_release_conflicts_with_setup_options() {
        assert!(parse_request(
            CliMode::Peek,
            ["lvpeek", "--release", "/data/app/s", "-g", "data"],
            &config()
        )
        .is_err());
    }

    #[test]
    fn test_rejects_unsafe_names() {
        for args in [
            ["lvpeek", "-g", "da ta", "-l", "app"],
            ["lvpeek", "-g", "data", "-l", "a/b"],
            ["lvpeek", "-g", "data", "-l", ".."],
        ] {
            assert!(parse_request(CliMode::Peek, args, &config()).is_err(), "{:?}", args);
        }
    }

    #[test]
    fn test_rejects_bad_sizes() {
        for size in ["0", "-5", "1G", ""] {
            assert!(
                parse_request(
                    CliMode::Peek,
                    ["lvpeek", "-g", "data", "-l", "app", "-s", size],
                    &config()
                )
                .is_err(),
                "{:?}",
                size
            );
        }
    }

    #[test]
    fn test_missing_volume_is_error() {
        assert!(parse_request(CliMode::Peek, ["lvpeek", "-g", "data"], &config()).is_err());
    }

    #[test]
    fn test_release_agent_takes_one_path() {
        let request = parse_request(
            CliMode::ReleaseAgent,
            ["lvpeek-release-agent", "/data/app/lvpeek-1"],
            &config(),
        )
        .unwrap();
        assert_eq!(request.mode_name(), "teardown");

        assert!(parse_request(CliMode::ReleaseAgent, ["lvpeek-release-agent"], &config()).is_err());
        assert!(parse_request(
            CliMode::ReleaseAgent,
            ["lvpeek-release-agent", "/data/app/s;rm"],
            &config()
        )
        .is_err());
    }
}
