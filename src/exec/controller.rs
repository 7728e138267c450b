/// Snapshot lifecycle controller
///
/// Sequences the setup chain and the kernel-triggered teardown. The two
/// phases run in different processes and share nothing but the group path
/// the kernel passes to the release agent; teardown derives everything else
/// from it.
use crate::config::config::LvpeekConfig;
use crate::config::types::{LifecycleRequest, LvpeekError, Result, SetupRequest};
use crate::core::identity::{decode, SnapshotIdentity};
use crate::exec::preexec::{ExecReady, Setup, SetupContext};
use crate::kernel::cgroup::{CgroupV1, GroupBackend, GroupTracker};
use crate::kernel::mount::{MountTable, SystemMountTable, UnmountOutcome};
use crate::observability::journal::Journal;
use crate::safety::workspace::{Workspace, WorkspaceAllocator};
use crate::volume::{LvmCommands, VolumeManager};
use log::{debug, error, info, warn};
use std::convert::Infallible;
use std::sync::Arc;

/// Outcome of a teardown that reached convergence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub identity: SnapshotIdentity,
    /// Non-fatal findings, e.g. workspace residue or an already-removed group
    pub warnings: Vec<String>,
}

pub struct SnapshotController {
    config: LvpeekConfig,
    mounts: Arc<dyn MountTable>,
    groups: Arc<dyn GroupBackend>,
    volumes: Arc<dyn VolumeManager>,
    journal: Journal,
}

impl SnapshotController {
    pub fn new(
        config: LvpeekConfig,
        mounts: Arc<dyn MountTable>,
        groups: Arc<dyn GroupBackend>,
        volumes: Arc<dyn VolumeManager>,
    ) -> Self {
        let journal = Journal::new(config.journal_path.clone());
        debug!("Tracking groups through the {} backend", groups.backend_name());
        Self {
            config,
            mounts,
            groups,
            volumes,
            journal,
        }
    }

    /// Controller over the real kernel and LVM2 tools
    pub fn system(config: LvpeekConfig) -> Self {
        let volumes = Arc::new(LvmCommands::new(config.lvm.clone()));
        Self::new(
            config,
            Arc::new(SystemMountTable::new()),
            Arc::new(CgroupV1::new()),
            volumes,
        )
    }

    fn context(&self) -> SetupContext<'_> {
        SetupContext {
            config: &self.config,
            mounts: self.mounts.as_ref(),
            groups: self.groups.as_ref(),
            volumes: self.volumes.as_ref(),
        }
    }

    fn tracker(&self) -> GroupTracker<'_> {
        GroupTracker::new(
            self.mounts.as_ref(),
            self.groups.as_ref(),
            &self.config.hierarchy_name,
        )
    }

    /// Dispatch one request; a successful setup never returns
    pub fn run(&self, request: &LifecycleRequest) -> Result<()> {
        debug!("Running {} request", request.mode_name());
        match request {
            LifecycleRequest::Setup(setup) => match self.run_setup(setup)? {},
            LifecycleRequest::Teardown(teardown) => {
                self.run_teardown(&teardown.group_path).map(|_| ())
            }
        }
    }

    /// Every setup step up to, but not including, the exec
    pub fn prepare_setup(&self, request: &SetupRequest) -> Result<Setup<'_, ExecReady>> {
        self.prepare_setup_as(request, std::process::id())
    }

    /// Like [`prepare_setup`](Self::prepare_setup), joining `pid` to the group
    pub fn prepare_setup_as(
        &self,
        request: &SetupRequest,
        pid: u32,
    ) -> Result<Setup<'_, ExecReady>> {
        if request.size_mib == 0 {
            return Err(LvpeekError::Config(
                "snapshot size must be greater than 0".to_string(),
            ));
        }
        let identity = SnapshotIdentity::generate(
            &request.volume_group,
            &request.volume,
            &self.config.snapshot_prefix,
        )?;
        let release_agent = self.config.resolve_release_agent()?;
        let fstype = request
            .filesystem
            .as_deref()
            .or(self.config.filesystem.as_deref());

        info!(
            "Setting up {} ({} MiB snapshot of {})",
            identity,
            request.size_mib,
            identity.origin()
        );

        Setup::new(self.context(), identity, pid)
            .isolate()?
            .allocate_workspace()?
            .bind_hierarchy(&release_agent)?
            .join_group()?
            .detach()?
            .create_snapshot(request.size_mib)?
            .mount_snapshot(fstype)
    }

    /// Full setup; on success this process becomes the user's command
    pub fn run_setup(&self, request: &SetupRequest) -> Result<Infallible> {
        self.prepare_setup(request)?.exec(&request.command)
    }

    /// Converge the lifecycle named by `group_path` to nothing left
    ///
    /// Every step runs even after an earlier one failed; failures are
    /// collected into `TeardownIncomplete`. The journal gets one line either
    /// way.
    pub fn run_teardown(&self, group_path: &str) -> Result<TeardownReport> {
        let identity = match decode(group_path) {
            Ok(identity) => identity,
            Err(e) => {
                error!("Refusing teardown of {:?}: {}", group_path, e);
                self.journal.record_failure(group_path, &[e.to_string()]);
                return Err(e);
            }
        };
        info!("Tearing down {}", identity);

        let mut failures = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = self.mounts.isolate_namespace() {
            failures.push(format!("mount namespace: {}", e));
        }

        let workspace =
            WorkspaceAllocator::new(&self.config.workspace_root).locate(identity.snapshot_name());

        match workspace.reopen() {
            Ok(()) => self.teardown_group(&identity, &workspace, &mut failures, &mut warnings),
            Err(e) => failures.push(format!("tracked group {}: {}", group_path, e)),
        }

        match self.mounts.unmount(&workspace.volume_dir()) {
            Ok(UnmountOutcome::Unmounted) => debug!("Unmounted leftover volume mount"),
            Ok(UnmountOutcome::NotMounted) => {}
            Err(e) => failures.push(format!("volume mount: {}", e)),
        }

        self.teardown_snapshot(&identity, &mut failures);

        if let Err(e) = workspace.release() {
            warn!("{}", e);
            warnings.push(e.to_string());
        }

        if failures.is_empty() {
            info!("Cleaned up {}", identity);
            self.journal.record_success(identity.snapshot_name());
            Ok(TeardownReport { identity, warnings })
        } else {
            for failure in &failures {
                error!("Teardown of {}: {}", identity, failure);
            }
            self.journal
                .record_failure(identity.snapshot_name(), &failures);
            Err(LvpeekError::TeardownIncomplete {
                snapshot: identity.snapshot_name().to_string(),
                failures,
            })
        }
    }

    fn teardown_group(
        &self,
        identity: &SnapshotIdentity,
        workspace: &Workspace,
        failures: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) {
        let group = match identity.encode() {
            Ok(group) => group,
            Err(e) => {
                failures.push(e.to_string());
                return;
            }
        };

        let tracker = self.tracker();
        let hierarchy = match tracker.rebind_hierarchy(workspace) {
            Ok(hierarchy) => hierarchy,
            Err(e) => {
                failures.push(format!("tracked group {}: {}", group, e));
                return;
            }
        };

        match tracker.remove_group(&hierarchy, &group) {
            Ok(()) => {}
            Err(e) if e.is_already_clean() => {
                info!("Tracked group {} already removed", group);
                warnings.push(e.to_string());
            }
            Err(e) => failures.push(format!("tracked group {}: {}", group, e)),
        }

        if let Err(e) = tracker.unbind_hierarchy(hierarchy) {
            failures.push(format!("hierarchy mount: {}", e));
        }
    }

    fn teardown_snapshot(&self, identity: &SnapshotIdentity, failures: &mut Vec<String>) {
        let volume_group = identity.volume_group();
        let name = identity.snapshot_name();

        match self.volumes.snapshot_exists(volume_group, name) {
            Ok(false) => {
                info!("Snapshot {}/{} already removed", volume_group, name);
                return;
            }
            Ok(true) => {}
            Err(e) => warn!("Could not check for snapshot {}/{}: {}", volume_group, name, e),
        }

        if let Err(e) = self.volumes.remove_snapshot(volume_group, name) {
            failures.push(format!("snapshot {}/{}: {}", volume_group, name, e));
        }
    }
}
