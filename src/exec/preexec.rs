/// Type-state setup chain
///
/// The setup sequence is fixed:
/// 1. private mount namespace
/// 2. workspace allocation
/// 3. tracking hierarchy mount and release agent registration
/// 4. tracked group creation and join
/// 5. hierarchy unmount (the group stays kernel-side)
/// 6. snapshot creation
/// 7. read-only snapshot mount
/// 8. exec of the user's command inside the snapshot
///
/// Each step consumes the previous state, so steps cannot be skipped or
/// reordered. Every resource is recorded on the unwind stack the moment it
/// exists; a failing step unwinds the whole stack before returning its error.
use crate::config::config::LvpeekConfig;
use crate::config::types::{LvpeekError, Result};
use crate::core::identity::SnapshotIdentity;
use crate::kernel::cgroup::{GroupBackend, GroupTracker, HierarchyHandle, JoinedGroup};
use crate::kernel::mount::MountTable;
use crate::safety::cleanup::{SetupResource, UnwindContext, UnwindStack};
use crate::safety::workspace::{Workspace, WorkspaceAllocator};
use crate::volume::VolumeManager;
use std::convert::Infallible;
use std::ffi::CString;
use std::path::Path;

/// Collaborators shared by every setup step
#[derive(Clone, Copy)]
pub struct SetupContext<'a> {
    pub config: &'a LvpeekConfig,
    pub mounts: &'a dyn MountTable,
    pub groups: &'a dyn GroupBackend,
    pub volumes: &'a dyn VolumeManager,
}

impl<'a> SetupContext<'a> {
    fn tracker(&self) -> GroupTracker<'a> {
        GroupTracker::new(self.mounts, self.groups, &self.config.hierarchy_name)
    }

    fn unwind_context(&self) -> UnwindContext<'a> {
        UnwindContext {
            mounts: self.mounts,
            groups: self.groups,
            volumes: self.volumes,
            hierarchy_name: &self.config.hierarchy_name,
        }
    }
}

/// Type-state marker: nothing done yet
pub struct Fresh;

/// Type-state marker: running in a private mount namespace
pub struct Isolated;

pub struct WorkspaceReady {
    workspace: Workspace,
}

pub struct HierarchyBound {
    workspace: Workspace,
    hierarchy: HierarchyHandle,
}

pub struct GroupJoined {
    workspace: Workspace,
    hierarchy: HierarchyHandle,
    joined: JoinedGroup,
}

/// Type-state marker: hierarchy unmounted, group membership kept
pub struct Detached {
    workspace: Workspace,
    joined: JoinedGroup,
}

pub struct SnapshotCreated {
    workspace: Workspace,
    joined: JoinedGroup,
}

/// Type-state marker: all gates passed, only exec remains
pub struct ExecReady {
    workspace: Workspace,
    joined: JoinedGroup,
}

/// One setup invocation; `S` tracks how far it got
pub struct Setup<'a, S> {
    ctx: SetupContext<'a>,
    identity: SnapshotIdentity,
    pid: u32,
    unwind: UnwindStack,
    state: S,
}

/// A finished setup whose command runs outside this process
#[derive(Debug)]
pub struct Handoff {
    pub identity: SnapshotIdentity,
    pub group_path: String,
    pub workspace: Workspace,
    pub pid: u32,
}

impl<'a, S> Setup<'a, S> {
    pub fn identity(&self) -> &SnapshotIdentity {
        &self.identity
    }

    /// Resources the unwind stack currently holds
    pub fn recorded(&self) -> &[SetupResource] {
        self.unwind.entries()
    }

    fn advance<T>(self, state: T) -> Setup<'a, T> {
        Setup {
            ctx: self.ctx,
            identity: self.identity,
            pid: self.pid,
            unwind: self.unwind,
            state,
        }
    }

    /// Unwind everything recorded and hand back the error that caused it
    fn abort(mut self, err: LvpeekError) -> LvpeekError {
        log::error!("Setup of {} failed: {}", self.identity, err);
        if let Err(unwind_err) = self.unwind.unwind(&self.ctx.unwind_context()) {
            log::error!("Setup unwind left residue: {}", unwind_err);
        }
        err
    }

    /// Give up on this setup, undoing every step taken so far
    pub fn abandon(mut self) -> Result<()> {
        log::info!("Abandoning setup of {}", self.identity);
        self.unwind.unwind(&self.ctx.unwind_context())
    }
}

impl<'a> Setup<'a, Fresh> {
    /// `pid` is the process that joins the tracked group, normally this one
    pub fn new(ctx: SetupContext<'a>, identity: SnapshotIdentity, pid: u32) -> Self {
        Self {
            ctx,
            identity,
            pid,
            unwind: UnwindStack::new(),
            state: Fresh,
        }
    }

    pub fn isolate(self) -> Result<Setup<'a, Isolated>> {
        if let Err(e) = self.ctx.mounts.isolate_namespace() {
            return Err(self.abort(e));
        }
        Ok(self.advance(Isolated))
    }
}

impl<'a> Setup<'a, Isolated> {
    pub fn allocate_workspace(mut self) -> Result<Setup<'a, WorkspaceReady>> {
        let allocator = WorkspaceAllocator::new(&self.ctx.config.workspace_root);
        let workspace = match allocator.allocate(self.identity.snapshot_name()) {
            Ok(workspace) => workspace,
            Err(e) => return Err(self.abort(e)),
        };
        self.unwind.record(SetupResource::Workspace(workspace.clone()));
        Ok(self.advance(WorkspaceReady { workspace }))
    }
}

impl<'a> Setup<'a, WorkspaceReady> {
    /// `release_agent` must already be absolute
    pub fn bind_hierarchy(mut self, release_agent: &Path) -> Result<Setup<'a, HierarchyBound>> {
        let ctx = self.ctx;
        let hierarchy = match ctx
            .tracker()
            .bind_hierarchy(&self.state.workspace, release_agent)
        {
            Ok(hierarchy) => hierarchy,
            Err(e) => return Err(self.abort(e)),
        };
        self.unwind.record(SetupResource::HierarchyMount(
            hierarchy.mount_point().to_path_buf(),
        ));

        let WorkspaceReady { workspace } = self.state;
        Ok(Setup {
            ctx: self.ctx,
            identity: self.identity,
            pid: self.pid,
            unwind: self.unwind,
            state: HierarchyBound {
                workspace,
                hierarchy,
            },
        })
    }
}

impl<'a> Setup<'a, HierarchyBound> {
    pub fn join_group(mut self) -> Result<Setup<'a, GroupJoined>> {
        let ctx = self.ctx;
        let joined = match self
            .identity
            .encode()
            .and_then(|path| ctx.tracker().create_and_join_pid(&self.state.hierarchy, &path, self.pid))
        {
            Ok(joined) => joined,
            Err(e) => return Err(self.abort(e)),
        };
        self.unwind.record(SetupResource::TrackedGroup(joined.clone()));

        let HierarchyBound {
            workspace,
            hierarchy,
        } = self.state;
        Ok(Setup {
            ctx: self.ctx,
            identity: self.identity,
            pid: self.pid,
            unwind: self.unwind,
            state: GroupJoined {
                workspace,
                hierarchy,
                joined,
            },
        })
    }
}

impl<'a> Setup<'a, GroupJoined> {
    /// Unmount the hierarchy; group and membership stay with the kernel
    pub fn detach(mut self) -> Result<Setup<'a, Detached>> {
        let GroupJoined {
            workspace,
            hierarchy,
            joined,
        } = self.state;
        let mount = SetupResource::HierarchyMount(hierarchy.mount_point().to_path_buf());

        if let Err(e) = self.ctx.tracker().unbind_hierarchy(hierarchy) {
            let setup = Setup {
                ctx: self.ctx,
                identity: self.identity,
                pid: self.pid,
                unwind: self.unwind,
                state: (),
            };
            return Err(setup.abort(e));
        }
        self.unwind.forget(&mount);

        Ok(Setup {
            ctx: self.ctx,
            identity: self.identity,
            pid: self.pid,
            unwind: self.unwind,
            state: Detached { workspace, joined },
        })
    }
}

impl<'a> Setup<'a, Detached> {
    pub fn create_snapshot(mut self, size_mib: u64) -> Result<Setup<'a, SnapshotCreated>> {
        let volumes = self.ctx.volumes;
        let identity = &self.identity;

        if let Err(e) = volumes.create_snapshot(
            identity.volume_group(),
            identity.volume(),
            identity.snapshot_name(),
            size_mib,
        ) {
            return Err(self.abort(e));
        }
        self.unwind.record(SetupResource::Snapshot {
            volume_group: self.identity.volume_group().to_string(),
            name: self.identity.snapshot_name().to_string(),
        });

        match volumes.list_volumes(self.identity.volume_group()) {
            Ok(names) => log::debug!(
                "Volumes in {}: {}",
                self.identity.volume_group(),
                names.join(", ")
            ),
            Err(e) => log::debug!("Could not list {}: {}", self.identity.volume_group(), e),
        }

        let Detached { workspace, joined } = self.state;
        Ok(Setup {
            ctx: self.ctx,
            identity: self.identity,
            pid: self.pid,
            unwind: self.unwind,
            state: SnapshotCreated { workspace, joined },
        })
    }
}

impl<'a> Setup<'a, SnapshotCreated> {
    /// Mount the snapshot read-only, probing the type when `fstype` is None
    pub fn mount_snapshot(mut self, fstype: Option<&str>) -> Result<Setup<'a, ExecReady>> {
        let target = self.state.workspace.volume_dir();
        let device = self.identity.snapshot_device();

        if let Err(e) = self.ctx.mounts.mount_readonly(&device, &target, fstype) {
            return Err(self.abort(e));
        }
        self.unwind.record(SetupResource::VolumeMount(target));

        let SnapshotCreated { workspace, joined } = self.state;
        Ok(Setup {
            ctx: self.ctx,
            identity: self.identity,
            pid: self.pid,
            unwind: self.unwind,
            state: ExecReady { workspace, joined },
        })
    }
}

impl<'a> Setup<'a, ExecReady> {
    pub fn workspace(&self) -> &Workspace {
        &self.state.workspace
    }

    pub fn group_path(&self) -> &str {
        self.state.joined.path()
    }

    /// Replace this process with `command` inside the mounted snapshot
    ///
    /// Only returns on failure, after unwinding. An empty command runs the
    /// user's shell.
    pub fn exec(self, command: &[String]) -> Result<Infallible> {
        self.exec_with(command, launch)
    }

    fn exec_with<F>(self, command: &[String], launcher: F) -> Result<Infallible>
    where
        F: FnOnce(&Path, &[String]) -> Result<Infallible>,
    {
        let argv = if command.is_empty() {
            vec![default_shell()]
        } else {
            command.to_vec()
        };

        let volume_dir = self.state.workspace.volume_dir();
        log::info!(
            "Running {:?} in {} (group {})",
            argv,
            volume_dir.display(),
            self.state.joined.path()
        );
        let err = match launcher(&volume_dir, &argv) {
            Ok(never) => match never {},
            Err(e) => e,
        };
        Err(self.abort(err))
    }

    /// Keep every resource and stop here; the tracked group's members own
    /// the lifecycle from now on and the release agent tears it down
    pub fn handoff(self) -> Handoff {
        log::info!(
            "Setup of {} complete; teardown left to the release agent",
            self.identity
        );
        Handoff {
            group_path: self.state.joined.path().to_string(),
            identity: self.identity,
            workspace: self.state.workspace,
            pid: self.pid,
        }
    }
}

/// `$SHELL`, else the login shell of the real user, else `/bin/sh`
pub fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.is_empty() {
            return shell;
        }
    }

    match nix::unistd::User::from_uid(nix::unistd::getuid()) {
        Ok(Some(user)) if !user.shell.as_os_str().is_empty() => {
            user.shell.to_string_lossy().into_owned()
        }
        _ => "/bin/sh".to_string(),
    }
}

/// `chdir` into `dir` and replace the process image with `argv`
///
/// On failure the working directory is back at `/`, off the mount point.
fn launch(dir: &Path, argv: &[String]) -> Result<Infallible> {
    std::env::set_current_dir(dir).map_err(|e| {
        LvpeekError::Process(format!("Failed to chdir to {}: {}", dir.display(), e))
    })?;

    let err = match exec_argv(argv) {
        Ok(never) => match never {},
        Err(e) => e,
    };

    if let Err(e) = std::env::set_current_dir("/") {
        log::warn!("Failed to leave {}: {}", dir.display(), e);
    }
    Err(err)
}

fn exec_argv(argv: &[String]) -> Result<Infallible> {
    let mut cargv = Vec::with_capacity(argv.len());
    for arg in argv {
        let c = CString::new(arg.as_str())
            .map_err(|_| LvpeekError::Config(format!("command contains NUL byte: {:?}", arg)))?;
        cargv.push(c);
    }
    let program = cargv
        .first()
        .ok_or_else(|| LvpeekError::Config("Empty command for exec".to_string()))?;

    nix::unistd::execvp(program.as_c_str(), &cargv)
        .map_err(|e| LvpeekError::Process(format!("execvp {:?} failed: {}", argv[0], e)))
}
