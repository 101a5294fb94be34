//! Per-VM orchestration of the VMM process, console, router and vsock
//! listener (spec component C8): the state machine from spec.md §4.8 plus
//! the create/restore/shutdown pipelines.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tokio::sync::{mpsc, Mutex};

use crate::{
    agent_protocol::AgentRequest,
    console::ConsoleMultiplexer,
    router::{AgentSessionRouter, RouterError, SessionCallbacks},
    vmm::{
        api::VmmApiClient,
        arguments::{VmmApiSocket, VmmArguments},
        process::VmmProcess,
    },
    vsock::listener::VsockHostListener,
};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("expected VM state `{expected}`, but it was `{actual}`")]
    WrongState { expected: &'static str, actual: &'static str },
    #[error(transparent)]
    Vmm(#[from] crate::vmm::process::VmmProcessError),
    #[error(transparent)]
    Console(#[from] crate::console::ConsoleError),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("the VMM process died unexpectedly")]
    VmmProcessDied,
    #[error("restore could not recover from a missing snapshot backing file: `{0}`")]
    SnapshotRecoveryFailed(String),
}

/// Whether this supervisor owns the VMM child process directly, or is
/// re-attached to one spawned by an earlier control-plane instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorMode {
    Owned,
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmLifecycleState {
    Running,
    Paused,
    Stopped,
}

impl VmLifecycleState {
    fn name(self) -> &'static str {
        match self {
            VmLifecycleState::Running => "running",
            VmLifecycleState::Paused => "paused",
            VmLifecycleState::Stopped => "stopped",
        }
    }
}

/// Filesystem locations a supervisor needs, all derived deterministically
/// from the VM id (spec.md §3's "control-socket path ... derived
/// deterministically from id" invariant).
#[derive(Debug, Clone)]
pub struct SupervisorPaths {
    pub control_socket_path: PathBuf,
    pub console_socket_path: PathBuf,
    pub vsock_uds_path: Option<PathBuf>,
}

/// Orchestrates one VM's VMM process, console multiplexer, agent router,
/// and (if configured) vsock listener.
pub struct Supervisor {
    pub vm_id: String,
    mode: SupervisorMode,
    vmm: Mutex<VmmProcess>,
    console: Arc<ConsoleMultiplexer>,
    router: Arc<AgentSessionRouter>,
    vsock_listener: Option<Arc<VsockHostListener>>,
    state: Mutex<VmLifecycleState>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

impl Supervisor {
    /// Create pipeline, steps 1-5 of spec.md §4.8 (persisting the VM record
    /// is the caller's/`ControlPlane`'s responsibility, step 6).
    pub async fn create(
        vm_id: String,
        vmm_binary_path: &Path,
        paths: SupervisorPaths,
        cid: Option<u32>,
    ) -> Result<Self, SupervisorError> {
        let arguments = VmmArguments::new(VmmApiSocket::Enabled(paths.control_socket_path.clone()))
            .id(vm_id.clone());
        let mut vmm = VmmProcess::spawn(vmm_binary_path, &arguments, Some(paths.control_socket_path.clone())).await?;
        vmm.wait_for_socket(Duration::from_secs(5)).await?;
        vmm.mark_started();

        let pipes = vmm.take_pipes()?;

        let router = AgentSessionRouter::new();
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        let owner_callback: Box<dyn Fn(&str) + Send + Sync> = Box::new(move |line: &str| {
            let _ = line_tx.send(line.to_string());
        });

        let console = Arc::new(
            ConsoleMultiplexer::spawn(pipes, paths.console_socket_path.clone(), vec![owner_callback]).await?,
        );

        let dispatch_router = router.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                dispatch_router.dispatch_line(&line).await;
            }
        });

        let vsock_listener = match (&paths.vsock_uds_path, cid) {
            (Some(uds_path), Some(_)) => {
                let listener = Arc::new(VsockHostListener::new(uds_path, crate::vsock::protocol::DEFAULT_PORT));
                listener.start().await.map_err(|err| SupervisorError::Io(std::io::Error::other(err)))?;
                Some(listener)
            }
            _ => None,
        };

        Ok(Self {
            vm_id,
            mode: SupervisorMode::Owned,
            vmm: Mutex::new(vmm),
            console,
            router,
            vsock_listener,
            state: Mutex::new(VmLifecycleState::Running),
            dispatch_task,
        })
    }

    /// Re-attach to a VMM process this control plane did not spawn
    /// (spec.md §4.9): no child handle, stdin routes through the console's
    /// own client socket instead of the owned stdin pipe, and the agent
    /// readiness flag falls back to polling.
    pub async fn attach(
        vm_id: String,
        pid: u32,
        paths: SupervisorPaths,
        last_known_state: VmLifecycleState,
    ) -> Result<Self, SupervisorError> {
        let vmm = VmmProcess::attach(pid, Some(paths.control_socket_path.clone()))?;

        let console_client = tokio::net::UnixStream::connect(&paths.console_socket_path).await?;
        let (read_half, write_half) = console_client.into_split();
        let router = AgentSessionRouter::new();
        let reattached_console = Arc::new(crate::console::ConsoleMultiplexer::from_client_connection(
            read_half,
            write_half,
            paths.console_socket_path.clone(),
            Vec::new(),
        ));

        let dispatch_router = router.clone();
        let mut subscriber = reattached_console.subscribe();
        let dispatch_task = tokio::spawn(async move {
            loop {
                match subscriber.recv().await {
                    Ok(bytes) => {
                        let line = String::from_utf8_lossy(&bytes);
                        dispatch_router.dispatch_line(line.trim_end()).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let vsock_listener = paths
            .vsock_uds_path
            .as_ref()
            .map(|uds_path| Arc::new(VsockHostListener::new(uds_path, crate::vsock::protocol::DEFAULT_PORT)));

        Ok(Self {
            vm_id,
            mode: SupervisorMode::Attached,
            vmm: Mutex::new(vmm),
            console: reattached_console,
            router,
            vsock_listener,
            state: Mutex::new(last_known_state),
            dispatch_task,
        })
    }

    pub fn mode(&self) -> SupervisorMode {
        self.mode
    }

    pub async fn state(&self) -> VmLifecycleState {
        *self.state.lock().await
    }

    async fn ensure_state(&self, expected: VmLifecycleState) -> Result<(), SupervisorError> {
        let actual = *self.state.lock().await;
        if actual != expected {
            return Err(SupervisorError::WrongState {
                expected: expected.name(),
                actual: actual.name(),
            });
        }
        Ok(())
    }

    pub async fn configure_and_start(
        &self,
        kernel_path: &Path,
        boot_args: Option<String>,
        rootfs_path: &Path,
        vcpu: u32,
        mem_mib: u32,
        network: Option<(&str, &str, Option<String>)>,
        vsock: Option<(u32, &Path)>,
    ) -> Result<(), SupervisorError> {
        if self.mode != SupervisorMode::Owned {
            return Err(SupervisorError::WrongState {
                expected: "owned",
                actual: "attached",
            });
        }

        let mut vmm = self.vmm.lock().await;
        let mut api = VmmApiClient::new(&mut vmm);
        api.put_boot_source(kernel_path, boot_args).await?;
        api.put_drive("rootfs", rootfs_path, true, false).await?;
        api.put_machine_config(vcpu, mem_mib).await?;
        if let Some((iface_id, host_dev_name, guest_mac)) = network {
            api.put_network_interface(iface_id, host_dev_name, guest_mac).await?;
        }
        if let Some((cid, uds_path)) = vsock {
            api.put_vsock(cid, uds_path).await?;
        }
        api.instance_start().await?;
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), SupervisorError> {
        self.ensure_state(VmLifecycleState::Running).await?;
        self.vmm.lock().await.pause_via_api().await?;
        *self.state.lock().await = VmLifecycleState::Paused;
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SupervisorError> {
        self.ensure_state(VmLifecycleState::Paused).await?;
        self.vmm.lock().await.resume_via_api().await?;
        *self.state.lock().await = VmLifecycleState::Running;
        Ok(())
    }

    pub async fn snapshot(&self, snapshot_path: &Path, mem_path: &Path) -> Result<(), SupervisorError> {
        let was_running = self.state().await == VmLifecycleState::Running;
        if was_running {
            self.pause().await?;
        }
        {
            let mut vmm = self.vmm.lock().await;
            let mut api = VmmApiClient::new(&mut vmm);
            api.create_snapshot(snapshot_path, mem_path).await?;
        }
        if was_running {
            self.resume().await?;
        }
        Ok(())
    }

    /// Shutdown: SIGTERM the VMM, wait with a deadline, SIGKILL on expiry;
    /// stop the console and vsock listener. Does not release allocator
    /// resources — that is `ControlPlane::delete_vm`'s job, since the
    /// allocators outlive any single supervisor.
    pub async fn shutdown(&self, sigterm_deadline: Duration) -> Result<(), SupervisorError> {
        {
            let mut vmm = self.vmm.lock().await;
            vmm.send_sigterm()?;
            if tokio::time::timeout(sigterm_deadline, vmm.wait_for_exit()).await.is_err() {
                vmm.send_sigkill()?;
                let _ = vmm.wait_for_exit().await;
            }
        }

        self.console.stop().await;
        if let Some(listener) = &self.vsock_listener {
            listener.stop().await;
        }
        *self.state.lock().await = VmLifecycleState::Stopped;
        Ok(())
    }

    pub fn console(&self) -> &Arc<ConsoleMultiplexer> {
        &self.console
    }

    pub fn router(&self) -> &Arc<AgentSessionRouter> {
        &self.router
    }

    /// The VMM child's OS pid, for persistence into the VM record (spec.md
    /// §3's "pid persisted per VM", needed for re-attachment after a
    /// control-plane restart). `None` once the process has been waited on.
    pub async fn pid(&self) -> Option<u32> {
        self.vmm.lock().await.pid()
    }

    pub async fn wait_for_agent(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let poll = self.mode == SupervisorMode::Attached;
        self.router.wait_for_agent(timeout, poll).await.map_err(Into::into)
    }

    pub async fn exec(
        &self,
        cmd_id: impl Into<String>,
        command: impl Into<String>,
        background: bool,
        timeout: Duration,
        callbacks: SessionCallbacks,
    ) -> Result<i32, SupervisorError> {
        let request = AgentRequest::Exec {
            cmd_id: cmd_id.into(),
            command: command.into(),
            background,
            env: Default::default(),
        };
        self.router
            .send_request(&self.console, request, callbacks, timeout)
            .await
            .map_err(Into::into)
    }

    pub async fn start_pty_session(
        &self,
        cmd_id: impl Into<String>,
        command: impl Into<String>,
        cols: u16,
        rows: u16,
        timeout: Duration,
        callbacks: SessionCallbacks,
    ) -> Result<i32, SupervisorError> {
        let request = AgentRequest::PtyExec {
            cmd_id: cmd_id.into(),
            command: command.into(),
            cols,
            rows,
            env: Default::default(),
        };
        self.router
            .send_request(&self.console, request, callbacks, timeout)
            .await
            .map_err(Into::into)
    }

    pub async fn kill_session(&self, id: impl Into<String>) -> Result<(), SupervisorError> {
        let mut line = serde_json::to_vec(&AgentRequest::Kill { id: id.into() }).expect("serializes");
        line.push(b'\n');
        self.console.write_input(&line).await.map_err(Into::into)
    }

    pub async fn send_session_input(&self, id: impl Into<String>, data: impl Into<String>) -> Result<(), SupervisorError> {
        let mut line = serde_json::to_vec(&AgentRequest::Input {
            id: id.into(),
            data: data.into(),
            encoding: None,
        })
        .expect("serializes");
        line.push(b'\n');
        self.console.write_input(&line).await.map_err(Into::into)
    }

    pub async fn resize_session(&self, id: impl Into<String>, cols: u16, rows: u16) -> Result<(), SupervisorError> {
        let mut line = serde_json::to_vec(&AgentRequest::Resize {
            id: id.into(),
            cols,
            rows,
        })
        .expect("serializes");
        line.push(b'\n');
        self.console.write_input(&line).await.map_err(Into::into)
    }

    pub async fn read_file(
        &self,
        cmd_id: impl Into<String>,
        path: impl Into<String>,
        timeout: Duration,
        callbacks: SessionCallbacks,
    ) -> Result<i32, SupervisorError> {
        let request = AgentRequest::ReadFile {
            cmd_id: cmd_id.into(),
            path: path.into(),
        };
        self.router
            .send_request(&self.console, request, callbacks, timeout)
            .await
            .map_err(Into::into)
    }

    pub async fn write_file(
        &self,
        cmd_id: impl Into<String>,
        path: impl Into<String>,
        content_base64: impl Into<String>,
        append: bool,
        timeout: Duration,
    ) -> Result<i32, SupervisorError> {
        let request = AgentRequest::WriteFile {
            cmd_id: cmd_id.into(),
            path: path.into(),
            content: content_base64.into(),
            append,
        };
        self.router
            .send_request(&self.console, request, SessionCallbacks::default(), timeout)
            .await
            .map_err(Into::into)
    }

    pub async fn list_dir(
        &self,
        cmd_id: impl Into<String>,
        path: impl Into<String>,
        timeout: Duration,
        callbacks: SessionCallbacks,
    ) -> Result<i32, SupervisorError> {
        let request = AgentRequest::ListDir {
            cmd_id: cmd_id.into(),
            path: path.into(),
        };
        self.router
            .send_request(&self.console, request, callbacks, timeout)
            .await
            .map_err(Into::into)
    }

    pub async fn file_info(
        &self,
        cmd_id: impl Into<String>,
        path: impl Into<String>,
        timeout: Duration,
        callbacks: SessionCallbacks,
    ) -> Result<i32, SupervisorError> {
        let request = AgentRequest::FileInfo {
            cmd_id: cmd_id.into(),
            path: path.into(),
        };
        self.router
            .send_request(&self.console, request, callbacks, timeout)
            .await
            .map_err(Into::into)
    }

    /// Register an upload destination with the vsock listener ahead of the
    /// guest's `read_file`-triggered vsock upload.
    pub async fn register_pending_upload(&self, cmd_id: impl Into<String>, local_path: PathBuf) {
        if let Some(listener) = &self.vsock_listener {
            listener.register_pending_upload(cmd_id, local_path).await;
        }
    }

    /// Pushes a local file to the guest. There is no guest-initiated vsock
    /// path for this direction (the VMM only routes guest-initiated
    /// connections), so this always goes over the console as a single
    /// `write_file` request.
    pub async fn upload_file(
        &self,
        cmd_id: impl Into<String>,
        local_path: impl AsRef<Path>,
        remote_path: impl Into<String>,
        append: bool,
        timeout: Duration,
    ) -> Result<i32, SupervisorError> {
        let bytes = tokio::fs::read(local_path.as_ref()).await?;
        self.write_file(cmd_id, remote_path, BASE64.encode(bytes), append, timeout).await
    }

    /// Pulls a file from the guest to `local_path`. Registers a pending
    /// upload so that if the guest's `read_file` handler manages to open a
    /// vsock connection, the listener writes the bytes straight to
    /// `local_path` instead of round-tripping them through the console.
    pub async fn download_file(
        &self,
        cmd_id: impl Into<String>,
        remote_path: impl Into<String>,
        local_path: PathBuf,
        timeout: Duration,
        callbacks: SessionCallbacks,
    ) -> Result<i32, SupervisorError> {
        let cmd_id = cmd_id.into();
        self.register_pending_upload(cmd_id.clone(), local_path).await;
        let result = self.read_file(cmd_id.clone(), remote_path, timeout, callbacks).await;
        if let Some(listener) = &self.vsock_listener {
            listener.unregister_pending_upload(&cmd_id).await;
        }
        result
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}

/// Helpers on `VmmProcess` used only by the supervisor's pause/resume path,
/// to keep `VmmApiClient` borrows scoped tightly.
trait ApiConvenience {
    fn pause_via_api(&mut self) -> impl std::future::Future<Output = Result<(), crate::vmm::process::VmmProcessError>> + Send;
    fn resume_via_api(&mut self) -> impl std::future::Future<Output = Result<(), crate::vmm::process::VmmProcessError>> + Send;
}

impl ApiConvenience for VmmProcess {
    async fn pause_via_api(&mut self) -> Result<(), crate::vmm::process::VmmProcessError> {
        VmmApiClient::new(self).pause().await
    }

    async fn resume_via_api(&mut self) -> Result<(), crate::vmm::process::VmmProcessError> {
        VmmApiClient::new(self).resume().await
    }
}

/// Restore pipeline (spec.md §4.8, "Restore pipeline (subtle)"), a direct
/// translation of `bandsox/core.py::restore_vm`'s missing-backing-file
/// recovery dance.
pub struct RestoreOutcome {
    pub supervisor: Supervisor,
    pub recovered_missing_backing_file: bool,
}

pub async fn restore(
    vm_id: String,
    vmm_binary_path: &Path,
    paths: SupervisorPaths,
    snapshot_path: &Path,
    mem_path: &Path,
    instance_rootfs_path: &Path,
) -> Result<RestoreOutcome, SupervisorError> {
    let arguments = VmmArguments::new(VmmApiSocket::Enabled(paths.control_socket_path.clone())).id(vm_id.clone());
    let mut vmm = VmmProcess::spawn(vmm_binary_path, &arguments, Some(paths.control_socket_path.clone())).await?;
    vmm.wait_for_socket(Duration::from_secs(5)).await?;
    vmm.mark_started();

    let mut recovered = false;
    let load_result = {
        let mut api = VmmApiClient::new(&mut vmm);
        api.load_snapshot(snapshot_path, mem_path).await
    };

    if let Err(crate::vmm::process::VmmProcessError::ApiRespondedWithFault { fault_message, .. }) = &load_result {
        let missing_path = parse_missing_backing_file(fault_message).ok_or_else(|| {
            SupervisorError::SnapshotRecoveryFailed(fault_message.clone())
        })?;

        tokio::fs::remove_file(&missing_path).await.ok();
        if let Some(parent) = Path::new(&missing_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::symlink(instance_rootfs_path, &missing_path).await?;

        let pipes = vmm.take_pipes()?;
        drop(pipes);
        vmm.send_sigkill().ok();
        let _ = vmm.wait_for_exit().await;

        vmm = VmmProcess::spawn(vmm_binary_path, &arguments, Some(paths.control_socket_path.clone())).await?;
        vmm.wait_for_socket(Duration::from_secs(5)).await?;
        vmm.mark_started();

        {
            let mut api = VmmApiClient::new(&mut vmm);
            api.load_snapshot(snapshot_path, mem_path).await?;
            api.patch_drive("rootfs", instance_rootfs_path).await?;
        }
        tokio::fs::remove_file(&missing_path).await.ok();
        recovered = true;
    } else {
        load_result?;
    }

    let pipes = vmm.take_pipes()?;
    let router = AgentSessionRouter::new();
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let owner_callback: Box<dyn Fn(&str) + Send + Sync> = Box::new(move |line: &str| {
        let _ = line_tx.send(line.to_string());
    });
    let console = Arc::new(ConsoleMultiplexer::spawn(pipes, paths.console_socket_path.clone(), vec![owner_callback]).await?);
    let dispatch_router = router.clone();
    let dispatch_task = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            dispatch_router.dispatch_line(&line).await;
        }
    });

    let vsock_listener = match &paths.vsock_uds_path {
        Some(uds_path) => {
            let listener = Arc::new(VsockHostListener::new(uds_path, crate::vsock::protocol::DEFAULT_PORT));
            listener.start().await.map_err(|err| SupervisorError::Io(std::io::Error::other(err)))?;
            Some(listener)
        }
        None => None,
    };

    let supervisor = Supervisor {
        vm_id,
        mode: SupervisorMode::Owned,
        vmm: Mutex::new(vmm),
        console,
        router,
        vsock_listener,
        state: Mutex::new(VmLifecycleState::Paused),
        dispatch_task,
    };
    supervisor.resume().await?;

    Ok(RestoreOutcome {
        supervisor,
        recovered_missing_backing_file: recovered,
    })
}

/// Extracts the missing-file path out of Firecracker's
/// `No such file or directory (os error 2) <path>`-shaped fault message,
/// matching the regex `bandsox/core.py::restore_vm` matches against.
fn parse_missing_backing_file(fault_message: &str) -> Option<String> {
    let marker = "No such file or directory (os error 2) ";
    let start = fault_message.find(marker)? + marker.len();
    let rest = &fault_message[start..];
    let end = rest.find('"').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_missing_backing_file_path_from_fault_message() {
        let message = r#"Drive's backing file does not exist: No such file or directory (os error 2) "/old/rootfs.ext4""#;
        assert_eq!(parse_missing_backing_file(message), Some("/old/rootfs.ext4".to_string()));
    }

    #[test]
    fn returns_none_for_unrelated_fault_messages() {
        assert_eq!(parse_missing_backing_file("machine config is invalid"), None);
    }
}
