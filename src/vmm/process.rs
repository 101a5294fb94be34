//! Spawns and tracks a single Firecracker-class VMM process, and gives it an
//! HTTP-over-Unix-socket client for the control API.

use std::{path::PathBuf, process::ExitStatus};

use bytes::{Bytes, BytesMut};
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Incoming};
use hyper_client_sockets::{HyperUnixConnector, UnixUriExt};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use nix::unistd::Pid;
use tokio::{process::Command, sync::OnceCell};

use super::{
    arguments::VmmArguments,
    process_handle::{ProcessHandle, RawPipes, RawPipesError},
};

/// The lifecycle state of the VMM process itself (distinct from the VM
/// lifecycle state owned by `Supervisor`: a VMM can be `Started` with no
/// device configured yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmProcessState {
    AwaitingStart,
    Started,
    Exited,
    Crashed(ExitStatus),
}

impl std::fmt::Display for VmmProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmmProcessState::AwaitingStart => write!(f, "awaiting start"),
            VmmProcessState::Started => write!(f, "started"),
            VmmProcessState::Exited => write!(f, "exited"),
            VmmProcessState::Crashed(status) => write!(f, "crashed with {status}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VmmProcessError {
    #[error("expected the VMM process to have state `{expected}`, but it had `{actual}`")]
    ExpectedState {
        expected: VmmProcessState,
        actual: VmmProcessState,
    },
    #[error("spawning the VMM process failed: `{0}`")]
    SpawnFailed(std::io::Error),
    #[error("the API socket never appeared within the deadline")]
    SocketWaitTimedOut,
    #[error("building the API request failed: `{0}`")]
    RequestNotBuilt(http::Error),
    #[error("the API socket path could not be turned into a Unix request URI")]
    IncorrectSocketUri,
    #[error("the HTTP connection to the VMM API socket failed: `{0}`")]
    HyperClientFailed(hyper_util::client::legacy::Error),
    #[error("reading the API response body failed: `{0}`")]
    ResponseBodyFailed(hyper::Error),
    #[error("the VMM API responded with a non-success status `{status}`: `{fault_message}`")]
    ApiRespondedWithFault { status: http::StatusCode, fault_message: String },
    #[error("taking the process's pipes failed: `{0}`")]
    PipesUnavailable(#[from] RawPipesError),
    #[error("sending a signal to the process failed: `{0}`")]
    SignalFailed(std::io::Error),
    #[error("waiting on the process failed: `{0}`")]
    WaitFailed(std::io::Error),
}

/// A running (or formerly running) Firecracker-class VMM process.
pub struct VmmProcess {
    handle: ProcessHandle,
    socket_path: Option<PathBuf>,
    hyper_client: OnceCell<Client<HyperUnixConnector, Full<Bytes>>>,
    state: VmmProcessState,
}

impl VmmProcess {
    /// Spawn a fresh VMM process owned by this control plane.
    pub async fn spawn(
        binary_path: impl AsRef<std::path::Path>,
        arguments: &VmmArguments,
        socket_path: Option<PathBuf>,
    ) -> Result<Self, VmmProcessError> {
        let child = Command::new(binary_path.as_ref())
            .args(arguments.join())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(VmmProcessError::SpawnFailed)?;

        Ok(Self {
            handle: ProcessHandle::attached(child),
            socket_path,
            hyper_client: OnceCell::new(),
            state: VmmProcessState::AwaitingStart,
        })
    }

    /// Re-attach to a VMM process spawned by an earlier control plane
    /// instance, tracked only by its recorded PID.
    pub fn attach(pid: u32, socket_path: Option<PathBuf>) -> Result<Self, VmmProcessError> {
        let handle = ProcessHandle::detached(Pid::from_raw(pid as i32))
            .map_err(VmmProcessError::SpawnFailed)?;
        Ok(Self {
            handle,
            socket_path,
            hyper_client: OnceCell::new(),
            state: VmmProcessState::Started,
        })
    }

    pub fn is_reattached(&self) -> bool {
        self.handle.is_detached()
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn mark_started(&mut self) {
        self.state = VmmProcessState::Started;
    }

    /// Waits (with a short poll) for the API socket to appear on disk.
    pub async fn wait_for_socket(&self, deadline: std::time::Duration) -> Result<(), VmmProcessError> {
        let Some(ref socket_path) = self.socket_path else {
            return Ok(());
        };
        let start = tokio::time::Instant::now();
        loop {
            if tokio::fs::try_exists(socket_path).await.unwrap_or(false) {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                return Err(VmmProcessError::SocketWaitTimedOut);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    pub async fn send_api_request(
        &mut self,
        route: impl AsRef<str>,
        mut request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, VmmProcessError> {
        self.ensure_state(VmmProcessState::Started)?;
        let socket_path = self
            .socket_path
            .clone()
            .ok_or_else(|| VmmProcessError::IncorrectSocketUri)?;

        let hyper_client = self
            .hyper_client
            .get_or_init(|| async { Client::builder(TokioExecutor::new()).build(HyperUnixConnector) })
            .await;

        *request.uri_mut() =
            Uri::unix(&socket_path, route).map_err(|_| VmmProcessError::IncorrectSocketUri)?;

        hyper_client
            .request(request)
            .await
            .map_err(VmmProcessError::HyperClientFailed)
    }

    pub fn take_pipes(&mut self) -> Result<RawPipes, VmmProcessError> {
        Ok(self.handle.take_pipes()?)
    }

    pub fn send_sigkill(&mut self) -> Result<(), VmmProcessError> {
        self.handle.kill().map_err(VmmProcessError::SignalFailed)
    }

    pub fn send_sigterm(&mut self) -> Result<(), VmmProcessError> {
        self.handle.terminate().map_err(VmmProcessError::SignalFailed)
    }

    pub async fn wait_for_exit(&mut self) -> Result<ExitStatus, VmmProcessError> {
        self.handle.wait().await.map_err(VmmProcessError::WaitFailed)
    }

    pub fn state(&mut self) -> VmmProcessState {
        self.update_state();
        self.state
    }

    fn update_state(&mut self) {
        if matches!(self.state, VmmProcessState::Exited | VmmProcessState::Crashed(_)) {
            return;
        }
        if let Ok(Some(exit_status)) = self.handle.try_wait() {
            self.state = if exit_status.success() {
                VmmProcessState::Exited
            } else {
                VmmProcessState::Crashed(exit_status)
            };
        }
    }

    fn ensure_state(&mut self, expected: VmmProcessState) -> Result<(), VmmProcessError> {
        if self.state() != expected {
            return Err(VmmProcessError::ExpectedState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

/// Extension for streaming a VMM API response body, mirroring the common
/// pattern of slurping a small JSON body in full.
pub trait HyperResponseExt: Send {
    fn recv_to_buf(&mut self) -> impl std::future::Future<Output = Result<BytesMut, hyper::Error>> + Send;

    fn recv_to_string(&mut self) -> impl std::future::Future<Output = Result<String, hyper::Error>> + Send {
        async {
            let buf = self.recv_to_buf().await?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        }
    }
}

impl HyperResponseExt for Response<Incoming> {
    async fn recv_to_buf(&mut self) -> Result<BytesMut, hyper::Error> {
        let mut buf = BytesMut::with_capacity(self.body().size_hint().lower() as usize);
        while let Some(frame) = self.frame().await {
            if let Ok(bytes) = frame?.into_data() {
                buf.extend(bytes);
            }
        }
        Ok(buf)
    }
}
