//! Fan-out of the VMM's serial stdout to multiple concurrent observers, and
//! fan-in of input from many writers back into the VMM's single stdin (spec
//! component C5).
//!
//! Grounded on `rust-firecracker-fctools`'s `ext::serial_console` (a task per
//! stdio stream forwarding lines into a channel, `Drop` aborting the task),
//! generalized per spec.md §9 from a single-reader channel to a
//! `tokio::sync::broadcast` bus so an arbitrary number of terminal clients
//! and the owning router can all observe the same stdout.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixListener, UnixStream,
    },
    process::{ChildStderr, ChildStdout},
    sync::{broadcast, Mutex, Notify},
    task::JoinHandle,
};

use crate::vmm::process_handle::RawPipes;

/// The VMM's stdin pipe in owned mode, or a re-attached client connection's
/// write half in attached mode (spec.md §9, re-attachment without an owned
/// child handle).
type StdinSink = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("the VMM's stdin pipe is closed")]
    StdinClosed,
    #[error("an I/O error occurred: `{0}`")]
    Io(#[from] std::io::Error),
}

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const BROADCAST_CAPACITY: usize = 1024;

type OwnerCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Owns a VMM child's stdio and a Unix-socket endpoint for additional
/// subscribers (terminal clients).
pub struct ConsoleMultiplexer {
    socket_path: PathBuf,
    stdin: Arc<Mutex<Option<StdinSink>>>,
    stdin_broken: Arc<AtomicBool>,
    broadcast_tx: broadcast::Sender<Bytes>,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stop_signal: Arc<Notify>,
    owns_socket: bool,
}

impl ConsoleMultiplexer {
    /// Spawns the stdout/stderr reader tasks and the client accept loop
    /// around `pipes`. `owner_callbacks` are invoked, in order, for every
    /// line read from stdout (the router's event-dispatch hook is the
    /// primary owner in this crate).
    pub async fn spawn(
        pipes: RawPipes,
        socket_path: PathBuf,
        owner_callbacks: Vec<OwnerCallback>,
    ) -> Result<Self, ConsoleError> {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let stdin: Arc<Mutex<Option<StdinSink>>> = Arc::new(Mutex::new(Some(Box::new(pipes.stdin))));
        let stdin_broken = Arc::new(AtomicBool::new(false));

        let stdout_task = spawn_stdout_reader(pipes.stdout, broadcast_tx.clone(), owner_callbacks);
        let stderr_task = spawn_stderr_logger(pipes.stderr);

        if tokio::fs::try_exists(&socket_path).await.unwrap_or(false) {
            tokio::fs::remove_file(&socket_path).await?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        let stop_signal = Arc::new(Notify::new());
        let accept_task = spawn_accept_loop(listener, stop_signal.clone(), stdin.clone(), stdin_broken.clone(), broadcast_tx.clone());

        Ok(Self {
            socket_path,
            stdin,
            stdin_broken,
            broadcast_tx,
            stdout_task,
            stderr_task,
            accept_task: Mutex::new(Some(accept_task)),
            stop_signal,
            owns_socket: true,
        })
    }

    /// Builds a multiplexer around an already-connected client socket
    /// instead of a child's stdio pipes, used when re-attaching to a VMM
    /// this control plane did not spawn (spec.md §9). The write half
    /// becomes the "stdin" sink and the read half is fanned out the same
    /// way owned stdout is; there is no accept loop since this side is the
    /// client, not the listener, so [`Self::stop`] does not unlink the
    /// socket file.
    pub fn from_client_connection(
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        socket_path: PathBuf,
        owner_callbacks: Vec<OwnerCallback>,
    ) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let stdin: Arc<Mutex<Option<StdinSink>>> = Arc::new(Mutex::new(Some(Box::new(write_half))));
        let stdin_broken = Arc::new(AtomicBool::new(false));

        let stdout_task = spawn_reader(read_half, broadcast_tx.clone(), owner_callbacks);
        let stderr_task = tokio::spawn(async {});

        Self {
            socket_path,
            stdin,
            stdin_broken,
            broadcast_tx,
            stdout_task,
            stderr_task,
            accept_task: Mutex::new(None),
            stop_signal: Arc::new(Notify::new()),
            owns_socket: false,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// A broadcast receiver observing every stdout line sent to clients.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.broadcast_tx.subscribe()
    }

    /// Send bytes to the VMM's stdin on behalf of the owning supervisor,
    /// without going through a client socket. One call is one atomic write.
    ///
    /// Fails fast: once a write to stdin errors, stdin is dropped and every
    /// subsequent call returns `StdinClosed` immediately without attempting
    /// another syscall (spec.md §9 Open Question 3).
    pub async fn write_input(&self, bytes: &[u8]) -> Result<(), ConsoleError> {
        write_serialized(&self.stdin, &self.stdin_broken, bytes).await
    }

    pub fn is_stdin_broken(&self) -> bool {
        self.stdin_broken.load(Ordering::Acquire)
    }

    /// Idempotent: closes the accept loop and unlinks the socket file.
    pub async fn stop(&self) {
        self.stop_signal.notify_one();
        if let Some(handle) = self.accept_task.lock().await.take() {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("console accept loop did not stop within deadline");
            }
        }
        if self.owns_socket {
            let _ = tokio::fs::remove_file(&self.socket_path).await;
        }
    }
}

impl Drop for ConsoleMultiplexer {
    fn drop(&mut self) {
        self.stdout_task.abort();
        self.stderr_task.abort();
    }
}

async fn write_serialized(
    stdin: &Arc<Mutex<Option<StdinSink>>>,
    stdin_broken: &Arc<AtomicBool>,
    bytes: &[u8],
) -> Result<(), ConsoleError> {
    let mut guard = stdin.lock().await;
    let Some(handle) = guard.as_mut() else {
        return Err(ConsoleError::StdinClosed);
    };

    if let Err(err) = handle.write_all(bytes).await {
        *guard = None;
        stdin_broken.store(true, Ordering::Release);
        return Err(ConsoleError::Io(err));
    }

    Ok(())
}

fn spawn_stdout_reader(
    stdout: ChildStdout,
    broadcast_tx: broadcast::Sender<Bytes>,
    owner_callbacks: Vec<OwnerCallback>,
) -> JoinHandle<()> {
    spawn_reader(stdout, broadcast_tx, owner_callbacks)
}

fn spawn_reader<R>(reader: R, broadcast_tx: broadcast::Sender<Bytes>, owner_callbacks: Vec<OwnerCallback>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    for callback in &owner_callbacks {
                        callback(&line);
                    }
                    let mut framed = line.into_bytes();
                    framed.push(b'\n');
                    let _ = broadcast_tx.send(Bytes::from(framed));
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(?err, "error reading VMM stdout");
                    break;
                }
            }
        }
    })
}

fn spawn_stderr_logger(stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(target: "vmm_stderr", "{line}");
        }
    })
}

fn spawn_accept_loop(
    listener: UnixListener,
    stop_signal: Arc<Notify>,
    stdin: Arc<Mutex<Option<StdinSink>>>,
    stdin_broken: Arc<AtomicBool>,
    broadcast_tx: broadcast::Sender<Bytes>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_signal.notified() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let stdin = stdin.clone();
                            let stdin_broken = stdin_broken.clone();
                            let broadcast_rx = broadcast_tx.subscribe();
                            tokio::spawn(handle_client(stream, stdin, stdin_broken, broadcast_rx));
                        }
                        Err(err) => tracing::warn!(?err, "console accept failed"),
                    }
                }
            }
        }
    })
}

async fn handle_client(
    stream: UnixStream,
    stdin: Arc<Mutex<Option<StdinSink>>>,
    stdin_broken: Arc<AtomicBool>,
    mut broadcast_rx: broadcast::Receiver<Bytes>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if write_serialized(&stdin, &stdin_broken, &buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        loop {
            match broadcast_rx.recv().await {
                Ok(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let _ = tokio::join!(reader, writer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::process::Command;

    async fn spawn_cat() -> RawPipes {
        let mut child = Command::new("cat")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        RawPipes {
            stdin: child.stdin.take().unwrap(),
            stdout: child.stdout.take().unwrap(),
            stderr: child.stderr.take().unwrap(),
        }
    }

    #[tokio::test]
    async fn owner_callback_and_broadcast_both_see_each_line() {
        let pipes = spawn_cat().await;
        let dir = tempfile::tempdir().unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let console = ConsoleMultiplexer::spawn(
            pipes,
            dir.path().join("console.sock"),
            vec![Box::new(move |_line| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            })],
        )
        .await
        .unwrap();

        let mut subscriber = console.subscribe();
        console.write_input(b"hello console\n").await.unwrap();

        let bytes = tokio::time::timeout(Duration::from_secs(2), subscriber.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bytes.as_ref(), b"hello console\n");
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        console.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let pipes = spawn_cat().await;
        let dir = tempfile::tempdir().unwrap();
        let console = ConsoleMultiplexer::spawn(pipes, dir.path().join("console.sock"), Vec::new())
            .await
            .unwrap();
        console.stop().await;
        console.stop().await;
    }

    #[tokio::test]
    async fn write_fails_fast_after_stdin_closes() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("exec 0<&-; sleep 5")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let pipes = RawPipes {
            stdin: child.stdin.take().unwrap(),
            stdout: child.stdout.take().unwrap(),
            stderr: child.stderr.take().unwrap(),
        };
        let dir = tempfile::tempdir().unwrap();
        let console = ConsoleMultiplexer::spawn(pipes, dir.path().join("console.sock"), Vec::new())
            .await
            .unwrap();

        // Closing stdin in the child races with this write; retry until the pipe breaks.
        for _ in 0..50 {
            if console.write_input(b"x\n").await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(console.is_stdin_broken());
        assert!(console.write_input(b"x\n").await.is_err());

        console.stop().await;
        let _ = child.kill().await;
    }
}
