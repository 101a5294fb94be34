//! In-guest agent binary (spec component C6): reads newline-delimited JSON
//! [`AgentRequest`]s from stdin and writes [`AgentEvent`]s to stdout over the
//! serial console. Runs inside the microVM's rootfs, not linked into the
//! host-side library.
//!
//! Direct port of `bandsox/agent.py`'s handler set: `exec`, `pty_exec`,
//! `input`, `resize`, `kill`, `read_file` (vsock-initiated upload with
//! console-chunked fallback), `write_file`, `list_dir`, `file_info`.

use std::{
    collections::HashMap,
    future::Future,
    os::unix::fs::PermissionsExt,
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bandsox::{
    agent_protocol::{AgentEvent, AgentRequest, DirEntry, CONSOLE_CHUNK_DELAY_MS, CONSOLE_CHUNK_SIZE},
    vsock::protocol::{decode_message, encode_message, Request, Response},
};
use md5::{Digest, Md5};
use nix::{sys::signal::Signal, unistd::Pid};
use portable_pty::{native_pty_system, Child as _, CommandBuilder, MasterPty, PtySize, PtySystem as _};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::Mutex,
};
use tokio_vsock::{VsockAddr, VsockStream, VMADDR_CID_HOST};

const DEFAULT_VSOCK_PORT: u32 = 9000;

#[derive(Debug, thiserror::Error)]
enum AgentHandlerError {
    #[error("an I/O error occurred: `{0}`")]
    Io(#[from] std::io::Error),
    #[error("invalid base64 payload: `{0}`")]
    Base64(#[from] base64::DecodeError),
    #[error("malformed protocol message: `{0}`")]
    Json(#[from] serde_json::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Remote(String),
    #[error("vsock connection closed before a response arrived")]
    VsockClosed,
    #[error("pty error: `{0}`")]
    Pty(String),
}

/// One running command session, keyed by `cmd_id`. Registered only for
/// `background` exec and `pty_exec`, since those are the only requests a
/// later `input`/`resize`/`kill` can target.
enum SessionKind {
    Process {
        pid: u32,
        stdin: Mutex<Option<ChildStdin>>,
    },
    Pty {
        pid: u32,
        writer: std::sync::Mutex<Box<dyn std::io::Write + Send>>,
        master: std::sync::Mutex<Box<dyn MasterPty + Send>>,
    },
}

type Sessions = Arc<Mutex<HashMap<String, SessionKind>>>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let vsock_port: u32 = std::env::var("BANDSOX_VSOCK_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_VSOCK_PORT);

    send_event(&AgentEvent::ready());

    let sessions: Sessions = Arc::new(Mutex::new(HashMap::new()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(?err, "error reading stdin, shutting down");
                break;
            }
        };

        // Boot noise and other non-JSON console chatter is benign; ignore it.
        let value: serde_json::Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(_) => continue,
        };

        let request: AgentRequest = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(err) => {
                match value.get("cmd_id").or_else(|| value.get("id")).and_then(|v| v.as_str()) {
                    Some(cmd_id) => send_event(&AgentEvent::error(cmd_id, format!("invalid request: {err}"))),
                    None => tracing::warn!(%err, "malformed request with no cmd_id, dropping"),
                }
                continue;
            }
        };

        tokio::spawn(dispatch(request, sessions.clone(), vsock_port));
    }
}

fn send_event(event: &AgentEvent) {
    let json = serde_json::to_string(event).expect("agent events always serialize");
    use std::io::Write as _;
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{json}");
    let _ = stdout.flush();
}

async fn dispatch(request: AgentRequest, sessions: Sessions, vsock_port: u32) {
    match request {
        AgentRequest::Exec {
            cmd_id,
            command,
            background,
            env,
        } => {
            if background {
                spawn_background_exec(cmd_id, command, env, sessions).await;
            } else {
                run_terminal(&cmd_id, foreground_exec(&cmd_id, command, env)).await;
            }
        }
        AgentRequest::PtyExec {
            cmd_id,
            command,
            cols,
            rows,
            env,
        } => spawn_pty_exec(cmd_id, command, cols, rows, env, sessions).await,
        AgentRequest::Input { id, data, encoding } => handle_input(&id, data, encoding, &sessions).await,
        AgentRequest::Resize { id, cols, rows } => handle_resize(&id, cols, rows, &sessions).await,
        AgentRequest::Kill { id } => handle_kill(&id, &sessions).await,
        AgentRequest::ReadFile { cmd_id, path } => run_terminal(&cmd_id, read_file(&cmd_id, path, vsock_port)).await,
        AgentRequest::WriteFile {
            cmd_id,
            path,
            content,
            append,
        } => run_terminal(&cmd_id, write_file(&cmd_id, path, content, append)).await,
        AgentRequest::ListDir { cmd_id, path } => run_terminal(&cmd_id, list_dir(&cmd_id, path)).await,
        AgentRequest::FileInfo { cmd_id, path } => run_terminal(&cmd_id, file_info(&cmd_id, path)).await,
    }
}

/// Runs a one-shot handler to completion and emits its terminal event: no
/// handler reachable through this path can forget to send exactly one
/// `exit`, optionally preceded by one `error`.
async fn run_terminal(cmd_id: &str, handler: impl Future<Output = Result<i32, AgentHandlerError>>) {
    match handler.await {
        Ok(exit_code) => send_event(&AgentEvent::exit(cmd_id, exit_code)),
        Err(err) => {
            send_event(&AgentEvent::error(cmd_id, err.to_string()));
            send_event(&AgentEvent::exit(cmd_id, 1));
        }
    }
}

async fn stream_lines<R: AsyncRead + Unpin>(reader: R, cmd_id: String, stream: &'static str) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        send_event(&AgentEvent::Output {
            cmd_id: cmd_id.clone(),
            stream: stream.to_string(),
            data: line,
        });
    }
}

async fn foreground_exec(cmd_id: &str, command: String, env: HashMap<String, String>) -> Result<i32, AgentHandlerError> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .envs(&env)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let out_task = tokio::spawn(stream_lines(stdout, cmd_id.to_string(), "stdout"));
    let err_task = tokio::spawn(stream_lines(stderr, cmd_id.to_string(), "stderr"));
    let _ = tokio::join!(out_task, err_task);

    let status = child.wait().await?;
    Ok(status.code().unwrap_or(-1))
}

async fn spawn_background_exec(cmd_id: String, command: String, env: HashMap<String, String>, sessions: Sessions) {
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(&command)
        .envs(&env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(err) => {
            send_event(&AgentEvent::error(&cmd_id, format!("{err}")));
            return;
        }
    };

    let pid = child.id().unwrap_or(0);
    let stdin = child.stdin.take();
    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    sessions.lock().await.insert(
        cmd_id.clone(),
        SessionKind::Process {
            pid,
            stdin: Mutex::new(stdin),
        },
    );

    tokio::spawn(stream_lines(stdout, cmd_id.clone(), "stdout"));
    tokio::spawn(stream_lines(stderr, cmd_id.clone(), "stderr"));

    send_event(&AgentEvent::Status {
        cmd_id: Some(cmd_id.clone()),
        status: "started".to_string(),
        pid: Some(pid),
        size: None,
        mode: None,
        mtime: None,
    });

    let sessions = sessions.clone();
    tokio::spawn(async move {
        let status = child.wait().await;
        sessions.lock().await.remove(&cmd_id);
        let exit_code = status.ok().and_then(|status| status.code()).unwrap_or(-1);
        send_event(&AgentEvent::exit(cmd_id, exit_code));
    });
}

fn open_pty(
    command: String,
    cols: u16,
    rows: u16,
    env: HashMap<String, String>,
) -> Result<
    (
        Box<dyn MasterPty + Send>,
        Box<dyn std::io::Read + Send>,
        Box<dyn std::io::Write + Send>,
        Box<dyn portable_pty::Child + Send + Sync>,
    ),
    AgentHandlerError,
> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| AgentHandlerError::Pty(err.to_string()))?;

    let mut builder = CommandBuilder::new("/bin/sh");
    builder.arg("-c");
    builder.arg(&command);
    for (key, value) in &env {
        builder.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| AgentHandlerError::Pty(err.to_string()))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| AgentHandlerError::Pty(err.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|err| AgentHandlerError::Pty(err.to_string()))?;

    Ok((pair.master, reader, writer, child))
}

async fn spawn_pty_exec(cmd_id: String, command: String, cols: u16, rows: u16, env: HashMap<String, String>, sessions: Sessions) {
    let opened = tokio::task::spawn_blocking(move || open_pty(command, cols, rows, env))
        .await
        .expect("pty setup task panicked");

    let (master, reader, writer, mut child) = match opened {
        Ok(parts) => parts,
        Err(err) => {
            send_event(&AgentEvent::error(&cmd_id, err.to_string()));
            return;
        }
    };

    let pid = child.process_id().unwrap_or(0);
    sessions.lock().await.insert(
        cmd_id.clone(),
        SessionKind::Pty {
            pid,
            writer: std::sync::Mutex::new(writer),
            master: std::sync::Mutex::new(master),
        },
    );

    let reader_cmd_id = cmd_id.clone();
    std::thread::spawn(move || read_pty_master(reader, reader_cmd_id));

    send_event(&AgentEvent::Status {
        cmd_id: Some(cmd_id.clone()),
        status: "started".to_string(),
        pid: Some(pid),
        size: None,
        mode: None,
        mtime: None,
    });

    let sessions = sessions.clone();
    tokio::spawn(async move {
        let status = tokio::task::spawn_blocking(move || child.wait()).await;
        sessions.lock().await.remove(&cmd_id);
        let exit_code = match status {
            Ok(Ok(status)) => status.exit_code() as i32,
            _ => -1,
        };
        send_event(&AgentEvent::exit(cmd_id, exit_code));
    });
}

/// Runs on a dedicated OS thread: `portable_pty`'s reader is a blocking
/// `std::io::Read`, not an async one.
fn read_pty_master(mut reader: Box<dyn std::io::Read + Send>, cmd_id: String) {
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => send_event(&AgentEvent::Output {
                cmd_id: cmd_id.clone(),
                stream: "stdout".to_string(),
                data: BASE64.encode(&buf[..n]),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

async fn handle_input(id: &str, data: String, encoding: Option<String>, sessions: &Sessions) {
    let mut sessions = sessions.lock().await;
    let Some(session) = sessions.get_mut(id) else {
        send_event(&AgentEvent::error(id, "Session not found"));
        return;
    };

    let bytes = if encoding.as_deref() == Some("base64") {
        match BASE64.decode(data.as_bytes()) {
            Ok(bytes) => bytes,
            Err(err) => {
                send_event(&AgentEvent::error(id, format!("Write failed: {err}")));
                return;
            }
        }
    } else {
        data.into_bytes()
    };

    let result: Result<(), String> = match session {
        SessionKind::Process { stdin, .. } => match stdin.lock().await.as_mut() {
            Some(stdin) => stdin.write_all(&bytes).await.map_err(|err| err.to_string()),
            None => Err("stdin is closed".to_string()),
        },
        SessionKind::Pty { writer, .. } => writer.lock().unwrap().write_all(&bytes).map_err(|err| err.to_string()),
    };

    if let Err(err) = result {
        send_event(&AgentEvent::error(id, format!("Write failed: {err}")));
    }
}

async fn handle_resize(id: &str, cols: u16, rows: u16, sessions: &Sessions) {
    let sessions = sessions.lock().await;
    let Some(SessionKind::Pty { master, .. }) = sessions.get(id) else {
        return;
    };

    let result = master.lock().unwrap().resize(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    });
    if let Err(err) = result {
        send_event(&AgentEvent::error(id, format!("Resize failed: {err}")));
    }
}

async fn handle_kill(id: &str, sessions: &Sessions) {
    let sessions = sessions.lock().await;
    let Some(session) = sessions.get(id) else {
        send_event(&AgentEvent::error(id, "Session not found"));
        return;
    };

    let pid = match session {
        SessionKind::Process { pid, .. } => *pid,
        SessionKind::Pty { pid, .. } => *pid,
    };

    if let Err(err) = nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        send_event(&AgentEvent::error(id, format!("Kill failed: {err}")));
    }
}

async fn read_file(cmd_id: &str, path: String, vsock_port: u32) -> Result<i32, AgentHandlerError> {
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(AgentHandlerError::NotFound(path));
    }

    match vsock_upload(cmd_id, &path, vsock_port).await {
        Ok(size) => {
            send_event(&AgentEvent::Status {
                cmd_id: Some(cmd_id.to_string()),
                status: "uploaded".to_string(),
                pid: None,
                size: Some(size),
                mode: None,
                mtime: None,
            });
            Ok(0)
        }
        Err(err) => {
            tracing::warn!(%err, "vsock upload failed, falling back to console transfer");
            console_read_file(cmd_id, &path).await
        }
    }
}

async fn vsock_upload(cmd_id: &str, path: &str, port: u32) -> Result<u64, AgentHandlerError> {
    let data = tokio::fs::read(path).await?;
    let size = data.len() as u64;
    let checksum = format!("{:x}", Md5::digest(&data));

    let addr = VsockAddr::new(VMADDR_CID_HOST, port);
    let stream = VsockStream::connect(addr).await?;
    let mut conn = BufReader::new(stream);

    write_vsock_message(
        &mut conn,
        &Request::Upload {
            path: path.to_string(),
            size,
            checksum,
            cmd_id: cmd_id.to_string(),
        },
    )
    .await?;

    match read_vsock_response(&mut conn).await? {
        Response::Ready { .. } => {}
        Response::Error { error, .. } => return Err(AgentHandlerError::Remote(error)),
        other => return Err(AgentHandlerError::Remote(format!("unexpected response: {other:?}"))),
    }

    conn.get_mut().write_all(&data).await?;

    match read_vsock_response(&mut conn).await? {
        Response::Complete { .. } => Ok(size),
        Response::Error { error, .. } => Err(AgentHandlerError::Remote(error)),
        other => Err(AgentHandlerError::Remote(format!("unexpected response: {other:?}"))),
    }
}

async fn write_vsock_message(conn: &mut BufReader<VsockStream>, message: &Request) -> Result<(), AgentHandlerError> {
    let bytes = encode_message(message)?;
    conn.get_mut().write_all(&bytes).await?;
    Ok(())
}

async fn read_vsock_response(conn: &mut BufReader<VsockStream>) -> Result<Response, AgentHandlerError> {
    let mut line = String::new();
    if conn.read_line(&mut line).await? == 0 {
        return Err(AgentHandlerError::VsockClosed);
    }
    Ok(decode_message(&line)?)
}

/// Serial-console fallback for `read_file` when vsock is unreachable,
/// ported from `agent.py`'s `handle_read_file`: small files go out as one
/// `file_content`, larger ones are throttled-chunked with a trailing
/// checksum.
async fn console_read_file(cmd_id: &str, path: &str) -> Result<i32, AgentHandlerError> {
    let data = tokio::fs::read(path).await?;

    if data.len() <= CONSOLE_CHUNK_SIZE {
        send_event(&AgentEvent::FileContent {
            cmd_id: cmd_id.to_string(),
            content: BASE64.encode(&data),
        });
        return Ok(0);
    }

    let mut hasher = Md5::new();
    let mut offset = 0u64;
    for chunk in data.chunks(CONSOLE_CHUNK_SIZE) {
        hasher.update(chunk);
        send_event(&AgentEvent::FileChunk {
            cmd_id: cmd_id.to_string(),
            data: BASE64.encode(chunk),
            offset,
            size: chunk.len() as u64,
        });
        offset += chunk.len() as u64;
        tokio::time::sleep(Duration::from_millis(CONSOLE_CHUNK_DELAY_MS)).await;
    }

    send_event(&AgentEvent::FileComplete {
        cmd_id: cmd_id.to_string(),
        total_size: data.len() as u64,
        checksum: format!("{:x}", hasher.finalize()),
    });
    Ok(0)
}

async fn write_file(cmd_id: &str, path: String, content: String, append: bool) -> Result<i32, AgentHandlerError> {
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let decoded = BASE64.decode(content.as_bytes())?;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .open(&path)
        .await?;
    file.write_all(&decoded).await?;

    send_event(&AgentEvent::Status {
        cmd_id: Some(cmd_id.to_string()),
        status: "written".to_string(),
        pid: None,
        size: None,
        mode: None,
        mtime: None,
    });
    Ok(0)
}

async fn list_dir(cmd_id: &str, path: String) -> Result<i32, AgentHandlerError> {
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Err(AgentHandlerError::NotFound(path));
    }

    let mut entries = tokio::fs::read_dir(&path).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        match entry.metadata().await {
            Ok(metadata) => files.push(DirEntry {
                name,
                entry_type: if metadata.is_dir() { "directory".to_string() } else { "file".to_string() },
                size: metadata.len(),
                mode: metadata.permissions().mode(),
                mtime: mtime_secs(&metadata),
            }),
            Err(_) => files.push(DirEntry {
                name,
                entry_type: "unknown".to_string(),
                size: 0,
                mode: 0,
                mtime: 0,
            }),
        }
    }

    send_event(&AgentEvent::DirList {
        cmd_id: cmd_id.to_string(),
        files,
    });
    Ok(0)
}

async fn file_info(cmd_id: &str, path: String) -> Result<i32, AgentHandlerError> {
    let metadata = tokio::fs::metadata(&path).await.map_err(|_| AgentHandlerError::NotFound(path))?;
    send_event(&AgentEvent::Status {
        cmd_id: Some(cmd_id.to_string()),
        status: "info".to_string(),
        pid: None,
        size: Some(metadata.len()),
        mode: Some(metadata.permissions().mode()),
        mtime: Some(mtime_secs(&metadata)),
    });
    Ok(0)
}

fn mtime_secs(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtime_secs_matches_the_real_clock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hi").unwrap();
        let metadata = std::fs::metadata(&path).unwrap();

        let now = std::time::SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let mtime = mtime_secs(&metadata);
        assert!(mtime > 0);
        assert!(mtime <= now + 5);
    }

    #[tokio::test]
    async fn write_file_truncates_by_default_and_appends_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.txt");

        write_file("c1", path.to_string_lossy().into_owned(), BASE64.encode("hello "), false)
            .await
            .unwrap();
        write_file("c1", path.to_string_lossy().into_owned(), BASE64.encode("world"), true)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello world");

        write_file("c1", path.to_string_lossy().into_owned(), BASE64.encode("reset"), false)
            .await
            .unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "reset");
    }

    #[tokio::test]
    async fn list_dir_reports_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let result = list_dir("c1", dir.path().to_string_lossy().into_owned()).await;
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_dir_on_missing_path_is_not_found() {
        let result = list_dir("c1", "/no/such/path/here".to_string()).await;
        assert_matches::assert_matches!(result, Err(AgentHandlerError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_info_on_missing_path_is_not_found() {
        let result = file_info("c1", "/no/such/path/here".to_string()).await;
        assert_matches::assert_matches!(result, Err(AgentHandlerError::NotFound(_)));
    }

    #[tokio::test]
    async fn console_read_file_handles_small_and_chunked_files() {
        let dir = tempfile::tempdir().unwrap();

        let small = dir.path().join("small");
        std::fs::write(&small, vec![1u8; 16]).unwrap();
        assert_eq!(console_read_file("c1", small.to_str().unwrap()).await.unwrap(), 0);

        let large = dir.path().join("large");
        std::fs::write(&large, vec![2u8; CONSOLE_CHUNK_SIZE * 2 + 1]).unwrap();
        assert_eq!(console_read_file("c1", large.to_str().unwrap()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_file_on_missing_path_is_not_found() {
        let result = read_file("c1", "/no/such/path/here".to_string(), 9000).await;
        assert_matches::assert_matches!(result, Err(AgentHandlerError::NotFound(_)));
    }
}
