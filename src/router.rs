//! Host-side correlation of in-guest agent command/event traffic (spec
//! component C7): a registry of pending requests keyed by `cmd_id`, a
//! blocking-request adapter over it, and the agent-ready handshake.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{oneshot, Mutex, Notify};

use crate::{
    agent_protocol::{AgentEvent, AgentRequest},
    console::{ConsoleError, ConsoleMultiplexer},
};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no response within the caller's deadline")]
    Timeout,
    #[error("the guest agent reported an error: `{0}`")]
    AgentError(String),
    #[error("writing the request to the console failed: `{0}`")]
    Console(#[from] ConsoleError),
    #[error("the agent was not ready within the deadline")]
    AgentNotReady,
}

/// Callback hooks a caller may register for one in-flight `cmd_id`. Every
/// field is optional; unused hooks are simply not invoked.
#[derive(Default)]
pub struct SessionCallbacks {
    pub on_output: Option<Box<dyn Fn(&str, &str) + Send + Sync>>,
    pub on_file_content: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_file_chunk: Option<Box<dyn Fn(&str, u64, u64) + Send + Sync>>,
    pub on_file_complete: Option<Box<dyn Fn(u64, &str) + Send + Sync>>,
    pub on_dir_list: Option<Box<dyn Fn(&[crate::agent_protocol::DirEntry]) + Send + Sync>>,
    pub on_status: Option<Box<dyn Fn(&AgentEvent) + Send + Sync>>,
}

struct PendingEntry {
    callbacks: SessionCallbacks,
    completion: Option<oneshot::Sender<Result<i32, String>>>,
}

/// Host-side counterpart to the in-guest agent.
pub struct AgentSessionRouter {
    pending: Mutex<HashMap<String, PendingEntry>>,
    agent_ready: std::sync::atomic::AtomicBool,
    agent_ready_signal: Notify,
}

impl AgentSessionRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            agent_ready: std::sync::atomic::AtomicBool::new(false),
            agent_ready_signal: Notify::new(),
        })
    }

    /// Writes `request` to the console and blocks until its `cmd_id`
    /// receives an `exit` event or `timeout` elapses. On timeout the
    /// pending entry is removed; a late-arriving `exit` for it is then
    /// simply discarded by [`Self::dispatch_line`].
    pub async fn send_request(
        &self,
        console: &ConsoleMultiplexer,
        request: AgentRequest,
        callbacks: SessionCallbacks,
        timeout: Duration,
    ) -> Result<i32, RouterError> {
        let cmd_id = request.cmd_id().to_string();
        let (completion_tx, completion_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                cmd_id.clone(),
                PendingEntry {
                    callbacks,
                    completion: Some(completion_tx),
                },
            );
        }

        let mut line = serde_json::to_vec(&request).expect("agent requests always serialize");
        line.push(b'\n');
        console.write_input(&line).await?;

        match tokio::time::timeout(timeout, completion_rx).await {
            Ok(Ok(Ok(exit_code))) => Ok(exit_code),
            Ok(Ok(Err(error))) => Err(RouterError::AgentError(error)),
            Ok(Err(_)) => Err(RouterError::Timeout),
            Err(_) => {
                self.pending.lock().await.remove(&cmd_id);
                Err(RouterError::Timeout)
            }
        }
    }

    /// Parses one line of guest stdout. Non-JSON lines are benign console
    /// noise. Call this from the console's owner callback.
    pub async fn dispatch_line(&self, line: &str) {
        let event: AgentEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => {
                tracing::trace!(line, "non-JSON console line, treated as noise");
                return;
            }
        };

        if let AgentEvent::Status { status, cmd_id: None, .. } = &event {
            if status == "ready" {
                self.agent_ready.store(true, std::sync::atomic::Ordering::Release);
                self.agent_ready_signal.notify_waiters();
            }
            return;
        }

        let Some(cmd_id) = event.cmd_id() else { return };
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.get_mut(cmd_id) else { return };

        match &event {
            AgentEvent::Output { stream, data, .. } => {
                if let Some(callback) = &entry.callbacks.on_output {
                    callback(stream, data);
                }
            }
            AgentEvent::FileContent { content, .. } => {
                if let Some(callback) = &entry.callbacks.on_file_content {
                    callback(content);
                }
            }
            AgentEvent::FileChunk { data, offset, size, .. } => {
                if let Some(callback) = &entry.callbacks.on_file_chunk {
                    callback(data, *offset, *size);
                }
            }
            AgentEvent::FileComplete { total_size, checksum, .. } => {
                if let Some(callback) = &entry.callbacks.on_file_complete {
                    callback(*total_size, checksum);
                }
            }
            AgentEvent::DirList { files, .. } => {
                if let Some(callback) = &entry.callbacks.on_dir_list {
                    callback(files);
                }
            }
            AgentEvent::Status { .. } => {
                if let Some(callback) = &entry.callbacks.on_status {
                    callback(&event);
                }
            }
            AgentEvent::Error { error, .. } => {
                if let Some(entry) = pending.remove(cmd_id) {
                    if let Some(completion) = entry.completion {
                        let _ = completion.send(Err(error.clone()));
                    }
                }
            }
            AgentEvent::Exit { exit_code, .. } => {
                if let Some(entry) = pending.remove(cmd_id) {
                    if let Some(completion) = entry.completion {
                        let _ = completion.send(Ok(*exit_code));
                    }
                }
            }
        }
    }

    pub fn is_agent_ready(&self) -> bool {
        self.agent_ready.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Waits for the agent's startup `status{ready}` event. When `poll` is
    /// `true` (the re-attached-supervisor path, spec.md §9), this falls
    /// back to polling instead of relying on a live dispatch loop, since a
    /// re-attached process may not own the console reader that flips the
    /// flag via [`Self::dispatch_line`].
    pub async fn wait_for_agent(self: &Arc<Self>, timeout: Duration, poll: bool) -> Result<(), RouterError> {
        if !poll {
            // Register as a waiter before re-checking the flag: notify_waiters only
            // wakes futures already registered, so checking first and creating the
            // Notified future second would miss a ready signal that lands in between.
            let notified = self.agent_ready_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_agent_ready() {
                return Ok(());
            }

            return tokio::time::timeout(timeout, notified)
                .await
                .map_err(|_| RouterError::AgentNotReady);
        }

        if self.is_agent_ready() {
            return Ok(());
        }

        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if self.is_agent_ready() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Err(RouterError::AgentNotReady)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatch_ready_status_flips_agent_ready() {
        let router = AgentSessionRouter::new();
        assert!(!router.is_agent_ready());
        router.dispatch_line(r#"{"type":"status","cmd_id":null,"status":"ready"}"#).await;
        assert!(router.is_agent_ready());
    }

    #[tokio::test]
    async fn non_json_lines_are_ignored() {
        let router = AgentSessionRouter::new();
        router.dispatch_line("Linux version 6.1.0 booting...").await;
        assert!(!router.is_agent_ready());
    }

    #[tokio::test]
    async fn exit_event_with_no_pending_entry_is_discarded() {
        let router = AgentSessionRouter::new();
        router
            .dispatch_line(r#"{"type":"exit","cmd_id":"ghost","exit_code":0}"#)
            .await;
    }

    #[tokio::test]
    async fn output_events_invoke_the_registered_callback() {
        let router = AgentSessionRouter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        {
            let mut pending = router.pending.lock().await;
            pending.insert(
                "c1".to_string(),
                PendingEntry {
                    callbacks: SessionCallbacks {
                        on_output: Some(Box::new(move |_stream, _data| {
                            count_clone.fetch_add(1, Ordering::SeqCst);
                        })),
                        ..Default::default()
                    },
                    completion: None,
                },
            );
        }

        router
            .dispatch_line(r#"{"type":"output","cmd_id":"c1","stream":"stdout","data":"hi"}"#)
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
