//! Command/event wire types shared between the host-side
//! [`crate::router::AgentSessionRouter`] and the guest agent binary,
//! carried as newline-delimited JSON over the serial console.
//!
//! Direct port of the handler surface in `bandsox/agent.py`: `exec`,
//! `pty_exec`, `input`, `resize`, `kill`, `read_file`, `write_file`,
//! `list_dir`, `file_info`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Chunk size for console-based (fallback) file reads: kept small for
/// serial buffer safety, unlike the 64 KiB vsock chunk size.
pub const CONSOLE_CHUNK_SIZE: usize = 2 * 1024;
/// Inter-chunk delay for console fallback transfer, throttling to avoid
/// overrunning the serial buffer.
pub const CONSOLE_CHUNK_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    Exec {
        cmd_id: String,
        command: String,
        #[serde(default)]
        background: bool,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    PtyExec {
        cmd_id: String,
        command: String,
        cols: u16,
        rows: u16,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Input {
        id: String,
        data: String,
        #[serde(default)]
        encoding: Option<String>,
    },
    Resize {
        id: String,
        cols: u16,
        rows: u16,
    },
    Kill {
        id: String,
    },
    ReadFile {
        cmd_id: String,
        path: String,
    },
    WriteFile {
        cmd_id: String,
        path: String,
        content: String,
        #[serde(default)]
        append: bool,
    },
    ListDir {
        cmd_id: String,
        path: String,
    },
    FileInfo {
        cmd_id: String,
        path: String,
    },
}

impl AgentRequest {
    pub fn cmd_id(&self) -> &str {
        match self {
            AgentRequest::Exec { cmd_id, .. }
            | AgentRequest::ReadFile { cmd_id, .. }
            | AgentRequest::WriteFile { cmd_id, .. }
            | AgentRequest::ListDir { cmd_id, .. }
            | AgentRequest::FileInfo { cmd_id, .. }
            | AgentRequest::PtyExec { cmd_id, .. } => cmd_id,
            AgentRequest::Input { id, .. } | AgentRequest::Resize { id, .. } | AgentRequest::Kill { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Status {
        cmd_id: Option<String>,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mode: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mtime: Option<u64>,
    },
    Output {
        cmd_id: String,
        stream: String,
        data: String,
    },
    Error {
        cmd_id: String,
        error: String,
    },
    Exit {
        cmd_id: String,
        exit_code: i32,
    },
    FileContent {
        cmd_id: String,
        content: String,
    },
    FileChunk {
        cmd_id: String,
        data: String,
        offset: u64,
        size: u64,
    },
    FileComplete {
        cmd_id: String,
        total_size: u64,
        checksum: String,
    },
    DirList {
        cmd_id: String,
        files: Vec<DirEntry>,
    },
}

impl AgentEvent {
    pub fn ready() -> Self {
        AgentEvent::Status {
            cmd_id: None,
            status: "ready".to_string(),
            pid: None,
            size: None,
            mode: None,
            mtime: None,
        }
    }

    pub fn exit(cmd_id: impl Into<String>, exit_code: i32) -> Self {
        AgentEvent::Exit {
            cmd_id: cmd_id.into(),
            exit_code,
        }
    }

    pub fn error(cmd_id: impl Into<String>, error: impl Into<String>) -> Self {
        AgentEvent::Error {
            cmd_id: cmd_id.into(),
            error: error.into(),
        }
    }

    pub fn cmd_id(&self) -> Option<&str> {
        match self {
            AgentEvent::Status { cmd_id, .. } => cmd_id.as_deref(),
            AgentEvent::Output { cmd_id, .. }
            | AgentEvent::Error { cmd_id, .. }
            | AgentEvent::Exit { cmd_id, .. }
            | AgentEvent::FileContent { cmd_id, .. }
            | AgentEvent::FileChunk { cmd_id, .. }
            | AgentEvent::FileComplete { cmd_id, .. }
            | AgentEvent::DirList { cmd_id, .. } => Some(cmd_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_request_round_trips() {
        let request = AgentRequest::Exec {
            cmd_id: "c1".into(),
            command: "echo hi".into(),
            background: false,
            env: HashMap::new(),
        };
        let json = serde_json::to_string(&request).unwrap();
        let decoded: AgentRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn ready_status_has_no_cmd_id() {
        let json = serde_json::to_string(&AgentEvent::ready()).unwrap();
        assert!(!json.contains("cmd_id") || json.contains("\"cmd_id\":null"));
    }

    #[test]
    fn unknown_request_type_is_rejected() {
        let result: Result<AgentRequest, _> = serde_json::from_str(r#"{"type":"format_disk","id":"x"}"#);
        assert!(result.is_err());
    }
}
