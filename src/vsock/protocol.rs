//! Wire types for the vsock file-transfer plane: a newline-delimited JSON
//! envelope, binary payloads base64-encoded inside it except for upload
//! bodies, which stream raw after a `ready` handshake.
//!
//! Direct port of `bandsox/vsock/protocol.py`'s `RequestType`/`ResponseType`
//! and the five message dataclasses.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Host CID, the well-known value for the hypervisor side of a vsock
/// connection.
pub const HOST_CID: u32 = 2;
/// Default vsock listener port when no pool allocation is in play.
pub const DEFAULT_PORT: u16 = 9000;
/// Chunk size for vsock-streamed uploads/downloads.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Upload {
        path: String,
        size: u64,
        checksum: String,
        cmd_id: String,
    },
    Download {
        path: String,
        cmd_id: String,
    },
    Ping {
        cmd_id: String,
    },
}

impl Request {
    pub fn cmd_id(&self) -> &str {
        match self {
            Request::Upload { cmd_id, .. } => cmd_id,
            Request::Download { cmd_id, .. } => cmd_id,
            Request::Ping { cmd_id } => cmd_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ready {
        cmd_id: String,
    },
    Chunk {
        cmd_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        offset: u64,
        size: u64,
    },
    Complete {
        cmd_id: String,
        size: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    Error {
        cmd_id: String,
        error: String,
    },
    Pong {
        cmd_id: String,
    },
}

impl Response {
    pub fn error(cmd_id: impl Into<String>, error: impl Into<String>) -> Self {
        Response::Error {
            cmd_id: cmd_id.into(),
            error: error.into(),
        }
    }
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Encode a message as a single newline-terminated JSON line.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a single JSON line (without its trailing newline) into a message.
pub fn decode_message<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_variants_round_trip() {
        for request in [
            Request::Upload {
                path: "/src/a.bin".into(),
                size: 5,
                checksum: "5d41402abc4b2a76b9719d911017c592".into(),
                cmd_id: "c1".into(),
            },
            Request::Download {
                path: "/src/b.bin".into(),
                cmd_id: "c2".into(),
            },
            Request::Ping { cmd_id: "c3".into() },
        ] {
            let line = encode_message(&request).unwrap();
            let line = String::from_utf8(line).unwrap();
            assert!(line.ends_with('\n'));
            let decoded: Request = decode_message(&line).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn response_variants_round_trip() {
        for response in [
            Response::Ready { cmd_id: "c1".into() },
            Response::Chunk {
                cmd_id: "c2".into(),
                data: b"hello".to_vec(),
                offset: 0,
                size: 5,
            },
            Response::Complete {
                cmd_id: "c2".into(),
                size: 5,
                checksum: Some("abc".into()),
            },
            Response::error("c1", "Checksum mismatch"),
            Response::Pong { cmd_id: "c3".into() },
        ] {
            let line = encode_message(&response).unwrap();
            let decoded: Response = decode_message(std::str::from_utf8(&line).unwrap()).unwrap();
            assert_eq!(decoded, response);
        }
    }

    #[test]
    fn unknown_request_type_is_a_deserialize_error() {
        let result: Result<Request, _> = decode_message(r#"{"type": "launch_nukes", "cmd_id": "x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn chunk_data_is_base64_on_the_wire() {
        let line = encode_message(&Response::Chunk {
            cmd_id: "c1".into(),
            data: b"hi".to_vec(),
            offset: 0,
            size: 2,
        })
        .unwrap();
        let text = String::from_utf8(line).unwrap();
        assert!(text.contains(&BASE64.encode(b"hi")));
    }
}
