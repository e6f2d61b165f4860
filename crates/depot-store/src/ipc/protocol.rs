//! Shared wire protocol types and framing.
//!
//! Defines the transport contract for the store protocol: 4-byte big-endian
//! length prefix followed by a UTF-8 JSON payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests are records tagged by an `action` field; replies carry either a
//! `result` value or an `error` object. This module is the one place that
//! knows the wire names, so client and server cannot drift apart.

use crate::config::ProtocolConfig;
use crate::registry::PhaseKind;
use crate::store::{CorrelationId, UpdateConnectionsOptions, UploadOptions, WantedDependency};
use crate::{DepotError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// A client-to-server message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    /// Resolve a dependency; the reply is the immediate part of the
    /// response, phases follow via the two fetch actions below.
    #[serde(rename_all = "camelCase")]
    RequestPackage {
        id: CorrelationId,
        wanted_dependency: WantedDependency,
        options: Value,
    },
    /// Long-poll for the manifest phase of `id`.
    ManifestResponse { id: CorrelationId },
    /// Long-poll for the files phase of `id`.
    PackageFilesResponse { id: CorrelationId },
    #[serde(rename_all = "camelCase")]
    UpdateConnections {
        prefix: String,
        opts: UpdateConnectionsOptions,
    },
    Prune,
    SaveState,
    #[serde(rename_all = "camelCase")]
    Upload {
        built_pkg_location: PathBuf,
        opts: UploadOptions,
    },
    /// Ask the server process to shut down.
    Stop,
}

/// Immediate reply to `requestPackage`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPackageReply {
    pub id: String,
    pub is_local: bool,
    /// Present only when `is_local`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<Value>,
}

/// Server-to-client reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl Reply {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: &DepotError) -> Self {
        Self {
            result: None,
            error: Some(ReplyError::from_error(error)),
        }
    }
}

/// Wire error object.
///
/// Correlation-protocol errors carry their id (and phase) in `data` so the
/// receiving side reconstructs the typed error instead of an opaque string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ReplyError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: -32603,
            message: message.into(),
            data: None,
        }
    }

    pub fn from_error(error: &DepotError) -> Self {
        let data = match error {
            DepotError::UnknownCorrelation { id } | DepotError::DuplicateCorrelation { id } => {
                Some(serde_json::json!({ "id": id }))
            }
            DepotError::AlreadyResolved { id, phase }
            | DepotError::AlreadyConsumed { id, phase } => {
                Some(serde_json::json!({ "id": id, "phase": phase.as_str() }))
            }
            _ => None,
        };
        Self {
            code: error.to_wire_code(),
            message: error.to_string(),
            data,
        }
    }

    /// Reconstruct the typed error this object was built from.
    pub fn into_error(self) -> DepotError {
        let id = self
            .data
            .as_ref()
            .and_then(|data| data.get("id"))
            .and_then(|value| serde_json::from_value::<CorrelationId>(value.clone()).ok());
        let phase = self
            .data
            .as_ref()
            .and_then(|data| data.get("phase"))
            .and_then(Value::as_str)
            .and_then(PhaseKind::from_str_opt)
            .unwrap_or(PhaseKind::Manifest);

        match (self.code, id) {
            (-32010, Some(id)) => DepotError::UnknownCorrelation { id },
            (-32011, Some(id)) => DepotError::DuplicateCorrelation { id },
            (-32012, Some(id)) => DepotError::AlreadyResolved { id, phase },
            (-32013, Some(id)) => DepotError::AlreadyConsumed { id, phase },
            (-32014, _) => DepotError::StopRefused,
            (-32700, _) => DepotError::Json {
                message: self.message,
                source: None,
            },
            (-32600, _) => DepotError::Validation {
                field: "request".to_string(),
                message: self.message,
            },
            // Collaborator failures and anything unrecognized keep their
            // message verbatim.
            _ => DepotError::Collaborator {
                message: self.message,
            },
        }
    }
}

impl From<ReplyError> for DepotError {
    fn from(error: ReplyError) -> Self {
        error.into_error()
    }
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(DepotError::Validation {
            field: "frame".to_string(),
            message: format!(
                "message size {} exceeds maximum {}",
                len,
                ProtocolConfig::MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_actions_use_canonical_wire_names() {
        let request = Request::RequestPackage {
            id: CorrelationId::generate(),
            wanted_dependency: WantedDependency {
                alias: "is-positive".to_string(),
                pref: "1.0.0".to_string(),
            },
            options: json!({}),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["action"], "requestPackage");
        assert_eq!(value["wantedDependency"]["alias"], "is-positive");

        let value = serde_json::to_value(Request::ManifestResponse {
            id: CorrelationId::generate(),
        })
        .unwrap();
        assert_eq!(value["action"], "manifestResponse");

        let value = serde_json::to_value(Request::PackageFilesResponse {
            id: CorrelationId::generate(),
        })
        .unwrap();
        assert_eq!(value["action"], "packageFilesResponse");

        let value = serde_json::to_value(Request::UpdateConnections {
            prefix: "project/".to_string(),
            opts: UpdateConnectionsOptions::default(),
        })
        .unwrap();
        assert_eq!(value["action"], "updateConnections");
        assert!(value["opts"]["addDependencies"].is_array());

        assert_eq!(
            serde_json::to_value(Request::SaveState).unwrap()["action"],
            "saveState"
        );
    }

    #[test]
    fn test_request_roundtrip() {
        let request = Request::Upload {
            built_pkg_location: PathBuf::from("/tmp/built-pkg"),
            opts: UploadOptions {
                engine: "node-18".to_string(),
                pkg_id: "test.example.com/fake-pkg/1.0.0".to_string(),
            },
        };
        let json = serde_json::to_string(&request).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        match parsed {
            Request::Upload { opts, .. } => assert_eq!(opts.pkg_id, "test.example.com/fake-pkg/1.0.0"),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_reply_envelope_has_result_xor_error() {
        let json = serde_json::to_string(&Reply::success(json!("OK"))).unwrap();
        assert!(json.contains("\"result\""));
        assert!(!json.contains("\"error\""));

        let json = serde_json::to_string(&Reply::failure(&DepotError::StopRefused)).unwrap();
        assert!(!json.contains("\"result\""));
        assert!(json.contains("\"error\""));
        assert!(json.contains("-32014"));
    }

    #[test]
    fn test_correlation_errors_roundtrip_typed() {
        let id = CorrelationId::generate();
        let wire = ReplyError::from_error(&DepotError::UnknownCorrelation { id });
        match wire.into_error() {
            DepotError::UnknownCorrelation { id: got } => assert_eq!(got, id),
            other => panic!("unexpected error: {:?}", other),
        }

        let wire = ReplyError::from_error(&DepotError::AlreadyConsumed {
            id,
            phase: PhaseKind::Files,
        });
        match wire.into_error() {
            DepotError::AlreadyConsumed { phase, .. } => assert_eq!(phase, PhaseKind::Files),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_collaborator_message_is_preserved_verbatim() {
        let wire = ReplyError::from_error(&DepotError::Collaborator {
            message: "No matching version found for is-positive@99.0.0".to_string(),
        });
        let back = wire.into_error();
        assert_eq!(
            back.to_string(),
            "No matching version found for is-positive@99.0.0"
        );
    }

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        // Frame header claiming a payload over the limit
        let huge_len: u32 = (ProtocolConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }
}
