use crate::change::{ChangeRecord, now_ms};
use crate::checkpoint::CheckpointSnapshot;
use crate::compress::{self, ColumnarBatch};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Universal Sync Protocol identifiers.
pub const PROTOCOL: &str = "usp";
pub const VERSION: &str = "1.0.0";

/// Error codes used in `error` payloads.
pub mod codes {
    pub const MALFORMED_MESSAGE: &str = "malformed-message";
    pub const UNSUPPORTED_PROTOCOL: &str = "unsupported-protocol";
    pub const UNSUPPORTED_VERSION: &str = "unsupported-version";
    pub const UNKNOWN_TYPE: &str = "unknown-type";
    pub const AUTH_REJECTED: &str = "auth-rejected";
    pub const UNKNOWN_SESSION: &str = "unknown-session";
}

/// Shared message envelope. Requests and their replies carry the same `id`;
/// server-initiated messages use ids from the server's own counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: String,
    pub version: String,
    pub id: u64,
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    pub fn new(id: u64, body: MessageBody) -> Self {
        Envelope {
            protocol: PROTOCOL.to_string(),
            version: VERSION.to_string(),
            id,
            timestamp: now_ms(),
            body,
        }
    }

    pub fn error(id: u64, code: &str, message: impl Into<String>, retriable: bool) -> Self {
        Envelope::new(
            id,
            MessageBody::Error(ErrorBody {
                code: code.to_string(),
                message: message.into(),
                retriable,
            }),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum MessageBody {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    Push(Push),
    PushAck(PushAck),
    Pull(Pull),
    PullResponse(PullResponse),
    Ping,
    Pong,
    Error(ErrorBody),
}

impl MessageBody {
    pub fn type_name(&self) -> &'static str {
        match self {
            MessageBody::Handshake(_) => "handshake",
            MessageBody::HandshakeAck(_) => "handshake-ack",
            MessageBody::Push(_) => "push",
            MessageBody::PushAck(_) => "push-ack",
            MessageBody::Pull(_) => "pull",
            MessageBody::PullResponse(_) => "pull-response",
            MessageBody::Ping => "ping",
            MessageBody::Pong => "pong",
            MessageBody::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: String,
    pub collections: Vec<String>,
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub session_id: String,
    pub server_node_id: String,
    pub accepted_collections: Vec<String>,
}

/// Change batches travel either as a plain array or as a columnar object;
/// the JSON shapes are disjoint so no tag is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeBatch {
    Plain(Vec<ChangeRecord>),
    Columnar(ColumnarBatch),
}

impl ChangeBatch {
    pub fn plain(records: Vec<ChangeRecord>) -> Self {
        ChangeBatch::Plain(records)
    }

    pub fn packed(records: &[ChangeRecord]) -> Result<Self> {
        Ok(ChangeBatch::Columnar(compress::pack(records)?))
    }

    pub fn encode(records: Vec<ChangeRecord>, compressed: bool) -> Result<Self> {
        if compressed {
            ChangeBatch::packed(&records)
        } else {
            Ok(ChangeBatch::plain(records))
        }
    }

    /// Decodes back to the change sequence, whatever the encoding.
    pub fn into_records(self) -> Result<Vec<ChangeRecord>> {
        match self {
            ChangeBatch::Plain(records) => Ok(records),
            ChangeBatch::Columnar(batch) => compress::unpack(&batch),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ChangeBatch::Plain(records) => records.len(),
            ChangeBatch::Columnar(batch) => batch.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub session_id: String,
    pub collection: String,
    pub changes: ChangeBatch,
    pub checkpoint: CheckpointSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushConflict {
    pub document_id: String,
    pub server_document: crate::change::Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAck {
    pub accepted: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<PushConflict>,
    pub checkpoint: CheckpointSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pull {
    pub session_id: String,
    pub collections: Vec<String>,
    pub checkpoint: CheckpointSnapshot,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: BTreeMap<String, ChangeBatch>,
    pub checkpoint: CheckpointSnapshot,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

impl From<ErrorBody> for SyncError {
    fn from(body: ErrorBody) -> Self {
        SyncError::Server {
            code: body.code,
            message: body.message,
            retriable: body.retriable,
        }
    }
}

const KNOWN_TYPES: [&str; 9] = [
    "handshake",
    "handshake-ack",
    "push",
    "push-ack",
    "pull",
    "pull-response",
    "ping",
    "pong",
    "error",
];

/// Structural validation of a raw incoming value, before typed decoding.
/// Returns the `error` payload a peer must answer with when the envelope is
/// unacceptable.
pub fn validate_value(value: &Value) -> std::result::Result<(), ErrorBody> {
    let reject = |code: &str, message: String| ErrorBody {
        code: code.to_string(),
        message,
        retriable: false,
    };

    let object = value
        .as_object()
        .ok_or_else(|| reject(codes::MALFORMED_MESSAGE, "envelope is not an object".into()))?;

    for field in ["protocol", "version", "type", "id", "timestamp"] {
        if !object.contains_key(field) {
            return Err(reject(
                codes::MALFORMED_MESSAGE,
                format!("missing envelope field {field:?}"),
            ));
        }
    }

    if object.get("protocol").and_then(Value::as_str) != Some(PROTOCOL) {
        return Err(reject(
            codes::UNSUPPORTED_PROTOCOL,
            format!("expected protocol {PROTOCOL:?}"),
        ));
    }
    if object.get("version").and_then(Value::as_str) != Some(VERSION) {
        return Err(reject(
            codes::UNSUPPORTED_VERSION,
            format!("expected version {VERSION:?}"),
        ));
    }
    if object.get("id").and_then(Value::as_u64).is_none() {
        return Err(reject(
            codes::MALFORMED_MESSAGE,
            "envelope id must be an unsigned integer".into(),
        ));
    }

    let msg_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| reject(codes::MALFORMED_MESSAGE, "envelope type must be a string".into()))?;
    if !KNOWN_TYPES.contains(&msg_type) {
        return Err(reject(
            codes::UNKNOWN_TYPE,
            format!("unknown message type {msg_type:?}"),
        ));
    }

    // Every type except ping/pong requires a payload object.
    let needs_payload = !matches!(msg_type, "ping" | "pong");
    if needs_payload && !object.get("payload").is_some_and(Value::is_object) {
        return Err(reject(
            codes::MALFORMED_MESSAGE,
            format!("message type {msg_type:?} requires a payload object"),
        ));
    }

    Ok(())
}

/// Parses one wire line into a validated envelope.
pub fn decode_line(line: &str) -> Result<Envelope> {
    let value: Value = serde_json::from_str(line)
        .map_err(|e| SyncError::Protocol(format!("invalid json: {e}")))?;
    validate_value(&value).map_err(|body| SyncError::Protocol(body.message.clone()))?;
    let envelope: Envelope = serde_json::from_value(value)?;
    Ok(envelope)
}

/// Serializes an envelope to its single-line wire form.
pub fn encode_line(envelope: &Envelope) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope::new(7, MessageBody::Ping);
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["protocol"], "usp");
        assert_eq!(wire["version"], "1.0.0");
        assert_eq!(wire["type"], "ping");
        assert_eq!(wire["id"], 7);
    }

    #[test]
    fn handshake_round_trip() {
        let env = Envelope::new(
            1,
            MessageBody::Handshake(Handshake {
                node_id: "a".into(),
                collections: vec!["todos".into()],
                capabilities: vec!["columnar".into()],
                auth: Some("secret".into()),
            }),
        );
        let line = encode_line(&env).unwrap();
        let back = decode_line(&line).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn push_round_trip_plain_and_columnar() {
        for compressed in [false, true] {
            let env = Envelope::new(
                2,
                MessageBody::Push(Push {
                    session_id: "s1".into(),
                    collection: "todos".into(),
                    changes: ChangeBatch::encode(Vec::new(), compressed).unwrap(),
                    checkpoint: CheckpointSnapshot::default(),
                }),
            );
            let line = encode_line(&env).unwrap();
            assert_eq!(decode_line(&line).unwrap(), env);
        }
    }

    #[test]
    fn validation_rejects_missing_payload() {
        let value = json!({
            "protocol": "usp", "version": "1.0.0", "type": "push",
            "id": 3, "timestamp": 0
        });
        let err = validate_value(&value).unwrap_err();
        assert_eq!(err.code, codes::MALFORMED_MESSAGE);
    }

    #[test]
    fn validation_rejects_unknown_protocol_and_version() {
        let value = json!({
            "protocol": "nope", "version": "1.0.0", "type": "ping",
            "id": 1, "timestamp": 0
        });
        assert_eq!(
            validate_value(&value).unwrap_err().code,
            codes::UNSUPPORTED_PROTOCOL
        );

        let value = json!({
            "protocol": "usp", "version": "9.9.9", "type": "ping",
            "id": 1, "timestamp": 0
        });
        assert_eq!(
            validate_value(&value).unwrap_err().code,
            codes::UNSUPPORTED_VERSION
        );
    }

    #[test]
    fn validation_rejects_unknown_type() {
        let value = json!({
            "protocol": "usp", "version": "1.0.0", "type": "gossip",
            "id": 1, "timestamp": 0, "payload": {}
        });
        assert_eq!(validate_value(&value).unwrap_err().code, codes::UNKNOWN_TYPE);
    }

    #[test]
    fn ping_needs_no_payload() {
        let value = json!({
            "protocol": "usp", "version": "1.0.0", "type": "ping",
            "id": 1, "timestamp": 0
        });
        assert!(validate_value(&value).is_ok());
        let env = decode_line(&value.to_string()).unwrap();
        assert_eq!(env.body, MessageBody::Ping);
    }

    #[test]
    fn decode_rejects_junk() {
        assert!(decode_line("not json at all").is_err());
        assert!(decode_line("[1,2,3]").is_err());
    }
}
