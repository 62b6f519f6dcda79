//! JSON envelope of the apply endpoint.
//!
//! Request:
//!
//! ```json
//! { "protocolVersion": 1, "batchId": "…", "tasks": [
//!     { "originServer": "node-a", "sequenceId": 10, "kind": "object.upsert",
//!       "objectType": "cms.document", "targetKey": "doc:5",
//!       "payloadBase64": "…", "groups": [], "createdAt": 1700000000000,
//!       "schemaVersion": 1 } ] }
//! ```
//!
//! Response:
//!
//! ```json
//! { "acks": [ { "sequenceId": 10, "status": "ack", "assignedId": 1042 } ] }
//! ```

use crate::error::{ProtocolError, ProtocolResult};
use crate::ids::{GroupTag, SequenceId, ServerId, TaskKindId};
use crate::task::Task;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire protocol version spoken by this build.
pub const PROTOCOL_VERSION: u16 = 1;

fn default_schema_version() -> u16 {
    1
}

/// A task as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTask {
    /// Originating node.
    pub origin_server: String,
    /// Sequence id on the origin.
    pub sequence_id: u64,
    /// Task kind id.
    pub kind: String,
    /// Affected object type.
    pub object_type: String,
    /// Affected key.
    pub target_key: String,
    /// Base64 encoded payload.
    pub payload_base64: String,
    /// Routing tags.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Capture time (Unix millis).
    #[serde(default)]
    pub created_at: u64,
    /// Payload schema version; senders that predate versioning emit 1.
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
}

impl WireTask {
    /// Converts a task to its wire form.
    pub fn from_task(task: &Task) -> Self {
        Self {
            origin_server: task.origin.as_str().to_string(),
            sequence_id: task.sequence_id.as_u64(),
            kind: task.kind.as_str().to_string(),
            object_type: task.object_type.clone(),
            target_key: task.target_key.clone(),
            payload_base64: STANDARD.encode(&task.payload),
            groups: task.groups.iter().map(|g| g.as_str().to_string()).collect(),
            created_at: task.created_at,
            schema_version: task.schema_version,
        }
    }

    /// Decodes the wire form back into a task.
    pub fn into_task(self) -> ProtocolResult<Task> {
        let payload = STANDARD.decode(self.payload_base64.as_bytes())?;
        Ok(Task {
            sequence_id: SequenceId(self.sequence_id),
            kind: TaskKindId::from(self.kind),
            object_type: self.object_type,
            target_key: self.target_key,
            payload,
            origin: ServerId::from(self.origin_server),
            created_at: self.created_at,
            groups: self.groups.into_iter().map(GroupTag::from).collect(),
            schema_version: self.schema_version,
        })
    }
}

/// Batch of tasks sent to a target's apply endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    /// Wire protocol version.
    pub protocol_version: u16,
    /// Unique id of this delivery attempt, for log correlation.
    pub batch_id: Uuid,
    /// Tasks in sequence order.
    pub tasks: Vec<WireTask>,
}

impl ApplyRequest {
    /// Builds a request for the given tasks with a fresh batch id.
    pub fn new<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            batch_id: Uuid::new_v4(),
            tasks: tasks.into_iter().map(WireTask::from_task).collect(),
        }
    }

    /// Serializes the request body.
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a request body and checks its protocol version.
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        let request: Self = serde_json::from_slice(bytes)?;
        if request.protocol_version > PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedProtocolVersion {
                got: request.protocol_version,
                supported: PROTOCOL_VERSION,
            });
        }
        Ok(request)
    }
}

/// Outcome of one task on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Applied, or already applied earlier.
    Ack,
    /// Not applied; the sender keeps the entry and retries.
    Nack,
}

/// Reason attached to a nack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackCode {
    /// The receiver has no handler for the kind.
    UnknownKind,
    /// The payload schema is newer than the receiver understands.
    UnsupportedSchemaVersion,
    /// The handler returned an error.
    HandlerFailed,
    /// An earlier task in the same batch was nacked.
    Blocked,
    /// The task could not be decoded.
    Malformed,
}

/// Error detail of a nack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NackError {
    /// Machine readable reason.
    pub code: NackCode,
    /// Human readable detail.
    pub message: String,
    /// Highest schema version the receiver accepts, for versioned rejects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_version: Option<u16>,
}

impl NackError {
    /// Creates a nack error without version info.
    pub fn new(code: NackCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            supported_version: None,
        }
    }

    /// Creates a versioned reject.
    pub fn unsupported_version(got: u16, supported: u16) -> Self {
        Self {
            code: NackCode::UnsupportedSchemaVersion,
            message: format!("schema version {got} is newer than supported {supported}"),
            supported_version: Some(supported),
        }
    }
}

/// Per-task acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAck {
    /// Sequence id of the acknowledged task.
    pub sequence_id: u64,
    /// Ack or nack.
    pub status: AckStatus,
    /// Nack detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NackError>,
    /// Identifier the target assigned to a newly created object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_id: Option<i64>,
}

impl TaskAck {
    /// Positive acknowledgement.
    pub fn ack(sequence_id: SequenceId) -> Self {
        Self {
            sequence_id: sequence_id.as_u64(),
            status: AckStatus::Ack,
            error: None,
            assigned_id: None,
        }
    }

    /// Positive acknowledgement carrying the target-side id.
    pub fn ack_assigned(sequence_id: SequenceId, assigned_id: i64) -> Self {
        Self {
            assigned_id: Some(assigned_id),
            ..Self::ack(sequence_id)
        }
    }

    /// Negative acknowledgement.
    pub fn nack(sequence_id: SequenceId, error: NackError) -> Self {
        Self {
            sequence_id: sequence_id.as_u64(),
            status: AckStatus::Nack,
            error: Some(error),
            assigned_id: None,
        }
    }

    /// Returns true for an ack.
    #[must_use]
    pub fn is_ack(&self) -> bool {
        self.status == AckStatus::Ack
    }
}

/// Response of the apply endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    /// One entry per task, in request order.
    pub acks: Vec<TaskAck>,
}

impl ApplyResponse {
    /// Number of leading tasks that were acked.
    ///
    /// The sender advances its queue by exactly this many entries.
    #[must_use]
    pub fn acked_prefix(&self) -> usize {
        self.acks.iter().take_while(|ack| ack.is_ack()).count()
    }

    /// First nack, if any.
    #[must_use]
    pub fn first_nack(&self) -> Option<&TaskAck> {
        self.acks.iter().find(|ack| !ack.is_ack())
    }

    /// Serializes the response body.
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses a response body.
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
