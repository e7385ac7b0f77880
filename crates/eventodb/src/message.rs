use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A message recorded in a stream.
///
/// Messages are immutable once written. `position` is the zero-based,
/// gapless sequence within the stream; `global_position` is the
/// namespace-wide monotonic sequence assigned at append time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub stream_name: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub position: i64,
    pub global_position: i64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub time: DateTime<Utc>,
}

/// One line of the NDJSON export/import schema.
///
/// The field names are the wire format of `eventodb export` and
/// `POST /import`; positions are carried verbatim so an import into an empty
/// namespace reproduces the source byte-for-byte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedMessage {
    pub id: Uuid,
    pub stream: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub pos: i64,
    pub gpos: i64,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub time: DateTime<Utc>,
}

impl From<Message> for ExportedMessage {
    fn from(msg: Message) -> Self {
        ExportedMessage {
            id: msg.id,
            stream: msg.stream_name,
            msg_type: msg.msg_type,
            pos: msg.position,
            gpos: msg.global_position,
            data: msg.data,
            meta: msg.metadata,
            time: msg.time,
        }
    }
}

impl From<ExportedMessage> for Message {
    fn from(msg: ExportedMessage) -> Self {
        Message {
            id: msg.id,
            stream_name: msg.stream,
            msg_type: msg.msg_type,
            position: msg.pos,
            global_position: msg.gpos,
            data: msg.data,
            metadata: msg.meta,
            time: msg.time,
        }
    }
}

/// Notification published after every successful append.
///
/// Carries pointers only, never the message body; subscribers fetch data
/// through the read operations at their own pace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteEvent {
    pub namespace: String,
    pub stream: String,
    pub position: i64,
    #[serde(rename = "globalPosition")]
    pub global_position: i64,
}
