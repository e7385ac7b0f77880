use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventodb::{CategoryFilter, ExportedMessage, Message, Result, StreamName};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::registry::NamespaceRecord;

/// A message to append, before the store assigns positions.
#[derive(Clone, Debug)]
pub struct WriteMessage {
    pub stream_name: StreamName,
    pub msg_type: String,
    pub data: Value,
    pub metadata: Option<Value>,
    /// Caller-supplied id; generated when absent. A supplied id that already
    /// exists fails the write with `DUPLICATE_ID`.
    pub id: Option<Uuid>,
    /// `None` means no check; `-1` means the stream must not exist; any
    /// other value must equal the current stream version.
    pub expected_version: Option<i64>,
}

/// Result of a successful append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct WrittenPosition {
    pub position: i64,
    #[serde(rename = "globalPosition")]
    pub global_position: i64,
}

/// Options for a stream read. Batch sizes arrive pre-clamped by the facade.
#[derive(Clone, Debug)]
pub struct StreamReadOpts {
    pub position: i64,
    pub batch_size: usize,
    /// Lower bound on global position, applied after the position scan.
    pub min_global_position: i64,
}

/// Options for a category read.
#[derive(Clone, Debug)]
pub struct CategoryReadOpts {
    pub position: i64,
    pub batch_size: usize,
    pub filter: CategoryFilter,
}

#[derive(Clone, Debug)]
pub struct ListStreamsOpts {
    pub prefix: Option<String>,
    /// Keyset cursor: only streams strictly greater than this name.
    pub cursor: Option<String>,
    pub limit: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct StreamInfo {
    pub stream: String,
    pub version: i64,
    #[serde(rename = "lastActivity")]
    pub last_activity: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CategoryInfo {
    pub category: String,
    #[serde(rename = "streamCount")]
    pub stream_count: i64,
    #[serde(rename = "messageCount")]
    pub message_count: i64,
}

/// A storage backend. One per process; owns the namespace registry and
/// hands out per-namespace handles.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// `embedded`, `relational` or `partitioned`; surfaced by `sys.health`.
    fn backend_kind(&self) -> &'static str;

    /// Where this backend would keep data for a namespace (schema name,
    /// directory name, …). Recorded in the registry at creation time.
    fn data_location(&self, namespace: &str) -> String;

    /// Applies metadata migrations. Called once at startup, before traffic.
    async fn migrate_metadata(&self) -> Result<()>;

    /// Creates the registry row and the namespace's data area, and brings
    /// the area to the latest schema version. Fails with `NAMESPACE_EXISTS`
    /// when the id is taken, leaving no partial registry row behind.
    async fn create_namespace(&self, record: &NamespaceRecord) -> Result<()>;

    async fn get_namespace(&self, namespace: &str) -> Result<Option<NamespaceRecord>>;

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>>;

    /// Drops the namespace's data area and registry row. Irreversible.
    /// Returns the number of messages deleted. The caller must have
    /// invalidated any cached handle first.
    async fn delete_namespace(&self, namespace: &str) -> Result<u64>;

    async fn update_token_hash(&self, namespace: &str, token_hash: &str) -> Result<()>;

    /// Opens the namespace's data area and brings its schema up to date.
    /// Registry existence is the facade's concern, not this method's.
    async fn open(&self, namespace: &str) -> Result<Arc<dyn NamespaceStore>>;

    /// Open connections / handles, for `sys.health`.
    fn connection_count(&self) -> u32;
}

/// An open handle onto one namespace's data.
#[async_trait]
pub trait NamespaceStore: Send + Sync + 'static {
    /// Appends one message. The facade holds the namespace write latch for
    /// the whole call, so the version read and the insert are not
    /// interleaved with other appends in this process.
    async fn write_message(&self, msg: WriteMessage) -> Result<WrittenPosition>;

    /// Messages of one stream, ordered by position ascending. A missing
    /// stream yields an empty vec.
    async fn get_stream_messages(&self, stream: &str, opts: &StreamReadOpts)
        -> Result<Vec<Message>>;

    /// Messages of one category ordered by global position ascending; an
    /// empty category means every message in the namespace.
    async fn get_category_messages(
        &self,
        category: &str,
        opts: &CategoryReadOpts,
    ) -> Result<Vec<Message>>;

    async fn get_last_stream_message(
        &self,
        stream: &str,
        msg_type: Option<&str>,
    ) -> Result<Option<Message>>;

    async fn stream_version(&self, stream: &str) -> Result<Option<i64>>;

    async fn list_streams(&self, opts: &ListStreamsOpts) -> Result<Vec<StreamInfo>>;

    async fn list_categories(&self) -> Result<Vec<CategoryInfo>>;

    /// Atomic batch insert honoring the supplied positions. Any global
    /// position already present fails the whole batch with
    /// `POSITION_EXISTS` and leaves it unapplied.
    async fn import_batch(&self, messages: &[ExportedMessage]) -> Result<()>;

    async fn message_count(&self) -> Result<i64>;

    async fn stream_count(&self) -> Result<i64>;

    async fn last_activity(&self) -> Result<Option<DateTime<Utc>>>;

    async fn schema_version(&self) -> Result<u32>;
}
