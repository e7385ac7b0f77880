//! Embedded sled backend.
//!
//! One sled database per namespace under the data directory, plus a
//! `_metadata` database holding the namespace registry. Each namespace
//! database uses a single tree with printable, ordered keys:
//!
//! | Key | Value |
//! |---|---|
//! | `M:{gp}` | message JSON |
//! | `SI:{stream}:{pos}` | encoded global position |
//! | `CI:{category}:{gp}` | stream name |
//! | `ID:{message-id}` | encoded global position |
//! | `VI:{stream}` | encoded stream version |
//! | `GP` | encoded next global position |
//!
//! `{gp}` and `{pos}` are 20-digit zero-padded decimals, so lexicographic
//! key order equals numeric order and every ordered read is a range scan.
//! All keys of one append go through a single sled transaction; the
//! facade's per-namespace write latch serializes the `GP`/`VI`
//! read-modify-write around it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use eventodb::{
    category, decode_position, encode_position, Error, ExportedMessage, Message, Result,
    POSITION_DIGITS,
};
use sled::{Db, IVec, Tree};
use tracing::{debug, info};
use uuid::Uuid;

use crate::migrate::{self, KvMigration};
use crate::registry::NamespaceRecord;
use crate::store::{
    CategoryInfo, CategoryReadOpts, ListStreamsOpts, NamespaceStore, Store, StreamInfo,
    StreamReadOpts, WriteMessage, WrittenPosition,
};

const METADATA_DIR: &str = "_metadata";
const NS_PREFIX: &str = "NS:";
const SCHEMA_VERSION_KEY: &str = "_schema_version";

const GLOBAL_POSITION_KEY: &str = "GP";

fn message_key(gp: &str) -> String {
    format!("M:{gp}")
}

fn stream_index_prefix(stream: &str) -> String {
    format!("SI:{stream}:")
}

fn stream_index_key(stream: &str, position: u64) -> String {
    format!("SI:{stream}:{}", encode_position(position))
}

fn category_index_prefix(category: &str) -> String {
    format!("CI:{category}:")
}

fn id_index_key(id: &Uuid) -> String {
    format!("ID:{id}")
}

fn version_key(stream: &str) -> String {
    format!("VI:{stream}")
}

/// Exclusive upper bound for a prefix range scan. Prefixes here always end
/// with `:` so bumping the final byte never overflows.
fn upper_bound(prefix: &str) -> Vec<u8> {
    let mut bound = prefix.as_bytes().to_vec();
    *bound.last_mut().expect("prefix is never empty") += 1;
    bound
}

/// Whether the remainder of a key after its `{prefix}:` is an encoded
/// position. Stream and category names may themselves contain `:`, which
/// makes foreign entries land inside a prefix scan; they never look like a
/// bare 20-digit remainder, so they are skipped rather than misparsed.
fn is_position_suffix(rest: &[u8]) -> bool {
    rest.len() == POSITION_DIGITS && rest.iter().all(|b| b.is_ascii_digit())
}

fn decode_ivec_position(value: &IVec) -> Result<u64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(decode_position)
        .ok_or_else(|| Error::backend("corrupt position value"))
}

fn read_schema_version(tree: &Tree) -> Result<u32> {
    match tree.get(SCHEMA_VERSION_KEY).map_err(Error::backend)? {
        Some(value) => std::str::from_utf8(&value)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::backend("corrupt schema version")),
        None => Ok(0),
    }
}

fn apply_kv_migrations(tree: &Tree, set: &[KvMigration]) -> Result<()> {
    let applied = read_schema_version(tree)?;
    for migration in migrate::pending_kv(set, applied) {
        (migration.apply)(tree)?;
        tree.insert(SCHEMA_VERSION_KEY, migration.version.to_string().as_bytes())
            .map_err(Error::backend)?;
        info!(version = migration.version, name = migration.name, "applied migration");
    }
    tree.flush().map_err(Error::backend)?;
    Ok(())
}

fn init_registry(_tree: &Tree) -> Result<()> {
    Ok(())
}

fn init_global_position(tree: &Tree) -> Result<()> {
    if tree.get(GLOBAL_POSITION_KEY).map_err(Error::backend)?.is_none() {
        tree.insert(GLOBAL_POSITION_KEY, encode_position(1).as_bytes())
            .map_err(Error::backend)?;
    }
    Ok(())
}

const METADATA_MIGRATIONS: &[KvMigration] = &[KvMigration {
    version: 1,
    name: "init-registry",
    apply: init_registry,
}];

const NAMESPACE_MIGRATIONS: &[KvMigration] = &[KvMigration {
    version: 1,
    name: "init-global-position",
    apply: init_global_position,
}];

/// The embedded backend root: registry plus lazily opened namespace
/// databases.
pub struct SledStore {
    root: PathBuf,
    metadata: Db,
    // sled holds a per-database file lock, so an evicted-but-still-in-flight
    // handle must be reused rather than reopened.
    live: DashMap<String, Weak<SledNamespace>>,
}

impl SledStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(Error::backend)?;
        let metadata = sled::open(root.join(METADATA_DIR)).map_err(Error::backend)?;

        Ok(SledStore {
            root,
            metadata,
            live: DashMap::new(),
        })
    }

    fn registry_tree(&self) -> Tree {
        (*self.metadata).clone()
    }

    fn namespace_path(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn open_namespace(&self, namespace: &str) -> Result<Arc<SledNamespace>> {
        if let Some(live) = self.live.get(namespace).and_then(|weak| weak.upgrade()) {
            return Ok(live);
        }

        let db = sled::open(self.namespace_path(namespace)).map_err(Error::backend)?;
        let tree = (*db).clone();
        apply_kv_migrations(&tree, NAMESPACE_MIGRATIONS)?;

        let handle = Arc::new(SledNamespace { _db: db, tree });
        self.live
            .insert(namespace.to_owned(), Arc::downgrade(&handle));
        Ok(handle)
    }
}

#[async_trait]
impl Store for SledStore {
    fn backend_kind(&self) -> &'static str {
        "embedded"
    }

    fn data_location(&self, namespace: &str) -> String {
        namespace.to_owned()
    }

    async fn migrate_metadata(&self) -> Result<()> {
        apply_kv_migrations(&self.registry_tree(), METADATA_MIGRATIONS)
    }

    async fn create_namespace(&self, record: &NamespaceRecord) -> Result<()> {
        let registry = self.registry_tree();
        let key = format!("{NS_PREFIX}{}", record.id);
        let value = serde_json::to_vec(record).map_err(Error::backend)?;

        let swapped = registry
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(value))
            .map_err(Error::backend)?;
        if swapped.is_err() {
            return Err(Error::NamespaceExists {
                namespace: record.id.clone(),
            });
        }
        registry.flush().map_err(Error::backend)?;

        self.open_namespace(&record.id)?;
        Ok(())
    }

    async fn get_namespace(&self, namespace: &str) -> Result<Option<NamespaceRecord>> {
        self.registry_tree()
            .get(format!("{NS_PREFIX}{namespace}").as_bytes())
            .map_err(Error::backend)?
            .map(|value| serde_json::from_slice(&value).map_err(Error::backend))
            .transpose()
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>> {
        let mut records = Vec::new();
        for item in self.registry_tree().scan_prefix(NS_PREFIX.as_bytes()) {
            let (_, value) = item.map_err(Error::backend)?;
            records.push(serde_json::from_slice(&value).map_err(Error::backend)?);
        }
        Ok(records)
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        if self.get_namespace(namespace).await?.is_none() {
            return Err(Error::NamespaceNotFound {
                namespace: namespace.to_owned(),
            });
        }

        let handle = self.open_namespace(namespace)?;
        let deleted = handle.message_count().await? as u64;
        drop(handle);
        self.live.remove(namespace);

        let registry = self.registry_tree();
        registry
            .remove(format!("{NS_PREFIX}{namespace}").as_bytes())
            .map_err(Error::backend)?;
        registry.flush().map_err(Error::backend)?;

        match std::fs::remove_dir_all(self.namespace_path(namespace)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::backend(err)),
        }

        info!(namespace, messages = deleted, "namespace deleted");
        Ok(deleted)
    }

    async fn update_token_hash(&self, namespace: &str, token_hash: &str) -> Result<()> {
        let mut record = self.get_namespace(namespace).await?.ok_or_else(|| {
            Error::NamespaceNotFound {
                namespace: namespace.to_owned(),
            }
        })?;
        record.token_hash = token_hash.to_owned();

        let registry = self.registry_tree();
        registry
            .insert(
                format!("{NS_PREFIX}{namespace}").as_bytes(),
                serde_json::to_vec(&record).map_err(Error::backend)?,
            )
            .map_err(Error::backend)?;
        registry.flush().map_err(Error::backend)?;
        Ok(())
    }

    async fn open(&self, namespace: &str) -> Result<Arc<dyn NamespaceStore>> {
        Ok(self.open_namespace(namespace)?)
    }

    fn connection_count(&self) -> u32 {
        self.live
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count() as u32
    }
}

/// One open namespace database.
pub struct SledNamespace {
    _db: Db,
    tree: Tree,
}

impl SledNamespace {
    fn version_of(&self, stream: &str) -> Result<Option<u64>> {
        self.tree
            .get(version_key(stream).as_bytes())
            .map_err(Error::backend)?
            .map(|value| decode_ivec_position(&value))
            .transpose()
    }

    fn load_by_encoded_gp(&self, gp: &[u8]) -> Result<Message> {
        let gp = std::str::from_utf8(gp).map_err(|_| Error::backend("corrupt index value"))?;
        let value = self
            .tree
            .get(message_key(gp).as_bytes())
            .map_err(Error::backend)?
            .ok_or_else(|| Error::backend(format!("dangling index entry for {gp}")))?;
        serde_json::from_slice(&value).map_err(Error::backend)
    }

    fn next_global_position(&self) -> Result<u64> {
        match self
            .tree
            .get(GLOBAL_POSITION_KEY)
            .map_err(Error::backend)?
        {
            Some(value) => decode_ivec_position(&value),
            None => Ok(1),
        }
    }
}

#[async_trait]
impl NamespaceStore for SledNamespace {
    async fn write_message(&self, msg: WriteMessage) -> Result<WrittenPosition> {
        let stream = msg.stream_name.as_str();
        let stream_version = self.version_of(stream)?.map(|v| v as i64);

        match msg.expected_version {
            None => {}
            Some(-1) if stream_version.is_some() => {
                return Err(Error::StreamVersionConflict {
                    stream: stream.to_owned(),
                    expected: -1,
                    actual: stream_version,
                });
            }
            Some(-1) => {}
            Some(expected) if stream_version != Some(expected) => {
                return Err(Error::StreamVersionConflict {
                    stream: stream.to_owned(),
                    expected,
                    actual: stream_version,
                });
            }
            Some(_) => {}
        }

        let id = msg.id.unwrap_or_else(Uuid::new_v4);
        if msg.id.is_some()
            && self
                .tree
                .contains_key(id_index_key(&id).as_bytes())
                .map_err(Error::backend)?
        {
            return Err(Error::DuplicateId { id: id.to_string() });
        }

        let position = stream_version.map(|v| v + 1).unwrap_or(0);
        let global_position = self.next_global_position()?;

        let message = Message {
            id,
            stream_name: stream.to_owned(),
            msg_type: msg.msg_type,
            position,
            global_position: global_position as i64,
            data: msg.data,
            metadata: msg.metadata,
            time: Utc::now(),
        };

        let gp = encode_position(global_position);
        let payload = serde_json::to_vec(&message).map_err(Error::backend)?;
        let message_k = message_key(&gp);
        let stream_k = stream_index_key(stream, position as u64);
        let category_k = format!("CI:{}:{gp}", category(stream));
        let id_k = id_index_key(&id);
        let version_k = version_key(stream);
        let version_v = encode_position(position as u64);
        let next_gp = encode_position(global_position + 1);

        self.tree
            .transaction::<_, _, ()>(|tx| {
                tx.insert(message_k.as_bytes(), payload.clone())?;
                tx.insert(stream_k.as_bytes(), gp.as_bytes())?;
                tx.insert(category_k.as_bytes(), stream.as_bytes())?;
                tx.insert(id_k.as_bytes(), gp.as_bytes())?;
                tx.insert(version_k.as_bytes(), version_v.as_bytes())?;
                tx.insert(GLOBAL_POSITION_KEY, next_gp.as_bytes())?;
                Ok(())
            })
            .map_err(|err| Error::backend(format!("{err:?}")))?;

        debug!(stream, position, global_position, "message written");

        Ok(WrittenPosition {
            position,
            global_position: global_position as i64,
        })
    }

    async fn get_stream_messages(
        &self,
        stream: &str,
        opts: &StreamReadOpts,
    ) -> Result<Vec<Message>> {
        let prefix = stream_index_prefix(stream);
        let start = stream_index_key(stream, opts.position.max(0) as u64);
        let end = upper_bound(&prefix);

        let mut messages = Vec::new();
        for item in self.tree.range(start.as_bytes()..end.as_slice()) {
            let (key, value) = item.map_err(Error::backend)?;
            if !is_position_suffix(&key[prefix.len()..]) {
                continue;
            }
            let message = self.load_by_encoded_gp(&value)?;
            if message.global_position < opts.min_global_position {
                continue;
            }
            messages.push(message);
            if messages.len() >= opts.batch_size {
                break;
            }
        }
        Ok(messages)
    }

    async fn get_category_messages(
        &self,
        category_name: &str,
        opts: &CategoryReadOpts,
    ) -> Result<Vec<Message>> {
        let from = encode_position(opts.position.max(0) as u64);
        let mut messages = Vec::new();

        if category_name.is_empty() {
            // The whole namespace, in global-position order.
            let start = message_key(&from);
            let end = upper_bound("M:");
            for item in self.tree.range(start.as_bytes()..end.as_slice()) {
                let (_, value) = item.map_err(Error::backend)?;
                let message: Message = serde_json::from_slice(&value).map_err(Error::backend)?;
                if !opts.filter.matches(&message.stream_name, message.metadata.as_ref()) {
                    continue;
                }
                messages.push(message);
                if messages.len() >= opts.batch_size {
                    break;
                }
            }
            return Ok(messages);
        }

        let prefix = category_index_prefix(category_name);
        let start = format!("{prefix}{from}");
        let end = upper_bound(&prefix);
        for item in self.tree.range(start.as_bytes()..end.as_slice()) {
            let (key, value) = item.map_err(Error::backend)?;
            let rest = &key[prefix.len()..];
            if !is_position_suffix(rest) {
                continue;
            }

            // The index value is the stream name; the consumer-group check
            // needs nothing else, so excluded streams skip the point read.
            if let Some(group) = &opts.filter.consumer_group {
                let stream =
                    std::str::from_utf8(&value).map_err(|_| Error::backend("corrupt index"))?;
                if !group.includes(stream) {
                    continue;
                }
            }

            let message = self.load_by_encoded_gp(rest)?;
            if !opts.filter.matches(&message.stream_name, message.metadata.as_ref()) {
                continue;
            }
            messages.push(message);
            if messages.len() >= opts.batch_size {
                break;
            }
        }
        Ok(messages)
    }

    async fn get_last_stream_message(
        &self,
        stream: &str,
        msg_type: Option<&str>,
    ) -> Result<Option<Message>> {
        let Some(version) = self.version_of(stream)? else {
            return Ok(None);
        };

        match msg_type {
            None => {
                let key = stream_index_key(stream, version);
                let value = self
                    .tree
                    .get(key.as_bytes())
                    .map_err(Error::backend)?
                    .ok_or_else(|| Error::backend("missing stream index entry"))?;
                Ok(Some(self.load_by_encoded_gp(&value)?))
            }
            Some(msg_type) => {
                let prefix = stream_index_prefix(stream);
                let end = upper_bound(&prefix);
                for item in self.tree.range(prefix.as_bytes()..end.as_slice()).rev() {
                    let (key, value) = item.map_err(Error::backend)?;
                    if !is_position_suffix(&key[prefix.len()..]) {
                        continue;
                    }
                    let message = self.load_by_encoded_gp(&value)?;
                    if message.msg_type == msg_type {
                        return Ok(Some(message));
                    }
                }
                Ok(None)
            }
        }
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<i64>> {
        Ok(self.version_of(stream)?.map(|v| v as i64))
    }

    async fn list_streams(&self, opts: &ListStreamsOpts) -> Result<Vec<StreamInfo>> {
        let mut streams = Vec::new();
        for item in self.tree.scan_prefix("VI:".as_bytes()) {
            let (key, value) = item.map_err(Error::backend)?;
            let stream = std::str::from_utf8(&key[3..])
                .map_err(|_| Error::backend("corrupt stream name"))?;

            if let Some(prefix) = &opts.prefix {
                if !stream.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if let Some(cursor) = &opts.cursor {
                if stream <= cursor.as_str() {
                    continue;
                }
            }

            let version = decode_ivec_position(&value)?;
            let last = self
                .get_last_stream_message(stream, None)
                .await?
                .ok_or_else(|| Error::backend("stream with version but no messages"))?;

            streams.push(StreamInfo {
                stream: stream.to_owned(),
                version: version as i64,
                last_activity: last.time,
            });
            if streams.len() >= opts.limit {
                break;
            }
        }
        Ok(streams)
    }

    async fn list_categories(&self) -> Result<Vec<CategoryInfo>> {
        let mut categories: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        for item in self.tree.scan_prefix("VI:".as_bytes()) {
            let (key, value) = item.map_err(Error::backend)?;
            let stream = std::str::from_utf8(&key[3..])
                .map_err(|_| Error::backend("corrupt stream name"))?;
            let version = decode_ivec_position(&value)? as i64;

            let entry = categories.entry(category(stream).to_owned()).or_default();
            entry.0 += 1;
            // Positions are gapless, so version + 1 is the message count.
            entry.1 += version + 1;
        }

        Ok(categories
            .into_iter()
            .map(|(category, (stream_count, message_count))| CategoryInfo {
                category,
                stream_count,
                message_count,
            })
            .collect())
    }

    async fn import_batch(&self, messages: &[ExportedMessage]) -> Result<()> {
        struct Insert {
            message_key: String,
            payload: Vec<u8>,
            stream_key: String,
            category_key: String,
            id_key: String,
            gp: String,
            stream: String,
        }

        let mut seen = HashSet::new();
        let mut stream_versions: HashMap<String, u64> = HashMap::new();
        let mut max_gp = 0u64;
        let mut inserts = Vec::with_capacity(messages.len());

        for msg in messages {
            if msg.pos < 0 || msg.gpos < 1 {
                return Err(Error::invalid_request(format!(
                    "message {} has invalid positions (pos {}, gpos {})",
                    msg.id, msg.pos, msg.gpos
                )));
            }
            let gp = msg.gpos as u64;
            let gp_enc = encode_position(gp);
            if !seen.insert(gp)
                || self
                    .tree
                    .contains_key(message_key(&gp_enc).as_bytes())
                    .map_err(Error::backend)?
            {
                return Err(Error::PositionExists {
                    global_position: msg.gpos,
                    line: None,
                });
            }
            if self
                .tree
                .contains_key(id_index_key(&msg.id).as_bytes())
                .map_err(Error::backend)?
            {
                return Err(Error::DuplicateId {
                    id: msg.id.to_string(),
                });
            }

            let message = Message::from(msg.clone());
            inserts.push(Insert {
                message_key: message_key(&gp_enc),
                payload: serde_json::to_vec(&message).map_err(Error::backend)?,
                stream_key: stream_index_key(&message.stream_name, message.position as u64),
                category_key: format!("CI:{}:{gp_enc}", category(&message.stream_name)),
                id_key: id_index_key(&message.id),
                gp: gp_enc,
                stream: message.stream_name.clone(),
            });

            let entry = stream_versions.entry(message.stream_name).or_insert(0);
            *entry = (*entry).max(message.position as u64);
            max_gp = max_gp.max(gp);
        }

        let next_gp = self.next_global_position()?.max(max_gp + 1);
        let mut versions = Vec::with_capacity(stream_versions.len());
        for (stream, position) in &stream_versions {
            let version = self.version_of(stream)?.map_or(*position, |v| v.max(*position));
            versions.push((version_key(stream), encode_position(version)));
        }

        self.tree
            .transaction::<_, _, ()>(|tx| {
                for insert in &inserts {
                    tx.insert(insert.message_key.as_bytes(), insert.payload.clone())?;
                    tx.insert(insert.stream_key.as_bytes(), insert.gp.as_bytes())?;
                    tx.insert(insert.category_key.as_bytes(), insert.stream.as_bytes())?;
                    tx.insert(insert.id_key.as_bytes(), insert.gp.as_bytes())?;
                }
                for (version_k, version_v) in &versions {
                    tx.insert(version_k.as_bytes(), version_v.as_bytes())?;
                }
                tx.insert(GLOBAL_POSITION_KEY, encode_position(next_gp).as_bytes())?;
                Ok(())
            })
            .map_err(|err| Error::backend(format!("{err:?}")))?;

        Ok(())
    }

    async fn message_count(&self) -> Result<i64> {
        let mut count = 0i64;
        for item in self.tree.scan_prefix("M:".as_bytes()) {
            item.map_err(Error::backend)?;
            count += 1;
        }
        Ok(count)
    }

    async fn stream_count(&self) -> Result<i64> {
        let mut count = 0i64;
        for item in self.tree.scan_prefix("VI:".as_bytes()) {
            item.map_err(Error::backend)?;
            count += 1;
        }
        Ok(count)
    }

    async fn last_activity(&self) -> Result<Option<DateTime<Utc>>> {
        let end = upper_bound("M:");
        match self.tree.range("M:".as_bytes()..end.as_slice()).next_back() {
            Some(item) => {
                let (_, value) = item.map_err(Error::backend)?;
                let message: Message = serde_json::from_slice(&value).map_err(Error::backend)?;
                Ok(Some(message.time))
            }
            None => Ok(None),
        }
    }

    async fn schema_version(&self) -> Result<u32> {
        read_schema_version(&self.tree)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use eventodb::{CategoryFilter, ConsumerGroup, StreamName};
    use serde_json::json;

    use super::*;
    use crate::token;

    fn test_store() -> (tempfile::TempDir, SledStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();
        (dir, store)
    }

    async fn test_namespace(store: &SledStore, id: &str) -> Arc<dyn NamespaceStore> {
        store.migrate_metadata().await.unwrap();
        let token = token::generate(id);
        store
            .create_namespace(&NamespaceRecord {
                id: id.to_owned(),
                token_hash: token::hash(&token),
                data_location: store.data_location(id),
                description: String::new(),
                created_at: Utc::now(),
                metadata: None,
            })
            .await
            .unwrap();
        store.open(id).await.unwrap()
    }

    fn write(stream: &str, msg_type: &str) -> WriteMessage {
        WriteMessage {
            stream_name: StreamName::new(stream).unwrap(),
            msg_type: msg_type.to_owned(),
            data: json!({"n": 1}),
            metadata: None,
            id: None,
            expected_version: None,
        }
    }

    fn stream_opts() -> StreamReadOpts {
        StreamReadOpts {
            position: 0,
            batch_size: 1000,
            min_global_position: 0,
        }
    }

    fn category_opts() -> CategoryReadOpts {
        CategoryReadOpts {
            position: 0,
            batch_size: 1000,
            filter: CategoryFilter::default(),
        }
    }

    #[tokio::test]
    async fn positions_are_gapless_and_global_positions_monotonic() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        let first = ns.write_message(write("account-1", "Opened")).await.unwrap();
        assert_eq!(first.position, 0);
        assert_eq!(first.global_position, 1);

        let second = ns.write_message(write("account-1", "Credited")).await.unwrap();
        assert_eq!(second.position, 1);
        assert_eq!(second.global_position, 2);

        let other = ns.write_message(write("order-9", "Placed")).await.unwrap();
        assert_eq!(other.position, 0);
        assert_eq!(other.global_position, 3);

        let messages = ns.get_stream_messages("account-1", &stream_opts()).await.unwrap();
        let positions: Vec<_> = messages.iter().map(|m| m.position).collect();
        assert_eq!(positions, [0, 1]);
        assert_eq!(ns.stream_version("account-1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn missing_stream_reads_empty_and_version_none() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        assert!(ns.get_stream_messages("ghost-1", &stream_opts()).await.unwrap().is_empty());
        assert_eq!(ns.stream_version("ghost-1").await.unwrap(), None);
        assert!(ns.get_last_stream_message("ghost-1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expected_version_semantics() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        // -1 accepts the first write and rejects any later one.
        let mut msg = write("account-1", "Opened");
        msg.expected_version = Some(-1);
        ns.write_message(msg.clone()).await.unwrap();
        let err = ns.write_message(msg).await.unwrap_err();
        assert_eq!(err.code(), "STREAM_VERSION_CONFLICT");

        let mut msg = write("account-1", "Credited");
        msg.expected_version = Some(0);
        ns.write_message(msg).await.unwrap();

        let mut msg = write("account-1", "Credited");
        msg.expected_version = Some(0);
        let err = ns.write_message(msg).await.unwrap_err();
        match err {
            Error::StreamVersionConflict { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, Some(1));
            }
            other => panic!("unexpected error {other:?}"),
        }

        // Expecting a version on a missing stream conflicts too.
        let mut msg = write("fresh-1", "Opened");
        msg.expected_version = Some(3);
        let err = ns.write_message(msg).await.unwrap_err();
        assert_eq!(err.code(), "STREAM_VERSION_CONFLICT");
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        let id = Uuid::new_v4();
        let mut msg = write("account-1", "Opened");
        msg.id = Some(id);
        ns.write_message(msg).await.unwrap();

        let mut msg = write("account-2", "Opened");
        msg.id = Some(id);
        let err = ns.write_message(msg).await.unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_ID");
    }

    #[tokio::test]
    async fn category_reads_span_streams_in_global_order() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        for stream in ["account-1", "account-2", "order-1", "account-3"] {
            ns.write_message(write(stream, "Opened")).await.unwrap();
        }

        let messages = ns.get_category_messages("account", &category_opts()).await.unwrap();
        let streams: Vec<_> = messages.iter().map(|m| m.stream_name.as_str()).collect();
        assert_eq!(streams, ["account-1", "account-2", "account-3"]);
        let gps: Vec<_> = messages.iter().map(|m| m.global_position).collect();
        assert!(gps.windows(2).all(|w| w[0] < w[1]));

        // Empty category means the whole namespace.
        let all = ns.get_category_messages("", &category_opts()).await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn consumer_group_partitions_do_not_overlap() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        for i in 1..=4 {
            ns.write_message(write(&format!("account-{i}"), "Opened")).await.unwrap();
        }

        let member = |m| {
            let mut opts = category_opts();
            opts.filter.consumer_group = Some(ConsumerGroup { member: m, size: 2 });
            opts
        };
        let first = ns.get_category_messages("account", &member(0)).await.unwrap();
        let second = ns.get_category_messages("account", &member(1)).await.unwrap();

        assert_eq!(first.len() + second.len(), 4);
        for msg in &first {
            assert!(!second.iter().any(|other| other.id == msg.id));
        }
    }

    #[tokio::test]
    async fn correlation_filters_by_metadata_prefix() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        let mut correlated = write("account-1", "Opened");
        correlated.metadata = Some(json!({"correlationStreamName": "billing-7"}));
        ns.write_message(correlated).await.unwrap();
        ns.write_message(write("account-2", "Opened")).await.unwrap();

        let mut opts = category_opts();
        opts.filter.correlation = Some("billing".to_owned());
        let messages = ns.get_category_messages("account", &opts).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].stream_name, "account-1");
    }

    #[tokio::test]
    async fn last_message_with_and_without_type() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        ns.write_message(write("account-1", "Opened")).await.unwrap();
        ns.write_message(write("account-1", "Credited")).await.unwrap();
        ns.write_message(write("account-1", "Credited")).await.unwrap();

        let last = ns.get_last_stream_message("account-1", None).await.unwrap().unwrap();
        assert_eq!(last.position, 2);

        let opened = ns
            .get_last_stream_message("account-1", Some("Opened"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.position, 0);

        assert!(ns
            .get_last_stream_message("account-1", Some("Closed"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_streams_paginates_by_cursor() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        for stream in ["account-1", "account-2", "account-3", "order-1"] {
            ns.write_message(write(stream, "Opened")).await.unwrap();
        }

        let page = ns
            .list_streams(&ListStreamsOpts {
                prefix: Some("account-".to_owned()),
                cursor: None,
                limit: 2,
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].stream, "account-1");

        let rest = ns
            .list_streams(&ListStreamsOpts {
                prefix: Some("account-".to_owned()),
                cursor: Some(page[1].stream.clone()),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].stream, "account-3");
    }

    #[tokio::test]
    async fn list_categories_counts_streams_and_messages() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        ns.write_message(write("account-1", "Opened")).await.unwrap();
        ns.write_message(write("account-1", "Credited")).await.unwrap();
        ns.write_message(write("account-2", "Opened")).await.unwrap();
        ns.write_message(write("order-1", "Placed")).await.unwrap();

        let categories = ns.list_categories().await.unwrap();
        assert_eq!(categories.len(), 2);
        assert_eq!(categories[0].category, "account");
        assert_eq!(categories[0].stream_count, 2);
        assert_eq!(categories[0].message_count, 3);
        assert_eq!(categories[1].category, "order");
        assert_eq!(categories[1].message_count, 1);
    }

    #[tokio::test]
    async fn import_preserves_supplied_positions() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        let line = |stream: &str, pos, gpos| ExportedMessage {
            id: Uuid::new_v4(),
            stream: stream.to_owned(),
            msg_type: "Ran".to_owned(),
            pos,
            gpos,
            data: json!({}),
            meta: None,
            time: Utc::now(),
        };

        ns.import_batch(&[
            line("workflow-1", 0, 47),
            line("order-1", 0, 52),
            line("workflow-1", 1, 89),
        ])
        .await
        .unwrap();

        let messages = ns.get_stream_messages("workflow-1", &stream_opts()).await.unwrap();
        let gps: Vec<_> = messages.iter().map(|m| m.global_position).collect();
        assert_eq!(gps, [47, 89]);
        assert_eq!(ns.stream_version("workflow-1").await.unwrap(), Some(1));
        assert_eq!(ns.stream_version("order-1").await.unwrap(), Some(0));

        // Appends after an import continue above the imported positions.
        let next = ns.write_message(write("workflow-1", "Ran")).await.unwrap();
        assert_eq!(next.position, 2);
        assert!(next.global_position > 89);

        // A colliding global position fails the batch atomically.
        let before = ns.message_count().await.unwrap();
        let err = ns
            .import_batch(&[line("other-1", 0, 47)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "POSITION_EXISTS");
        assert_eq!(ns.message_count().await.unwrap(), before);
    }

    #[tokio::test]
    async fn namespaces_are_physically_isolated() {
        let (_dir, store) = test_store();
        let a = test_namespace(&store, "tenant-a").await;
        let b = test_namespace(&store, "tenant-b").await;

        a.write_message(write("account-1", "Opened")).await.unwrap();
        b.write_message(write("account-1", "Opened")).await.unwrap();

        assert_eq!(a.get_stream_messages("account-1", &stream_opts()).await.unwrap().len(), 1);
        assert_eq!(b.get_stream_messages("account-1", &stream_opts()).await.unwrap().len(), 1);

        // Global positions are per namespace.
        assert_eq!(
            a.get_stream_messages("account-1", &stream_opts()).await.unwrap()[0].global_position,
            1
        );
        assert_eq!(
            b.get_stream_messages("account-1", &stream_opts()).await.unwrap()[0].global_position,
            1
        );
    }

    #[tokio::test]
    async fn delete_namespace_drops_data_and_registry_row() {
        let (dir, store) = test_store();
        let ns = test_namespace(&store, "doomed").await;
        ns.write_message(write("account-1", "Opened")).await.unwrap();
        ns.write_message(write("account-2", "Opened")).await.unwrap();
        drop(ns);

        let deleted = store.delete_namespace("doomed").await.unwrap();
        assert_eq!(deleted, 2);
        assert!(store.get_namespace("doomed").await.unwrap().is_none());
        assert!(!dir.path().join("doomed").exists());

        let err = store.delete_namespace("doomed").await.unwrap_err();
        assert_eq!(err.code(), "NAMESPACE_NOT_FOUND");
    }

    #[tokio::test]
    async fn create_namespace_twice_fails() {
        let (_dir, store) = test_store();
        test_namespace(&store, "dup").await;

        let err = store
            .create_namespace(&NamespaceRecord {
                id: "dup".to_owned(),
                token_hash: token::hash(&token::generate("dup")),
                data_location: store.data_location("dup"),
                description: String::new(),
                created_at: Utc::now(),
                metadata: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NAMESPACE_EXISTS");
    }

    #[tokio::test]
    async fn reopening_a_namespace_is_idempotent() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;
        ns.write_message(write("account-1", "Opened")).await.unwrap();
        assert_eq!(ns.schema_version().await.unwrap(), 1);
        drop(ns);
        store.live.remove("t1");

        let reopened = store.open("t1").await.unwrap();
        assert_eq!(reopened.schema_version().await.unwrap(), 1);
        assert_eq!(reopened.stream_version("account-1").await.unwrap(), Some(0));
        let next = reopened.write_message(write("account-1", "Credited")).await.unwrap();
        assert_eq!(next.global_position, 2);
    }

    #[tokio::test]
    async fn stream_get_honors_min_global_position() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        ns.write_message(write("account-1", "Opened")).await.unwrap();
        ns.write_message(write("order-1", "Placed")).await.unwrap();
        ns.write_message(write("account-1", "Credited")).await.unwrap();

        let opts = StreamReadOpts {
            position: 0,
            batch_size: 1000,
            min_global_position: 3,
        };
        let messages = ns.get_stream_messages("account-1", &opts).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].position, 1);
    }

    #[tokio::test]
    async fn stream_names_with_colons_do_not_cross_scans() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        // "foo" and "foo:bar" share the "SI:foo:" key prefix; the scan must
        // keep their entries apart.
        ns.write_message(write("foo", "A")).await.unwrap();
        ns.write_message(write("foo:bar", "B")).await.unwrap();
        ns.write_message(write("foo", "C")).await.unwrap();

        let foo = ns.get_stream_messages("foo", &stream_opts()).await.unwrap();
        let types: Vec<_> = foo.iter().map(|m| m.msg_type.as_str()).collect();
        assert_eq!(types, ["A", "C"]);

        let other = ns.get_stream_messages("foo:bar", &stream_opts()).await.unwrap();
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].msg_type, "B");

        assert_eq!(ns.stream_version("foo").await.unwrap(), Some(1));
        assert_eq!(ns.stream_version("foo:bar").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn batch_size_pages_through_a_stream() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        for _ in 0..5 {
            ns.write_message(write("account-1", "Hit")).await.unwrap();
        }

        let mut opts = stream_opts();
        opts.batch_size = 2;
        let first = ns.get_stream_messages("account-1", &opts).await.unwrap();
        assert_eq!(first.len(), 2);

        opts.position = first.last().unwrap().position + 1;
        let second = ns.get_stream_messages("account-1", &opts).await.unwrap();
        let positions: Vec<_> = second.iter().map(|m| m.position).collect();
        assert_eq!(positions, [2, 3]);

        let mut opts = category_opts();
        opts.batch_size = 3;
        let page = ns.get_category_messages("account", &opts).await.unwrap();
        assert_eq!(page.len(), 3);
        opts.position = page.last().unwrap().global_position + 1;
        let rest = ns.get_category_messages("account", &opts).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn unicode_survives_storage() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        let mut msg = write("konto-ålesund", "Geöffnet");
        msg.data = json!({"notiz": "überweisung → 完了"});
        msg.metadata = Some(json!({"quelle": "büro"}));
        ns.write_message(msg.clone()).await.unwrap();

        let stored = &ns.get_stream_messages("konto-ålesund", &stream_opts()).await.unwrap()[0];
        assert_eq!(stored.data, msg.data);
        assert_eq!(stored.metadata, msg.metadata);
        assert_eq!(stored.msg_type, "Geöffnet");

        let by_category = ns.get_category_messages("konto", &category_opts()).await.unwrap();
        assert_eq!(by_category.len(), 1);
    }

    #[tokio::test]
    async fn import_rejects_in_batch_duplicates() {
        let (_dir, store) = test_store();
        let ns = test_namespace(&store, "t1").await;

        let id = Uuid::new_v4();
        let line = |gpos, id| ExportedMessage {
            id,
            stream: "workflow-1".to_owned(),
            msg_type: "Ran".to_owned(),
            pos: 0,
            gpos,
            data: json!({}),
            meta: None,
            time: Utc::now(),
        };

        let err = ns
            .import_batch(&[line(1, id), line(1, Uuid::new_v4())])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "POSITION_EXISTS");

        let err = ns
            .import_batch(&[line(1, id), line(2, id)])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_ID");

        assert_eq!(ns.message_count().await.unwrap(), 0);
    }
}
