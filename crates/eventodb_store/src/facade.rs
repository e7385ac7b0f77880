//! The store facade: one object the server talks to, whatever the backend.
//!
//! Dispatches operations by namespace. Handles are opened lazily, cached
//! with LRU eviction (an evicted handle reopens transparently on next use),
//! and populated single-flight so concurrent first requests for one
//! namespace share a single open. Appends are serialized through a
//! per-namespace write latch held across the whole read-modify-write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use eventodb::{
    CategoryFilter, Error, ExportedMessage, Message, Result, StreamName, WriteEvent,
};
use moka::future::Cache;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::registry::{validate_namespace_id, NamespaceRecord};
use crate::store::{
    CategoryInfo, CategoryReadOpts, ListStreamsOpts, NamespaceStore, Store, StreamInfo,
    StreamReadOpts, WriteMessage, WrittenPosition,
};
use crate::token;

/// The namespace whose token carries admin rights.
pub const DEFAULT_NAMESPACE: &str = "default";

const DEFAULT_BATCH_SIZE: usize = 1_000;
const MAX_BATCH_SIZE: usize = 10_000;
const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1_000;

/// Registry row enriched with live counts, as returned by `ns.list` and
/// `ns.info`.
#[derive(Clone, Debug)]
pub struct NamespaceDetails {
    pub namespace: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub message_count: i64,
    pub stream_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

pub struct StoreFacade {
    store: Arc<dyn Store>,
    handles: Cache<String, Arc<dyn NamespaceStore>>,
    latches: DashMap<String, Arc<Mutex<()>>>,
}

impl StoreFacade {
    /// Handles kept open before LRU eviction kicks in.
    pub const DEFAULT_CACHE_SIZE: u64 = 100;

    pub fn new(store: Arc<dyn Store>, handle_cache_size: u64) -> Self {
        StoreFacade {
            store,
            handles: Cache::builder().max_capacity(handle_cache_size).build(),
            latches: DashMap::new(),
        }
    }

    pub fn backend_kind(&self) -> &'static str {
        self.store.backend_kind()
    }

    pub fn connection_count(&self) -> u32 {
        self.store.connection_count()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Applies metadata migrations, then brings every registered namespace
    /// to the latest schema version. A namespace that fails stays
    /// quarantined: it is skipped here and keeps failing with
    /// `BACKEND_ERROR` until a later open succeeds.
    pub async fn migrate_on_startup(&self) -> Result<()> {
        self.store.migrate_metadata().await?;

        for record in self.store.list_namespaces().await? {
            if let Err(err) = self.store.open(&record.id).await {
                error!(namespace = %record.id, %err, "namespace migration failed; quarantined");
            }
        }
        Ok(())
    }

    /// Makes sure the `default` namespace exists. When `token` is given its
    /// hash becomes the default namespace's credential (creating or
    /// rotating as needed) and `None` is returned; otherwise a namespace
    /// created here gets a generated token, returned once for the operator.
    pub async fn ensure_default_namespace(&self, bootstrap: Option<&str>) -> Result<Option<String>> {
        match self.store.get_namespace(DEFAULT_NAMESPACE).await? {
            Some(_) => {
                if let Some(token) = bootstrap {
                    self.store
                        .update_token_hash(DEFAULT_NAMESPACE, &token::hash(token))
                        .await?;
                    info!("default namespace token set from configuration");
                }
                Ok(None)
            }
            None => {
                let (_, plaintext) = self
                    .create_namespace(
                        DEFAULT_NAMESPACE,
                        bootstrap.map(str::to_owned),
                        Some("bootstrap namespace".to_owned()),
                        None,
                    )
                    .await?;
                Ok(if bootstrap.is_some() { None } else { Some(plaintext) })
            }
        }
    }

    /// Looks up a namespace handle: registry check, then the LRU cache with
    /// a single-flight open on miss.
    pub async fn handle(&self, namespace: &str) -> Result<Arc<dyn NamespaceStore>> {
        if self.store.get_namespace(namespace).await?.is_none() {
            return Err(Error::NamespaceNotFound {
                namespace: namespace.to_owned(),
            });
        }

        self.handles
            .try_get_with(namespace.to_owned(), self.store.open(namespace))
            .await
            .map_err(|err: Arc<Error>| (*err).clone())
    }

    fn latch(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.latches
            .entry(namespace.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ------------------------------------------------------------------
    // Append / read
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn write_message(
        &self,
        namespace: &str,
        stream: &str,
        msg_type: &str,
        data: Value,
        metadata: Option<Value>,
        id: Option<Uuid>,
        expected_version: Option<i64>,
    ) -> Result<(WrittenPosition, WriteEvent)> {
        let stream_name = StreamName::new(stream)
            .map_err(|_| Error::invalid_request("stream name must not be empty"))?;
        if msg_type.is_empty() {
            return Err(Error::invalid_request("message type must not be empty"));
        }

        let handle = self.handle(namespace).await?;
        let latch = self.latch(namespace);
        let guard = latch.lock().await;
        let written = handle
            .write_message(WriteMessage {
                stream_name,
                msg_type: msg_type.to_owned(),
                data,
                metadata,
                id,
                expected_version,
            })
            .await?;
        drop(guard);

        let event = WriteEvent {
            namespace: namespace.to_owned(),
            stream: stream.to_owned(),
            position: written.position,
            global_position: written.global_position,
        };
        Ok((written, event))
    }

    pub async fn get_stream_messages(
        &self,
        namespace: &str,
        stream: &str,
        position: Option<i64>,
        global_position: Option<i64>,
        batch_size: Option<i64>,
    ) -> Result<Vec<Message>> {
        let opts = StreamReadOpts {
            position: position.unwrap_or(0).max(0),
            batch_size: clamp_batch(batch_size)?,
            min_global_position: global_position.unwrap_or(0).max(0),
        };
        self.handle(namespace)
            .await?
            .get_stream_messages(stream, &opts)
            .await
    }

    pub async fn get_category_messages(
        &self,
        namespace: &str,
        category: &str,
        position: Option<i64>,
        batch_size: Option<i64>,
        filter: CategoryFilter,
    ) -> Result<Vec<Message>> {
        filter.validate()?;
        let opts = CategoryReadOpts {
            position: position.unwrap_or(0).max(0),
            batch_size: clamp_batch(batch_size)?,
            filter,
        };
        self.handle(namespace)
            .await?
            .get_category_messages(category, &opts)
            .await
    }

    pub async fn get_last_stream_message(
        &self,
        namespace: &str,
        stream: &str,
        msg_type: Option<&str>,
    ) -> Result<Option<Message>> {
        self.handle(namespace)
            .await?
            .get_last_stream_message(stream, msg_type)
            .await
    }

    pub async fn stream_version(&self, namespace: &str, stream: &str) -> Result<Option<i64>> {
        self.handle(namespace).await?.stream_version(stream).await
    }

    pub async fn list_streams(
        &self,
        namespace: &str,
        prefix: Option<String>,
        cursor: Option<String>,
        limit: Option<i64>,
    ) -> Result<Vec<StreamInfo>> {
        let opts = ListStreamsOpts {
            prefix,
            cursor,
            limit: clamp_limit(limit)?,
        };
        self.handle(namespace).await?.list_streams(&opts).await
    }

    pub async fn list_categories(&self, namespace: &str) -> Result<Vec<CategoryInfo>> {
        self.handle(namespace).await?.list_categories().await
    }

    // ------------------------------------------------------------------
    // Bulk import
    // ------------------------------------------------------------------

    /// Import precondition: the target namespace holds no messages.
    pub async fn assert_namespace_empty(&self, namespace: &str) -> Result<()> {
        if self.handle(namespace).await?.message_count().await? > 0 {
            return Err(Error::NamespaceNotEmpty {
                namespace: namespace.to_owned(),
            });
        }
        Ok(())
    }

    pub async fn import_batch(
        &self,
        namespace: &str,
        messages: &[ExportedMessage],
    ) -> Result<()> {
        let handle = self.handle(namespace).await?;
        let latch = self.latch(namespace);
        let _guard = latch.lock().await;
        handle.import_batch(messages).await
    }

    // ------------------------------------------------------------------
    // Namespace administration
    // ------------------------------------------------------------------

    /// Creates a namespace and returns its record together with the
    /// plaintext token. The plaintext is never recoverable afterwards.
    pub async fn create_namespace(
        &self,
        id: &str,
        supplied_token: Option<String>,
        description: Option<String>,
        metadata: Option<Value>,
    ) -> Result<(NamespaceRecord, String)> {
        validate_namespace_id(id)?;

        let plaintext = supplied_token.unwrap_or_else(|| token::generate(id));
        let record = NamespaceRecord {
            id: id.to_owned(),
            token_hash: token::hash(&plaintext),
            data_location: self.store.data_location(id),
            description: description.unwrap_or_default(),
            created_at: Utc::now(),
            metadata,
        };
        self.store.create_namespace(&record).await?;
        info!(namespace = id, "namespace created");
        Ok((record, plaintext))
    }

    /// Drops a namespace's data and registry row. Irreversible. Returns the
    /// number of messages deleted.
    pub async fn delete_namespace(&self, id: &str) -> Result<u64> {
        self.handles.invalidate(id).await;
        let deleted = self.store.delete_namespace(id).await?;
        self.latches.remove(id);
        Ok(deleted)
    }

    /// Replaces the namespace token; the old token fails on its next use.
    pub async fn rotate_token(&self, id: &str) -> Result<String> {
        if self.store.get_namespace(id).await?.is_none() {
            return Err(Error::NamespaceNotFound {
                namespace: id.to_owned(),
            });
        }
        let plaintext = token::generate(id);
        self.store.update_token_hash(id, &token::hash(&plaintext)).await?;
        info!(namespace = id, "token rotated");
        Ok(plaintext)
    }

    pub async fn get_namespace_record(&self, id: &str) -> Result<Option<NamespaceRecord>> {
        self.store.get_namespace(id).await
    }

    pub async fn namespace_details(&self, id: &str) -> Result<NamespaceDetails> {
        let record = self.store.get_namespace(id).await?.ok_or_else(|| {
            Error::NamespaceNotFound {
                namespace: id.to_owned(),
            }
        })?;
        self.details_for(record).await
    }

    pub async fn list_namespace_details(&self) -> Result<Vec<NamespaceDetails>> {
        let mut details = Vec::new();
        for record in self.store.list_namespaces().await? {
            let id = record.id.clone();
            match self.details_for(record).await {
                Ok(d) => details.push(d),
                // A quarantined namespace still shows up, with zeroed counts.
                Err(err) => {
                    warn!(namespace = %id, %err, "failed to inspect namespace");
                }
            }
        }
        details.sort_by(|a, b| a.namespace.cmp(&b.namespace));
        Ok(details)
    }

    async fn details_for(&self, record: NamespaceRecord) -> Result<NamespaceDetails> {
        let handle = self.handle(&record.id).await?;
        Ok(NamespaceDetails {
            namespace: record.id,
            description: record.description,
            created_at: record.created_at,
            message_count: handle.message_count().await?,
            stream_count: handle.stream_count().await?,
            last_activity: handle.last_activity().await?,
        })
    }
}

fn clamp_batch(requested: Option<i64>) -> Result<usize> {
    match requested {
        None | Some(0) => Ok(DEFAULT_BATCH_SIZE),
        Some(-1) => Ok(MAX_BATCH_SIZE),
        Some(n) if n < -1 => Err(Error::invalid_request(format!("invalid batch size {n}"))),
        Some(n) => Ok((n as usize).min(MAX_BATCH_SIZE)),
    }
}

fn clamp_limit(requested: Option<i64>) -> Result<usize> {
    match requested {
        None | Some(0) => Ok(DEFAULT_LIST_LIMIT),
        Some(n) if n < 0 => Err(Error::invalid_request(format!("invalid limit {n}"))),
        Some(n) => Ok((n as usize).min(MAX_LIST_LIMIT)),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::sled_store::SledStore;

    async fn facade_with(cache_size: u64) -> (tempfile::TempDir, StoreFacade) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SledStore::open(dir.path()).unwrap());
        let facade = StoreFacade::new(store, cache_size);
        facade.migrate_on_startup().await.unwrap();
        (dir, facade)
    }

    #[tokio::test]
    async fn unknown_namespace_is_reported_before_any_open() {
        let (_dir, facade) = facade_with(10).await;
        let err = facade.stream_version("ghost", "account-1").await.unwrap_err();
        assert_eq!(err.code(), "NAMESPACE_NOT_FOUND");
    }

    #[tokio::test]
    async fn write_validates_stream_and_type() {
        let (_dir, facade) = facade_with(10).await;
        facade.create_namespace("t1", None, None, None).await.unwrap();

        let err = facade
            .write_message("t1", "", "Opened", json!({}), None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        let err = facade
            .write_message("t1", "account-1", "", json!({}), None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (_dir, facade) = facade_with(10).await;
        facade.create_namespace("t1", None, None, None).await.unwrap();

        let (written, event) = facade
            .write_message(
                "t1",
                "account-1",
                "Opened",
                json!({"balance": 0}),
                None,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(written.position, 0);
        assert_eq!(written.global_position, 1);
        assert_eq!(event.stream, "account-1");
        assert_eq!(event.global_position, 1);

        let messages = facade
            .get_stream_messages("t1", "account-1", None, None, None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].data, json!({"balance": 0}));
        assert_eq!(facade.stream_version("t1", "account-1").await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn consumer_group_bounds_are_validated() {
        let (_dir, facade) = facade_with(10).await;
        facade.create_namespace("t1", None, None, None).await.unwrap();

        let filter = CategoryFilter {
            correlation: None,
            consumer_group: Some(eventodb::ConsumerGroup { member: 1, size: 1 }),
        };
        let err = facade
            .get_category_messages("t1", "account", None, None, filter)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn tiny_handle_cache_still_serves_every_namespace() {
        let (_dir, facade) = facade_with(1).await;
        facade.create_namespace("a1", None, None, None).await.unwrap();
        facade.create_namespace("b2", None, None, None).await.unwrap();

        for round in 0..3 {
            for ns in ["a1", "b2"] {
                facade
                    .write_message(ns, "account-1", "Ping", json!({"round": round}), None, None, None)
                    .await
                    .unwrap();
            }
        }

        assert_eq!(facade.stream_version("a1", "account-1").await.unwrap(), Some(2));
        assert_eq!(facade.stream_version("b2", "account-1").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_stream_serialize() {
        let (_dir, facade) = facade_with(10).await;
        facade.create_namespace("t1", None, None, None).await.unwrap();
        let facade = Arc::new(facade);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let facade = facade.clone();
            tasks.push(tokio::spawn(async move {
                facade
                    .write_message("t1", "account-1", "Hit", json!({}), None, None, None)
                    .await
                    .unwrap()
                    .0
            }));
        }

        let mut positions = Vec::new();
        for task in tasks {
            positions.push(task.await.unwrap().position);
        }
        positions.sort();
        let expected: Vec<i64> = (0..20).collect();
        assert_eq!(positions, expected);
    }

    #[tokio::test]
    async fn token_rotation_invalidates_the_old_token() {
        let (_dir, facade) = facade_with(10).await;
        let (record, old_token) = facade.create_namespace("t1", None, None, None).await.unwrap();
        assert!(token::verify(&old_token, &record.token_hash));

        let new_token = facade.rotate_token("t1").await.unwrap();
        let record = facade.get_namespace_record("t1").await.unwrap().unwrap();
        assert!(token::verify(&new_token, &record.token_hash));
        assert!(!token::verify(&old_token, &record.token_hash));
    }

    #[tokio::test]
    async fn import_requires_an_empty_namespace() {
        let (_dir, facade) = facade_with(10).await;
        facade.create_namespace("t1", None, None, None).await.unwrap();
        facade.assert_namespace_empty("t1").await.unwrap();

        facade
            .write_message("t1", "account-1", "Opened", json!({}), None, None, None)
            .await
            .unwrap();
        let err = facade.assert_namespace_empty("t1").await.unwrap_err();
        assert_eq!(err.code(), "NAMESPACE_NOT_EMPTY");
    }

    #[tokio::test]
    async fn details_include_counts() {
        let (_dir, facade) = facade_with(10).await;
        facade.create_namespace("t1", None, Some("tenant one".to_owned()), None).await.unwrap();
        facade
            .write_message("t1", "account-1", "Opened", json!({}), None, None, None)
            .await
            .unwrap();
        facade
            .write_message("t1", "order-1", "Placed", json!({}), None, None, None)
            .await
            .unwrap();

        let details = facade.namespace_details("t1").await.unwrap();
        assert_eq!(details.message_count, 2);
        assert_eq!(details.stream_count, 2);
        assert_eq!(details.description, "tenant one");
        assert!(details.last_activity.is_some());

        let all = facade.list_namespace_details().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn delete_then_recreate_starts_fresh() {
        let (_dir, facade) = facade_with(10).await;
        facade.create_namespace("t1", None, None, None).await.unwrap();
        facade
            .write_message("t1", "account-1", "Opened", json!({}), None, None, None)
            .await
            .unwrap();

        assert_eq!(facade.delete_namespace("t1").await.unwrap(), 1);
        facade.create_namespace("t1", None, None, None).await.unwrap();
        assert_eq!(facade.stream_version("t1", "account-1").await.unwrap(), None);
        let (written, _) = facade
            .write_message("t1", "account-1", "Opened", json!({}), None, None, None)
            .await
            .unwrap();
        assert_eq!(written.global_position, 1);
    }

    #[tokio::test]
    async fn ensure_default_namespace_bootstraps_once() {
        let (_dir, facade) = facade_with(10).await;

        let generated = facade.ensure_default_namespace(None).await.unwrap();
        let plaintext = generated.expect("first boot generates a token");
        let record = facade.get_namespace_record(DEFAULT_NAMESPACE).await.unwrap().unwrap();
        assert!(token::verify(&plaintext, &record.token_hash));

        // Second boot with a configured token rotates to it.
        let configured = token::generate(DEFAULT_NAMESPACE);
        assert!(facade
            .ensure_default_namespace(Some(&configured))
            .await
            .unwrap()
            .is_none());
        let record = facade.get_namespace_record(DEFAULT_NAMESPACE).await.unwrap().unwrap();
        assert!(token::verify(&configured, &record.token_hash));
        assert!(!token::verify(&plaintext, &record.token_hash));
    }

    #[test]
    fn batch_clamping() {
        assert_eq!(clamp_batch(None).unwrap(), DEFAULT_BATCH_SIZE);
        assert_eq!(clamp_batch(Some(0)).unwrap(), DEFAULT_BATCH_SIZE);
        assert_eq!(clamp_batch(Some(-1)).unwrap(), MAX_BATCH_SIZE);
        assert_eq!(clamp_batch(Some(50)).unwrap(), 50);
        assert_eq!(clamp_batch(Some(1_000_000)).unwrap(), MAX_BATCH_SIZE);
        assert!(clamp_batch(Some(-2)).is_err());
    }
}
