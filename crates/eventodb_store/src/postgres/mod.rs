//! Relational backends: schema-per-tenant Postgres, flat or time-partitioned.
//!
//! One shared `eventodb_store` schema holds the namespace registry; each
//! namespace gets its own `eventodb_<id>` schema with a `messages` table.
//! Appends go through a `write_message` SQL function that takes a
//! transaction-level advisory lock and performs the expected-version check
//! server-side, so cross-process writers serialize in the database rather
//! than in this process. The partitioned flavor differs only in its
//! namespace migrations (a hypertable partitioned by `time`, serialized per
//! category); the driver code is shared.
//!
//! Identifiers cannot be bound as statement parameters, so every query is a
//! `{{SCHEMA_NAME}}` template rendered once per namespace handle; namespace
//! ids are validated DNS labels, which keeps the quoted identifier inert.

mod migrations;

use std::sync::Arc;

use async_trait::async_trait;
use bb8_postgres::bb8::Pool;
use bb8_postgres::tokio_postgres::error::SqlState;
use bb8_postgres::tokio_postgres::types::ToSql;
use bb8_postgres::tokio_postgres::{self, NoTls, Row};
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use eventodb::{Error, ExportedMessage, Message, Result};
use tracing::info;
use uuid::Uuid;

use crate::migrate::{self, SqlMigration};
use crate::registry::NamespaceRecord;
use crate::store::{
    CategoryInfo, CategoryReadOpts, ListStreamsOpts, NamespaceStore, Store, StreamInfo,
    StreamReadOpts, WriteMessage, WrittenPosition,
};

type PgPool = Pool<PostgresConnectionManager<NoTls>>;

const SCHEMA_PREFIX: &str = "eventodb_";

const REGISTRY_INSERT: &str = "\
INSERT INTO eventodb_store.namespaces (id, token_hash, schema_name, description, created_at, metadata)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (id) DO NOTHING";

const REGISTRY_SELECT: &str = "\
SELECT id, token_hash, schema_name, description, created_at, metadata
FROM eventodb_store.namespaces
WHERE id = $1";

const REGISTRY_LIST: &str = "\
SELECT id, token_hash, schema_name, description, created_at, metadata
FROM eventodb_store.namespaces
ORDER BY id";

const REGISTRY_DELETE: &str = "DELETE FROM eventodb_store.namespaces WHERE id = $1";

const REGISTRY_UPDATE_TOKEN: &str =
    "UPDATE eventodb_store.namespaces SET token_hash = $2 WHERE id = $1";

const MESSAGE_COLUMNS: &str =
    "id, stream_name, type, \"position\", global_position, data, metadata, time";

struct Queries {
    write_message: String,
    stream_page: String,
    category_page: String,
    last_message: String,
    stream_version: String,
    list_streams: String,
    list_categories: String,
    message_count: String,
    stream_count: String,
    last_activity: String,
    schema_version: String,
    import_check_gp: String,
    import_check_id: String,
    import_insert: String,
    import_setval: String,
}

impl Queries {
    fn render(schema: &str) -> Self {
        let r = |sql: &str| migrate::render(sql, schema);
        Queries {
            write_message: r("SELECT \"position\", global_position FROM {{SCHEMA_NAME}}.write_message($1, $2, $3, $4, $5, $6)"),
            stream_page: r(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM {{{{SCHEMA_NAME}}}}.get_stream_messages($1, $2, $3, $4)"
            )),
            category_page: r(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM {{{{SCHEMA_NAME}}}}.get_category_messages($1, $2, $3)"
            )),
            last_message: r(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM {{{{SCHEMA_NAME}}}}.get_last_stream_message($1, $2)"
            )),
            stream_version: r("SELECT {{SCHEMA_NAME}}.stream_version($1)"),
            list_streams: r(
                "SELECT stream_name, max(\"position\") AS version, max(time) AS last_activity \
                 FROM {{SCHEMA_NAME}}.messages \
                 WHERE ($1 = '' OR starts_with(stream_name, $1)) AND ($2 = '' OR stream_name > $2) \
                 GROUP BY stream_name ORDER BY stream_name LIMIT $3",
            ),
            list_categories: r(
                "SELECT {{SCHEMA_NAME}}.category(stream_name) AS category, \
                 count(DISTINCT stream_name)::bigint AS stream_count, \
                 count(*)::bigint AS message_count \
                 FROM {{SCHEMA_NAME}}.messages GROUP BY 1 ORDER BY 1",
            ),
            message_count: r("SELECT count(*)::bigint FROM {{SCHEMA_NAME}}.messages"),
            stream_count: r("SELECT count(DISTINCT stream_name)::bigint FROM {{SCHEMA_NAME}}.messages"),
            last_activity: r("SELECT max(time) FROM {{SCHEMA_NAME}}.messages"),
            schema_version: r("SELECT coalesce(max(version), 0) FROM {{SCHEMA_NAME}}._schema_version"),
            import_check_gp: r(
                "SELECT global_position FROM {{SCHEMA_NAME}}.messages \
                 WHERE global_position = ANY($1) LIMIT 1",
            ),
            import_check_id: r("SELECT id FROM {{SCHEMA_NAME}}.messages WHERE id = ANY($1) LIMIT 1"),
            import_insert: r(&format!(
                "INSERT INTO {{{{SCHEMA_NAME}}}}.messages ({MESSAGE_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            )),
            import_setval: r(
                "SELECT setval('{{SCHEMA_NAME}}.messages_global_position_seq', \
                 GREATEST($1::bigint, (SELECT last_value FROM {{SCHEMA_NAME}}.messages_global_position_seq)), true)",
            ),
        }
    }
}

/// Which relational layout a [`PgStore`] manages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgFlavor {
    Relational,
    Partitioned,
}

impl PgFlavor {
    fn namespace_migrations(self) -> &'static [SqlMigration] {
        match self {
            PgFlavor::Relational => migrations::RELATIONAL_NAMESPACE_MIGRATIONS,
            PgFlavor::Partitioned => migrations::PARTITIONED_NAMESPACE_MIGRATIONS,
        }
    }
}

pub struct PgStore {
    pool: PgPool,
    flavor: PgFlavor,
}

impl PgStore {
    pub async fn connect(url: &str, flavor: PgFlavor) -> Result<Self> {
        let manager =
            PostgresConnectionManager::new_from_stringlike(url, NoTls).map_err(Error::backend)?;
        let pool = Pool::builder().build(manager).await.map_err(Error::backend)?;
        Ok(PgStore { pool, flavor })
    }

    fn quoted_schema(&self, namespace: &str) -> String {
        format!("\"{SCHEMA_PREFIX}{namespace}\"")
    }

    async fn applied_version(&self, version_query: &str) -> Result<u32> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        match conn.query_one(version_query, &[]).await {
            Ok(row) => Ok(row.get::<_, i32>(0) as u32),
            Err(err) if is_missing_relation(&err) => Ok(0),
            Err(err) => Err(classify(err)),
        }
    }

    async fn apply_migrations(
        &self,
        set: &[SqlMigration],
        schema: Option<&str>,
        version_table: &str,
    ) -> Result<()> {
        let version_query = format!("SELECT coalesce(max(version), 0) FROM {version_table}");
        let applied = self.applied_version(&version_query).await?;

        for migration in migrate::pending_sql(set, applied) {
            let sql = match schema {
                Some(schema) => migrate::render(migration.sql, schema),
                None => migration.sql.to_owned(),
            };

            let mut conn = self.pool.get().await.map_err(Error::backend)?;
            let tx = conn.transaction().await.map_err(classify)?;
            tx.batch_execute(&sql).await.map_err(classify)?;
            tx.execute(
                &format!("INSERT INTO {version_table} (version) VALUES ($1)"),
                &[&(migration.version as i32)],
            )
            .await
            .map_err(classify)?;
            tx.commit().await.map_err(classify)?;
            info!(version = migration.version, name = migration.name, "applied migration");
        }
        Ok(())
    }

    async fn migrate_namespace(&self, namespace: &str) -> Result<()> {
        let schema = self.quoted_schema(namespace);
        self.apply_migrations(
            self.flavor.namespace_migrations(),
            Some(&schema),
            &format!("{schema}._schema_version"),
        )
        .await
    }
}

#[async_trait]
impl Store for PgStore {
    fn backend_kind(&self) -> &'static str {
        match self.flavor {
            PgFlavor::Relational => "relational",
            PgFlavor::Partitioned => "partitioned",
        }
    }

    fn data_location(&self, namespace: &str) -> String {
        format!("{SCHEMA_PREFIX}{namespace}")
    }

    async fn migrate_metadata(&self) -> Result<()> {
        self.apply_migrations(
            migrations::METADATA_MIGRATIONS,
            None,
            "eventodb_store._schema_version",
        )
        .await
    }

    async fn create_namespace(&self, record: &NamespaceRecord) -> Result<()> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let inserted = conn
            .execute(
                REGISTRY_INSERT,
                &[
                    &record.id,
                    &record.token_hash,
                    &record.data_location,
                    &record.description,
                    &record.created_at,
                    &record.metadata,
                ],
            )
            .await
            .map_err(classify)?;
        if inserted == 0 {
            return Err(Error::NamespaceExists {
                namespace: record.id.clone(),
            });
        }
        drop(conn);

        if let Err(err) = self.migrate_namespace(&record.id).await {
            // Do not leave a registry row pointing at a half-created schema.
            if let Ok(conn) = self.pool.get().await {
                let _ = conn.execute(REGISTRY_DELETE, &[&record.id]).await;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn get_namespace(&self, namespace: &str) -> Result<Option<NamespaceRecord>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let row = conn
            .query_opt(REGISTRY_SELECT, &[&namespace])
            .await
            .map_err(classify)?;
        Ok(row.map(row_to_record))
    }

    async fn list_namespaces(&self) -> Result<Vec<NamespaceRecord>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let rows = conn.query(REGISTRY_LIST, &[]).await.map_err(classify)?;
        Ok(rows.into_iter().map(row_to_record).collect())
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<u64> {
        if self.get_namespace(namespace).await?.is_none() {
            return Err(Error::NamespaceNotFound {
                namespace: namespace.to_owned(),
            });
        }

        let schema = self.quoted_schema(namespace);
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let deleted = match conn
            .query_one(&format!("SELECT count(*)::bigint FROM {schema}.messages"), &[])
            .await
        {
            Ok(row) => row.get::<_, i64>(0) as u64,
            Err(err) if is_missing_relation(&err) => 0,
            Err(err) => return Err(classify(err)),
        };

        conn.batch_execute(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
            .await
            .map_err(classify)?;
        conn.execute(REGISTRY_DELETE, &[&namespace])
            .await
            .map_err(classify)?;

        info!(namespace, messages = deleted, "namespace deleted");
        Ok(deleted)
    }

    async fn update_token_hash(&self, namespace: &str, token_hash: &str) -> Result<()> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let updated = conn
            .execute(REGISTRY_UPDATE_TOKEN, &[&namespace, &token_hash])
            .await
            .map_err(classify)?;
        if updated == 0 {
            return Err(Error::NamespaceNotFound {
                namespace: namespace.to_owned(),
            });
        }
        Ok(())
    }

    async fn open(&self, namespace: &str) -> Result<Arc<dyn NamespaceStore>> {
        self.migrate_namespace(namespace).await?;
        Ok(Arc::new(PgNamespace {
            pool: self.pool.clone(),
            queries: Queries::render(&self.quoted_schema(namespace)),
        }))
    }

    fn connection_count(&self) -> u32 {
        self.pool.state().connections
    }
}

/// One namespace's handle: the shared pool plus queries rendered for its
/// schema.
pub struct PgNamespace {
    pool: PgPool,
    queries: Queries,
}

#[async_trait]
impl NamespaceStore for PgNamespace {
    async fn write_message(&self, msg: WriteMessage) -> Result<WrittenPosition> {
        let id = msg.id.unwrap_or_else(Uuid::new_v4).to_string();
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let row = conn
            .query_one(
                &self.queries.write_message,
                &[
                    &id,
                    &msg.stream_name.as_str(),
                    &msg.msg_type,
                    &msg.data,
                    &msg.metadata,
                    &msg.expected_version,
                ],
            )
            .await
            .map_err(|err| classify_with_id(err, &id))?;

        Ok(WrittenPosition {
            position: row.get(0),
            global_position: row.get(1),
        })
    }

    async fn get_stream_messages(
        &self,
        stream: &str,
        opts: &StreamReadOpts,
    ) -> Result<Vec<Message>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let rows = conn
            .query(
                &self.queries.stream_page,
                &[
                    &stream,
                    &opts.position,
                    &(opts.batch_size as i64),
                    &opts.min_global_position,
                ],
            )
            .await
            .map_err(classify)?;
        rows.iter().map(row_to_message).collect()
    }

    async fn get_category_messages(
        &self,
        category: &str,
        opts: &CategoryReadOpts,
    ) -> Result<Vec<Message>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let page_size = opts.batch_size.max(64) as i64;
        let mut cursor = opts.position;
        let mut messages = Vec::new();

        // Filters run here, not in SQL, so scan pages until the batch fills.
        loop {
            let rows = conn
                .query(&self.queries.category_page, &[&category, &cursor, &page_size])
                .await
                .map_err(classify)?;
            let fetched = rows.len();

            for row in &rows {
                let message = row_to_message(row)?;
                cursor = message.global_position + 1;
                if opts.filter.matches(&message.stream_name, message.metadata.as_ref()) {
                    messages.push(message);
                    if messages.len() >= opts.batch_size {
                        return Ok(messages);
                    }
                }
            }

            if fetched < page_size as usize {
                return Ok(messages);
            }
        }
    }

    async fn get_last_stream_message(
        &self,
        stream: &str,
        msg_type: Option<&str>,
    ) -> Result<Option<Message>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let row = conn
            .query_opt(&self.queries.last_message, &[&stream, &msg_type])
            .await
            .map_err(classify)?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn stream_version(&self, stream: &str) -> Result<Option<i64>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let row = conn
            .query_one(&self.queries.stream_version, &[&stream])
            .await
            .map_err(classify)?;
        Ok(row.get(0))
    }

    async fn list_streams(&self, opts: &ListStreamsOpts) -> Result<Vec<StreamInfo>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let prefix = opts.prefix.clone().unwrap_or_default();
        let cursor = opts.cursor.clone().unwrap_or_default();
        let rows = conn
            .query(
                &self.queries.list_streams,
                &[&prefix, &cursor, &(opts.limit as i64)],
            )
            .await
            .map_err(classify)?;

        Ok(rows
            .iter()
            .map(|row| StreamInfo {
                stream: row.get(0),
                version: row.get(1),
                last_activity: row.get(2),
            })
            .collect())
    }

    async fn list_categories(&self) -> Result<Vec<CategoryInfo>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let rows = conn
            .query(&self.queries.list_categories, &[])
            .await
            .map_err(classify)?;
        Ok(rows
            .iter()
            .map(|row| CategoryInfo {
                category: row.get(0),
                stream_count: row.get(1),
                message_count: row.get(2),
            })
            .collect())
    }

    async fn import_batch(&self, messages: &[ExportedMessage]) -> Result<()> {
        let mut gps = Vec::with_capacity(messages.len());
        let mut ids = Vec::with_capacity(messages.len());
        for msg in messages {
            if msg.pos < 0 || msg.gpos < 1 {
                return Err(Error::invalid_request(format!(
                    "message {} has invalid positions (pos {}, gpos {})",
                    msg.id, msg.pos, msg.gpos
                )));
            }
            if gps.contains(&msg.gpos) {
                return Err(Error::PositionExists {
                    global_position: msg.gpos,
                    line: None,
                });
            }
            gps.push(msg.gpos);
            ids.push(msg.id.to_string());
        }

        let mut conn = self.pool.get().await.map_err(Error::backend)?;
        let tx = conn.transaction().await.map_err(classify)?;

        if let Some(row) = tx
            .query_opt(&self.queries.import_check_gp, &[&gps])
            .await
            .map_err(classify)?
        {
            return Err(Error::PositionExists {
                global_position: row.get(0),
                line: None,
            });
        }
        if let Some(row) = tx
            .query_opt(&self.queries.import_check_id, &[&ids])
            .await
            .map_err(classify)?
        {
            return Err(Error::DuplicateId { id: row.get(0) });
        }

        let mut max_gp = 0i64;
        for msg in messages {
            tx.execute(
                &self.queries.import_insert,
                &[
                    &msg.id.to_string(),
                    &msg.stream,
                    &msg.msg_type,
                    &msg.pos,
                    &msg.gpos,
                    &msg.data,
                    &msg.meta,
                    &msg.time,
                ],
            )
            .await
            .map_err(classify)?;
            max_gp = max_gp.max(msg.gpos);
        }

        tx.query_one(&self.queries.import_setval, &[&max_gp])
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn message_count(&self) -> Result<i64> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let row = conn
            .query_one(&self.queries.message_count, &[])
            .await
            .map_err(classify)?;
        Ok(row.get(0))
    }

    async fn stream_count(&self) -> Result<i64> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let row = conn
            .query_one(&self.queries.stream_count, &[])
            .await
            .map_err(classify)?;
        Ok(row.get(0))
    }

    async fn last_activity(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        let row = conn
            .query_one(&self.queries.last_activity, &[])
            .await
            .map_err(classify)?;
        Ok(row.get(0))
    }

    async fn schema_version(&self) -> Result<u32> {
        let conn = self.pool.get().await.map_err(Error::backend)?;
        match conn.query_one(&self.queries.schema_version, &[]).await {
            Ok(row) => Ok(row.get::<_, i32>(0) as u32),
            Err(err) if is_missing_relation(&err) => Ok(0),
            Err(err) => Err(classify(err)),
        }
    }
}

fn row_to_record(row: Row) -> NamespaceRecord {
    NamespaceRecord {
        id: row.get(0),
        token_hash: row.get(1),
        data_location: row.get(2),
        description: row.get(3),
        created_at: row.get(4),
        metadata: row.get(5),
    }
}

fn row_to_message(row: &Row) -> Result<Message> {
    let id: String = row.get(0);
    Ok(Message {
        id: Uuid::parse_str(&id).map_err(Error::backend)?,
        stream_name: row.get(1),
        msg_type: row.get(2),
        position: row.get(3),
        global_position: row.get(4),
        data: row.get(5),
        metadata: row.get(6),
        time: row.get(7),
    })
}

fn is_missing_relation(err: &tokio_postgres::Error) -> bool {
    matches!(
        err.code(),
        Some(&SqlState::UNDEFINED_TABLE) | Some(&SqlState::INVALID_SCHEMA_NAME)
    )
}

/// Maps database failures into the shared taxonomy. Version conflicts and
/// duplicate ids are raised by `write_message` with parseable markers;
/// everything else keeps its message under `BACKEND_ERROR`.
fn classify(err: tokio_postgres::Error) -> Error {
    if let Some(db) = err.as_db_error() {
        let message = db.message();

        if let Some(rest) = message.strip_prefix("EVENTODB_VERSION_CONFLICT|") {
            let mut parts = rest.splitn(3, '|');
            if let (Some(expected), Some(actual), Some(stream)) =
                (parts.next(), parts.next(), parts.next())
            {
                return Error::StreamVersionConflict {
                    stream: stream.to_owned(),
                    expected: expected.parse().unwrap_or_default(),
                    actual: (actual != "null").then(|| actual.parse().unwrap_or_default()),
                };
            }
        }
        if let Some(id) = message.strip_prefix("EVENTODB_DUPLICATE_ID|") {
            return Error::DuplicateId { id: id.to_owned() };
        }
        if db.code() == &SqlState::UNIQUE_VIOLATION {
            match db.constraint() {
                Some("messages_id") => {
                    return Error::DuplicateId { id: String::new() };
                }
                Some("messages_pkey") => {
                    return Error::PositionExists {
                        global_position: 0,
                        line: None,
                    };
                }
                _ => {}
            }
        }
    }
    Error::backend(err)
}

fn classify_with_id(err: tokio_postgres::Error, id: &str) -> Error {
    match classify(err) {
        Error::DuplicateId { id: detail } if detail.is_empty() => Error::DuplicateId {
            id: id.to_owned(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_queries_contain_no_template_tokens() {
        let queries = Queries::render("\"eventodb_t1\"");
        for sql in [
            &queries.write_message,
            &queries.stream_page,
            &queries.category_page,
            &queries.last_message,
            &queries.stream_version,
            &queries.list_streams,
            &queries.list_categories,
            &queries.message_count,
            &queries.stream_count,
            &queries.last_activity,
            &queries.schema_version,
            &queries.import_check_gp,
            &queries.import_check_id,
            &queries.import_insert,
            &queries.import_setval,
        ] {
            assert!(!sql.contains("{{"), "unrendered template in {sql}");
            assert!(sql.contains("eventodb_t1"));
        }
    }

    #[test]
    fn migration_sets_are_templated_and_ordered() {
        for set in [
            migrations::RELATIONAL_NAMESPACE_MIGRATIONS,
            migrations::PARTITIONED_NAMESPACE_MIGRATIONS,
        ] {
            let versions: Vec<_> = set.iter().map(|m| m.version).collect();
            let mut sorted = versions.clone();
            sorted.sort();
            assert_eq!(versions, sorted);
            for migration in set {
                assert!(migration.sql.contains(crate::migrate::SCHEMA_TOKEN));
            }
        }
        for migration in migrations::METADATA_MIGRATIONS {
            assert!(!migration.sql.contains(crate::migrate::SCHEMA_TOKEN));
        }
    }

    // Exercised against a live database:
    //   EVENTODB_TEST_PG_URL=postgres://… cargo test -p eventodb_store -- --ignored
    #[tokio::test]
    #[ignore]
    async fn relational_round_trip() {
        let url = std::env::var("EVENTODB_TEST_PG_URL").expect("EVENTODB_TEST_PG_URL");
        let store = PgStore::connect(&url, PgFlavor::Relational).await.unwrap();
        store.migrate_metadata().await.unwrap();

        let id = format!("pgtest-{}", std::process::id());
        let record = NamespaceRecord {
            id: id.clone(),
            token_hash: crate::token::hash(&crate::token::generate(&id)),
            data_location: store.data_location(&id),
            description: String::new(),
            created_at: Utc::now(),
            metadata: None,
        };
        store.create_namespace(&record).await.unwrap();
        let ns = store.open(&id).await.unwrap();

        let written = ns
            .write_message(WriteMessage {
                stream_name: eventodb::StreamName::new("account-1").unwrap(),
                msg_type: "Opened".to_owned(),
                data: serde_json::json!({"balance": 0}),
                metadata: None,
                id: None,
                expected_version: None,
            })
            .await
            .unwrap();
        assert_eq!(written.position, 0);
        assert_eq!(written.global_position, 1);

        let messages = ns
            .get_stream_messages(
                "account-1",
                &StreamReadOpts {
                    position: 0,
                    batch_size: 10,
                    min_global_position: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(ns.stream_version("account-1").await.unwrap(), Some(0));

        let conflict = ns
            .write_message(WriteMessage {
                stream_name: eventodb::StreamName::new("account-1").unwrap(),
                msg_type: "Opened".to_owned(),
                data: serde_json::json!({}),
                metadata: None,
                id: None,
                expected_version: Some(-1),
            })
            .await
            .unwrap_err();
        assert_eq!(conflict.code(), "STREAM_VERSION_CONFLICT");

        store.delete_namespace(&id).await.unwrap();
    }
}
