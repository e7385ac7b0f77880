use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use eventodb_store::{PgFlavor, PgStore, SledStore, Store};

/// Storage backend selection, `--db-type` / `EVENTODB_DB_TYPE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum DbType {
    /// Embedded sled databases under the data directory.
    Embedded,
    /// Postgres, one schema per namespace.
    Relational,
    /// Postgres with a time-partitioned messages hypertable.
    Partitioned,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub db_type: DbType,
    pub db_url: Option<String>,
    pub data_dir: PathBuf,
    pub port: u16,
    pub default_token: Option<String>,
    pub test_mode: bool,
    pub handle_cache_size: u64,
    pub import_batch_size: usize,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            db_type: DbType::Embedded,
            db_url: None,
            data_dir: PathBuf::from("./data"),
            port: 8717,
            default_token: None,
            test_mode: false,
            handle_cache_size: eventodb_store::StoreFacade::DEFAULT_CACHE_SIZE,
            import_batch_size: 1_000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub async fn build_store(config: &ServerConfig) -> Result<Arc<dyn Store>> {
    match config.db_type {
        DbType::Embedded => {
            let store = SledStore::open(&config.data_dir)
                .with_context(|| format!("opening data dir {}", config.data_dir.display()))?;
            Ok(Arc::new(store))
        }
        DbType::Relational | DbType::Partitioned => {
            let Some(url) = &config.db_url else {
                bail!("--db-url is required for the {:?} backend", config.db_type);
            };
            let flavor = match config.db_type {
                DbType::Partitioned => PgFlavor::Partitioned,
                _ => PgFlavor::Relational,
            };
            let store = PgStore::connect(url, flavor)
                .await
                .context("connecting to the database")?;
            Ok(Arc::new(store))
        }
    }
}
