use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use eventodb::{CategoryFilter, ExportedMessage};
use eventodb_store::StoreFacade;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{self, DbType, ServerConfig};
use crate::server;

/// EventoDB - multi-tenant event store
#[derive(Parser, Debug)]
#[command(name = "eventodb", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Log levels
    #[clap(
        long,
        env = "EVENTODB_LOG",
        default_value = "eventodb_server=info,eventodb_store=info,warn"
    )]
    log: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server
    Serve(ServeArgs),
    /// Export a namespace's messages as NDJSON
    Export(ExportArgs),
    /// Import NDJSON into an empty namespace
    Import(ImportArgs),
    /// Print the version
    Version,
}

#[derive(Args, Debug)]
struct BackendArgs {
    /// Storage backend
    #[clap(long, value_enum, default_value = "embedded", env = "EVENTODB_DB_TYPE")]
    db_type: DbType,
    /// Connection url for the relational backends
    #[clap(long, env = "EVENTODB_DB_URL")]
    db_url: Option<String>,
    /// Data directory for the embedded backend
    #[clap(long, default_value = "./data", env = "EVENTODB_DATA_DIR")]
    data_dir: PathBuf,
}

impl BackendArgs {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            db_type: self.db_type,
            db_url: self.db_url,
            data_dir: self.data_dir,
            ..ServerConfig::default()
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[clap(flatten)]
    backend: BackendArgs,
    /// Port to listen on
    #[clap(long, default_value = "8717", env = "EVENTODB_PORT")]
    port: u16,
    /// Bootstrap token for the default namespace
    #[clap(long, env = "EVENTODB_DEFAULT_TOKEN")]
    token: Option<String>,
    /// Auto-create a namespace for tokenless requests
    #[clap(long, env = "EVENTODB_TEST_MODE")]
    test_mode: bool,
    /// Open namespace handles kept before LRU eviction
    #[clap(long, default_value = "100")]
    handle_cache_size: u64,
    /// Messages per bulk-import batch
    #[clap(long, default_value = "1000")]
    import_batch_size: usize,
}

#[derive(Args, Debug)]
struct ExportArgs {
    #[clap(flatten)]
    backend: BackendArgs,
    /// Namespace to export
    #[clap(long)]
    namespace: String,
    /// Output file (stdout when omitted)
    #[clap(long)]
    out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ImportArgs {
    #[clap(flatten)]
    backend: BackendArgs,
    /// Target namespace (must be empty)
    #[clap(long)]
    namespace: String,
    /// NDJSON file to import
    file: PathBuf,
    /// Messages per batch
    #[clap(long, default_value = "1000")]
    batch_size: usize,
}

pub async fn start() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_env_filter(EnvFilter::builder().parse_lossy(cli.log))
        .init();

    match cli.command {
        Command::Serve(args) => {
            let config = ServerConfig {
                port: args.port,
                default_token: args.token,
                test_mode: args.test_mode,
                handle_cache_size: args.handle_cache_size,
                import_batch_size: args.import_batch_size,
                ..args.backend.into_config()
            };
            server::serve(config).await
        }
        Command::Export(args) => export(args).await,
        Command::Import(args) => import(args).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn open_facade(backend: BackendArgs) -> Result<Arc<StoreFacade>> {
    let config = backend.into_config();
    let store = config::build_store(&config).await?;
    let facade = Arc::new(StoreFacade::new(store, StoreFacade::DEFAULT_CACHE_SIZE));
    facade.migrate_on_startup().await.context("applying migrations")?;
    Ok(facade)
}

async fn export(args: ExportArgs) -> Result<()> {
    let facade = open_facade(args.backend).await?;
    let mut out: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(File::create(path).with_context(|| format!("creating {}", path.display()))?),
        None => Box::new(std::io::stdout()),
    };

    let mut position = 0i64;
    let mut exported = 0u64;
    loop {
        let messages = facade
            .get_category_messages(
                &args.namespace,
                "",
                Some(position),
                Some(1_000),
                CategoryFilter::default(),
            )
            .await?;
        if messages.is_empty() {
            break;
        }
        for message in messages {
            position = message.global_position + 1;
            let line = serde_json::to_string(&ExportedMessage::from(message))?;
            writeln!(out, "{line}")?;
            exported += 1;
        }
    }
    out.flush()?;

    info!(namespace = %args.namespace, exported, "export finished");
    Ok(())
}

async fn import(args: ImportArgs) -> Result<()> {
    let facade = open_facade(args.backend).await?;
    facade.assert_namespace_empty(&args.namespace).await?;

    let file = File::open(&args.file).with_context(|| format!("opening {}", args.file.display()))?;
    let reader = BufReader::new(file);
    let batch_size = args.batch_size.max(1);

    let mut batch: Vec<ExportedMessage> = Vec::with_capacity(batch_size);
    let mut imported = 0u64;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let message: ExportedMessage = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid import record", idx + 1))?;
        batch.push(message);

        if batch.len() >= batch_size {
            facade.import_batch(&args.namespace, &batch).await?;
            imported += batch.len() as u64;
            info!(imported, "batch committed");
            batch.clear();
        }
    }
    if !batch.is_empty() {
        facade.import_batch(&args.namespace, &batch).await?;
        imported += batch.len() as u64;
    }

    info!(namespace = %args.namespace, imported, "import finished");
    Ok(())
}
