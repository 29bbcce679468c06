use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::{select, signal};
use tracing::{error, info, warn};

use oplog::compactor::Compactor;
use oplog::config::{init_config, CONFIG, DEFAULT_CONFIG_FILE};
use oplog::error::abort_on_fatal;
use oplog::interpreter::SledInterpreter;
use oplog::store::LogStore;
use oplog::Oplog;

fn create_lock_file(path: impl AsRef<Path>) -> Result<()> {
    let lock_path = path.as_ref().join("LOCK");
    info!("create lock file: {:?}", lock_path);

    std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(lock_path)?;

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value_t = DEFAULT_CONFIG_FILE.to_string())]
    config: String,
    /// Create the oplog collections when they do not exist yet.
    #[arg(long, default_value_t = false)]
    create: bool,
    #[arg(long)]
    name: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    init_config(&args.config)
        .inspect_err(|e| error!("failed to initialize configuration, err: {e}"))?;
    if let Some(name) = args.name {
        info!("overriding name from command line argument: {}", name);
        CONFIG.write().name = Some(name);
    }

    let conf = CONFIG.read().clone();
    info!("starting {}...", conf.name());

    let data_dir = conf.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    create_lock_file(&data_dir).inspect_err(|e| error!("failed to create lock file, err: {e}"))?;

    let store = Arc::new(LogStore::load(data_dir.join("db"))?);
    if !store.exists() {
        if args.create {
            store.create()?;
        } else {
            warn!("oplog collections missing, start with --create to initialize them");
        }
    }
    abort_on_fatal(store.open())?;

    let oplog = Oplog::new(store.clone(), SledInterpreter)
        .with_limits(conf.overflow_chunk_size(), conf.max_inline_ops_size());
    match abort_on_fatal(oplog.load_watermarks())? {
        Some(marks) => info!(
            "loaded watermarks, minLive: {}, minUnapplied: {}",
            marks.min_live, marks.min_unapplied
        ),
        None => info!("no watermarks recorded"),
    }
    if let Some(last) = abort_on_fatal(oplog.last_gtid())? {
        info!("last GTID in oplog: {last}");
    }

    let compactor = Compactor::builder()
        .store(store.clone())
        .expire_days(conf.expire_oplog_days())
        .expire_hours(conf.expire_oplog_hours())
        .interval(conf.compaction_interval())
        .timeout(conf.compaction_timeout())
        .build();
    compactor.start();

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    select! {
        _ = signal::ctrl_c() => {
            info!("ctrl-c pressed");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM received");
        },
    };

    compactor.stop().await;
    info!("oplog stats: {}", serde_json::to_string(&store.stats().snapshot())?);
    store.close();
    store.flush()?;

    std::fs::remove_file(data_dir.join("LOCK"))
        .inspect_err(|e| error!("failed to remove lock file, err {e}"))?;

    Ok(())
}
