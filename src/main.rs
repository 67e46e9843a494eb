use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fs_err as fs;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use peersync::{
    classifier::ChangeClassifier,
    config::{Config, ConfigPaths, KnownHost},
    log::TransactionLog,
    scanner::{ReconciliationScanner, ScanReport},
    session::{run_connection, SessionTiming, SyncService},
    status::{self, StatusState},
    transport::{accept_loop, connect},
    types::ContentHash,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpListener, sync::mpsc, task::spawn_blocking, time::sleep};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(name = "peersync")]
#[command(about = "Peer-to-peer directory synchronization", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan, watch the synced directories and sync with peers
    Run {
        /// Directory holding config.json, .syncignore and database.json
        #[arg(short, long)]
        config_dir: Option<PathBuf>,
    },
    /// Reconcile the transaction log with disk and exit
    Scan {
        /// Directory holding config.json, .syncignore and database.json
        #[arg(short, long)]
        config_dir: Option<PathBuf>,
    },
    /// Check consistency across directories
    Check {
        /// Directories to check (comma-separated)
        #[arg(short, long)]
        dirs: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config_dir } => run_node(config_paths(config_dir)?).await?,
        Commands::Scan { config_dir } => {
            let (_, classifier) = open_node(&config_paths(config_dir)?)?;
            spawn_blocking(move || ReconciliationScanner::new(&classifier).scan()).await??;
        }
        Commands::Check { dirs } => check_consistency(&dirs)?,
    }

    Ok(())
}

fn config_paths(dir: Option<PathBuf>) -> Result<ConfigPaths> {
    match dir {
        Some(dir) => Ok(ConfigPaths::new(dir)),
        None => ConfigPaths::default_location(),
    }
}

fn open_node(paths: &ConfigPaths) -> Result<(Config, ChangeClassifier)> {
    let config = paths.load_config()?;
    let filter = paths.load_filter()?;
    let mapping = config.mapping();

    for (namespace, dir) in mapping.namespaces() {
        fs::create_dir_all(dir)?;
        info!("Syncing namespace {namespace} -> {}", dir.display());
    }

    let log = TransactionLog::open(paths.database_file())?;
    let classifier = ChangeClassifier::new(log, Arc::new(mapping), Arc::new(filter));
    Ok((config, classifier))
}

async fn run_node(paths: ConfigPaths) -> Result<()> {
    let (config, classifier) = open_node(&paths)?;

    // Offline changes must be in the log before watching or syncing starts
    let scan_classifier = classifier.clone();
    let report: ScanReport =
        spawn_blocking(move || ReconciliationScanner::new(&scan_classifier).scan()).await??;
    info!("Startup scan recorded {} changes", report.changes());

    // Set up file watcher
    let (tx, mut rx) = mpsc::channel(100);
    let mut watcher: RecommendedWatcher =
        notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let _ = tx.blocking_send(event);
            }
            Err(e) => warn!("Watch error: {e}"),
        })?;
    for dir in classifier.mapping().directories() {
        watcher.watch(dir, RecursiveMode::Recursive)?;
    }

    // Local changes -> transaction log
    let watch_classifier = classifier.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let classifier = watch_classifier.clone();
            match spawn_blocking(move || classifier.handle_notify(event)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("Error handling file event: {e:#}"),
                Err(e) => error!("File event task panicked: {e}"),
            }
        }
    });

    if let Some(addr) = &config.status_addr {
        let addr: SocketAddr = addr.parse().context("Invalid status_addr")?;
        let state = Arc::new(StatusState {
            log: classifier.log().clone(),
            mapping: Arc::new(classifier.mapping().clone()),
        });
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, state).await {
                error!("Status server failed: {e:#}");
            }
        });
    }

    let service = SyncService::new(classifier);
    let timing = config.timing.session();

    info!("Connecting...");
    for host in config.known_hosts.clone() {
        let service = service.clone();
        let reconnect = config.timing.reconnect();
        tokio::spawn(supervise_peer(host, service, timing, reconnect));
    }

    let listen_addr = config.listen_addr();
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Failed to listen on {listen_addr}"))?;
    info!("Listening for peers on {listen_addr}");

    let users = Arc::new(config.users.clone());
    accept_loop(listener, users, move |conn| {
        let service = service.clone();
        async move {
            let peer = conn.peer().to_string();
            if let Err(e) = run_connection(conn, service, timing).await {
                warn!("Session with {peer} ended: {e:#}");
            }
        }
    })
    .await;

    // Keep watcher alive
    drop(watcher);
    Ok(())
}

/// Keep a session with one known host alive, reconnecting after failures.
async fn supervise_peer(
    host: KnownHost,
    service: SyncService,
    timing: SessionTiming,
    reconnect: Duration,
) {
    let addr = host.addr();
    loop {
        match connect(&addr, &host.user, &host.password).await {
            Ok(conn) => {
                info!("Connected to {addr}");
                if let Err(e) = run_connection(conn, service.clone(), timing).await {
                    warn!("Session with {addr} ended: {e:#}");
                }
            }
            Err(e) => warn!("Failed to connect to {addr}: {e:#}"),
        }
        sleep(reconnect).await;
    }
}

fn collect_files(dir: &Path) -> Result<BTreeMap<String, ContentHash>> {
    let mut files = BTreeMap::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)?
            .to_string_lossy()
            .replace('\\', "/");
        files.insert(relative, ContentHash::of_file(entry.path())?);
    }
    Ok(files)
}

fn check_consistency(dirs_str: &str) -> Result<()> {
    let dirs: Vec<PathBuf> = dirs_str.split(',').map(PathBuf::from).collect();

    if dirs.len() < 2 {
        println!("Need at least 2 directories to check consistency");
        return Ok(());
    }

    let file_sets = dirs
        .iter()
        .map(|dir| collect_files(dir))
        .collect::<Result<Vec<_>>>()?;

    let all_keys: BTreeSet<&String> = file_sets.iter().flat_map(|set| set.keys()).collect();

    let mut consistent = true;
    for key in all_keys {
        let values: Vec<Option<&ContentHash>> = file_sets.iter().map(|set| set.get(key)).collect();

        let first = values[0];
        if !values.iter().all(|v| v == &first) {
            consistent = false;
            println!("❌ Inconsistent file: {}", key);
            for (i, value) in values.iter().enumerate() {
                match value {
                    Some(hash) => println!("   dir[{}]: hash {}", i, hash),
                    None => println!("   dir[{}]: missing", i),
                }
            }
        } else {
            println!("✓ Consistent file: {}", key);
        }
    }

    if consistent {
        println!("\n✅ All files are consistent across directories");
    } else {
        println!("\n❌ Inconsistencies detected");
    }

    Ok(())
}
