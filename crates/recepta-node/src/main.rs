//! recepta-node — the receptor process.
//!
//! Startup sequence:
//!   1. Parse flags and the JSON config (exit 1 on any configuration error)
//!   2. Open the state store (exit 2 when unreachable)
//!   3. Wire directory → tokens → transmitter client → consent engine,
//!      queue, scheduler and worker pool per `--role`
//!   4. Spawn the background loops (sweeps, lease recovery, retention)
//!   5. On SIGINT: stop producers, drain leased jobs, flush, exit 130

mod config;

use chrono::Duration;
use clap::{Parser, ValueEnum};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use recepta_cache::MemoryCache;
use recepta_client::{RateLimiter, TransmitterClient, TransmitterClientConfig};
use recepta_consent::ConsentEngine;
use recepta_core::clock::{Clock, SystemClock};
use recepta_core::constants::{EXPIRY_SWEEP_SECS, SYNC_SWEEP_SECS};
use recepta_core::types::{ClientId, OrganisationId};
use recepta_directory::{DirectoryResolver, HttpDirectoryResolver, StaticDirectoryResolver};
use recepta_events::{DurablePublisher, EventPublisher, MemoryBus};
use recepta_queue::{JobQueue, QueueConfig};
use recepta_scheduler::{RunTracker, Scheduler, SchedulerConfig};
use recepta_store::Store;
use recepta_token::TokenProvider;
use recepta_worker::{WorkerConfig, WorkerPool};

use config::NodeConfig;

const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_SIGINT: i32 = 130;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    Scheduler,
    Worker,
    Both,
}

#[derive(Parser, Debug)]
#[command(
    name = "recepta-node",
    version,
    about = "Open Finance data-collection receptor node"
)]
struct Args {
    /// Which halves of the pipeline this process runs.
    #[arg(long, value_enum, default_value = "both")]
    role: Role,

    /// Stable identity of this node (lease ownership).
    #[arg(long, default_value = "node-0")]
    node_id: String,

    /// Directory for the persistent state store.
    #[arg(long, default_value = "~/.recepta/data")]
    data_dir: PathBuf,

    /// Path to the JSON configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Consents per scheduler feeder page.
    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    /// Lease duration granted to workers, in seconds.
    #[arg(long, default_value_t = 120)]
    visibility_timeout: u64,

    /// Worker tasks (global in-flight cap).
    #[arg(long, default_value_t = 32)]
    concurrency: usize,

    /// Queue depth above which the scheduler pauses feeding.
    #[arg(long, default_value_t = 100_000)]
    max_depth: usize,

    /// Seconds granted to drain leased jobs on shutdown.
    #[arg(long, default_value_t = 30)]
    shutdown_grace: u64,
}

fn main() {
    // clap's own usage errors exit 2; remap every parse failure to the
    // documented configuration exit code.
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,recepta=debug".parse().unwrap()),
        )
        .init();

    let config = match NodeConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let code = runtime.block_on(run(args, config));
    std::process::exit(code);
}

async fn run(args: Args, config: NodeConfig) -> i32 {
    info!(role = ?args.role, node_id = %args.node_id, "recepta node starting");
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── State store ───────────────────────────────────────────────────────────
    let data_dir = expand_tilde(&args.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!(error = %e, dir = %data_dir.display(), "cannot create data dir");
        return EXIT_STORE;
    }
    let store = match Store::open(&data_dir) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "state store unreachable");
            return EXIT_STORE;
        }
    };

    // ── HTTP engine (mTLS identity when configured) ───────────────────────────
    let http = match build_http(&config) {
        Ok(http) => http,
        Err(e) => {
            error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };

    // ── Shared plumbing ───────────────────────────────────────────────────────
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let bus = Arc::new(MemoryBus::default());
    let publisher: Arc<dyn EventPublisher> = Arc::new(DurablePublisher::new(
        bus.clone(),
        store.clone(),
        clock.clone(),
    ));

    let directory: Arc<dyn DirectoryResolver> = match &config.roster_url {
        Some(url) => Arc::new(HttpDirectoryResolver::new(
            http.clone(),
            url.clone(),
            clock.clone(),
        )),
        None => Arc::new(StaticDirectoryResolver::new(config.directory.clone())),
    };

    let credentials = config
        .credentials
        .iter()
        .map(|(client, creds)| (ClientId::new(client.clone()), creds.clone()))
        .collect();
    let tokens = Arc::new(TokenProvider::new(
        http.clone(),
        directory.clone(),
        cache.clone(),
        clock.clone(),
        credentials,
    ));

    let rate_overrides: HashMap<OrganisationId, f64> = config
        .rate_limits
        .iter()
        .map(|(org, qps)| (OrganisationId::new(org.clone()), *qps))
        .collect();
    let mut client_config = TransmitterClientConfig::default();
    if let Some(ip) = &config.customer_ip {
        client_config.customer_ip = ip.clone();
    }
    let client = Arc::new(TransmitterClient::new(
        http,
        directory,
        tokens,
        RateLimiter::new(config.default_qps, rate_overrides),
        clock.clone(),
        client_config,
    ));

    let engine = Arc::new(ConsentEngine::new(
        store.clone(),
        cache.clone(),
        publisher.clone(),
        client.clone(),
        clock.clone(),
    ));
    let queue = Arc::new(JobQueue::new(
        store.clone(),
        clock.clone(),
        QueueConfig::default(),
    ));
    if let Err(e) = queue.rebuild_index() {
        error!(error = %e, "state store unreachable");
        return EXIT_STORE;
    }

    // ── Background tasks per role ─────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    if matches!(args.role, Role::Scheduler | Role::Both) {
        let tracker = Arc::new(RunTracker::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
        ));
        let mut scheduler_config = SchedulerConfig {
            batch_size: args.batch_size,
            max_depth: args.max_depth,
            ..SchedulerConfig::default()
        };
        if let Some(secs) = config.window_secs {
            scheduler_config.window_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = config.incremental_secs {
            scheduler_config.incremental_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(secs) = config.cooldown_secs {
            scheduler_config.cooldown = Duration::seconds(secs);
        }
        let scheduler = Arc::new(Scheduler::new(
            engine.clone(),
            queue.clone(),
            store.clone(),
            publisher.clone(),
            tracker.clone(),
            clock.clone(),
            scheduler_config,
        ));

        // The tracker's receiver exists before any job can terminate.
        tasks.spawn(tracker.run(bus.subscribe(), shutdown_rx.clone()));
        tasks.spawn(scheduler.run(shutdown_rx.clone()));
        tasks.spawn(engine.clone().run_expiry_loop(
            std::time::Duration::from_secs(EXPIRY_SWEEP_SECS as u64),
            shutdown_rx.clone(),
        ));
        tasks.spawn(engine.clone().run_sync_loop(
            std::time::Duration::from_secs(SYNC_SWEEP_SECS as u64),
            shutdown_rx.clone(),
        ));
    }

    if matches!(args.role, Role::Worker | Role::Both) {
        let pool = WorkerPool::new(
            queue.clone(),
            store.clone(),
            engine.clone(),
            client.clone(),
            publisher.clone(),
            clock.clone(),
            WorkerConfig {
                node_id: args.node_id.clone(),
                concurrency: args.concurrency,
                visibility: Duration::seconds(args.visibility_timeout as i64),
                ..WorkerConfig::default()
            },
        );
        tasks.spawn(pool.run(shutdown_rx.clone()));
        tasks.spawn(
            queue
                .clone()
                .run_recovery_loop(std::time::Duration::from_secs(15), shutdown_rx.clone()),
        );
    }

    // Retention + cache hygiene runs on every role.
    tasks.spawn(retention_loop(
        store.clone(),
        cache.clone(),
        clock.clone(),
        shutdown_rx,
    ));

    info!("recepta node ready");

    // ── Graceful shutdown ─────────────────────────────────────────────────────
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("SIGINT received, draining"),
        Err(e) => warn!(error = %e, "signal handler failed, draining"),
    }
    let _ = shutdown_tx.send(true);

    let grace = std::time::Duration::from_secs(args.shutdown_grace);
    let drained = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    match drained {
        Ok(()) => info!("drained cleanly"),
        Err(_) => warn!(grace_secs = args.shutdown_grace, "drain timed out, abandoning leases"),
    }

    if let Err(e) = store.flush() {
        warn!(error = %e, "final store flush failed");
    }
    EXIT_SIGINT
}

/// Periodic physical TTL sweep over the store plus cache purge.
async fn retention_loop(
    store: Arc<Store>,
    cache: Arc<MemoryCache>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(600));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.sweep_expired(clock.now()) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "retention sweep removed rows"),
                    Err(e) => warn!(error = %e, "retention sweep failed"),
                }
                let purged = cache.purge_expired().await;
                if purged > 0 {
                    info!(purged, "cache purge dropped entries");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

fn build_http(config: &NodeConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(pem_path) = &config.mtls_identity_pem {
        let pem = std::fs::read(pem_path)
            .map_err(|e| anyhow::anyhow!("reading mTLS identity {pem_path}: {e}"))?;
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| anyhow::anyhow!("parsing mTLS identity {pem_path}: {e}"))?;
        builder = builder.identity(identity);
    }
    builder
        .build()
        .map_err(|e| anyhow::anyhow!("building HTTP client: {e}"))
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &std::path::Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
