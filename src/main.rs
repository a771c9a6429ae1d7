//! WaveVault - bit-perfect audio ingestion service

use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use wavevault::api::{self, AppState};
use wavevault::breaker::BreakerManager;
use wavevault::config::Config;
use wavevault::events::{ChannelBroadcaster, ProgressSink};
use wavevault::hashing::StreamingHasher;
use wavevault::metrics::Metrics;
use wavevault::monitor::{MemoryProbe, PressureLatch, SysinfoProbe};
use wavevault::notify::LogNotifier;
use wavevault::pipeline::{IngestPipeline, PipelineConfig};
use wavevault::ratelimit::{spawn_adaptive_controller, RateLimiter};
use wavevault::session::SessionStore;
use wavevault::storage::{ObjectStore, S3Store};
use wavevault::types::meta_keys;
use wavevault::workers::WorkerPool;

/// Exit codes for maintenance subcommands.
const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_PARTIAL: i32 = 2;

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("WV_BUILD_TIME"),
        )
    })
}

/// WaveVault — bit-perfect audio ingestion into S3-compatible storage
#[derive(Parser, Debug)]
#[command(name = "wavevault")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingestion server (default)
    Serve,

    /// Delete every object in the configured bucket
    BucketClear {
        /// Required; clearing a bucket is not reversible
        #[arg(long)]
        force: bool,
    },

    /// Re-apply bucket policy/CORS and backfill canonical metadata on
    /// objects that predate it
    PolicyMigrate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Priority: RUST_LOG > WAVEVAULT_LOG_LEVEL > --verbose > config default
    let config = load_config(&cli);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("WAVEVAULT_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("wavevault=trace,tower_http=trace")
            } else {
                EnvFilter::new(config.log_level.clone())
            }
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let command = cli.command.unwrap_or(Command::Serve);
    let code = match command {
        Command::Serve => match serve(config).await {
            Ok(()) => EXIT_OK,
            Err(e) => {
                error!("Server failed: {e}");
                EXIT_FAILURE
            }
        },
        Command::BucketClear { force } => bucket_clear(config, force).await,
        Command::PolicyMigrate => policy_migrate(config).await,
    };

    std::process::exit(code);
}

fn load_config(cli: &Cli) -> Config {
    let mut config = if let Some(ref path) = cli.config {
        match Config::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("Cannot load {path}: {e}");
                std::process::exit(EXIT_FAILURE);
            }
        }
    } else {
        Config::load()
    };

    if let Some(ref addr) = cli.listen {
        match addr.parse() {
            Ok(parsed) => config.listen_addr = parsed,
            Err(e) => {
                eprintln!("Invalid listen address {addr}: {e}");
                std::process::exit(EXIT_FAILURE);
            }
        }
    }
    config
}

async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Starting WaveVault v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("WV_BUILD_TIME"),
    );
    info!("  Listen address: {}", config.listen_addr);
    info!("  Bucket: {}", config.store.bucket);
    if let Some(ep) = &config.store.endpoint {
        info!("  Endpoint: {}", ep);
    }
    info!(
        "  Max upload size: {} MiB",
        config.ingest.max_upload_size / 1024 / 1024
    );

    let metrics = Arc::new(Metrics::new());
    metrics.process_start_time_seconds.set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    );
    metrics
        .build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION")])
        .set(1.0);

    // Memory plumbing: probe feeds the throttle, the watchdog, and the
    // adaptive rate controller.
    let probe: Arc<dyn MemoryProbe> = Arc::new(SysinfoProbe::new());
    let latch = Arc::new(PressureLatch::default());
    let pool_config = config.pool_config(probe.available_bytes());
    let soft_cap_bytes = pool_config.soft_cap_bytes;
    let _watchdog = wavevault::monitor::spawn_memory_watchdog(
        probe.clone(),
        latch.clone(),
        config.memory.hard_cap_mib * 1024 * 1024,
        Duration::from_secs(config.memory.watchdog_interval_secs),
    );

    let pool = WorkerPool::start(pool_config, probe.clone(), latch);

    let limiter = Arc::new(RateLimiter::new(config.rate_limits()));
    if config.limits.adaptive_enabled {
        let _controller = spawn_adaptive_controller(
            limiter.clone(),
            probe.clone(),
            soft_cap_bytes,
            Duration::from_secs(config.limits.adaptive_interval_secs),
        );
    }

    let store: Arc<dyn ObjectStore> =
        Arc::new(S3Store::new(&config.store, config.retry_policy()).await?);
    init_bucket(store.as_ref(), &config).await;

    let sessions = Arc::new(SessionStore::new(
        config.session.scratch_dir.clone(),
        config.ingest.max_upload_size,
    )?);
    spawn_session_sweep(&config, sessions.clone(), metrics.clone());

    // Event fan-out: the broadcaster's receiving half is the seam where a
    // WebSocket layer would attach; standalone deployments just drain it.
    let (broadcaster, mut event_rx) = ChannelBroadcaster::new(256);
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!(event = %event.event_type, payload = %event.payload, "progress");
        }
    });

    let progress = Arc::new(ProgressSink::new(
        Arc::new(broadcaster),
        Some(metrics.clone()),
    ));
    let breakers = Arc::new(BreakerManager::new(config.breaker_config()));
    let shutdown = CancellationToken::new();

    let pipeline = Arc::new(IngestPipeline::new(
        store,
        breakers.clone(),
        progress.clone(),
        Arc::new(LogNotifier),
        None,
        Some(pool.clone()),
        Some(metrics.clone()),
        PipelineConfig::from_config(&config),
    ));

    let state = Arc::new(AppState {
        pipeline,
        sessions,
        limiter,
        breakers,
        pool: pool.clone(),
        progress,
        metrics,
        max_upload_size: config.ingest.max_upload_size,
        shutdown: shutdown.clone(),
    });

    let app = api::router(state);
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("WaveVault listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if pool.shutdown(Duration::from_secs(10)).await.is_err() {
        warn!("Active work outlived the shutdown deadline");
    }
    info!("Server shutdown complete");
    Ok(())
}

/// Ensure the bucket exists; policy and CORS are best-effort.
async fn init_bucket(store: &dyn ObjectStore, config: &Config) {
    let bucket = &config.store.bucket;
    if let Err(e) = store.ensure_bucket(bucket).await {
        // Ingest will retry through the breaker; startup goes on.
        warn!("Bucket {} not reachable at startup: {}", bucket, e);
        return;
    }
    if let Err(e) = store.set_bucket_policy(bucket).await {
        warn!("Bucket policy not applied: {}", e);
    }
    if let Err(e) = store
        .set_bucket_cors(bucket, &config.store.cors_origins)
        .await
    {
        warn!("Bucket CORS not applied: {}", e);
    }
}

fn spawn_session_sweep(config: &Config, sessions: Arc<SessionStore>, metrics: Arc<Metrics>) {
    let ttl = config.session_ttl();
    let interval = Duration::from_secs(config.session.sweep_interval_secs);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let removed = sessions.cleanup_expired(ttl);
            if removed > 0 {
                info!("Swept {} expired upload session(s)", removed);
                metrics.sessions_expired_total.inc_by(removed as u64);
            }
            metrics.sessions_active.set(sessions.active_count() as i64);
        }
    });
}

/// `wavevault bucket-clear --force`
async fn bucket_clear(config: Config, force: bool) -> i32 {
    if !force {
        eprintln!("bucket-clear deletes every object in {}; re-run with --force", config.store.bucket);
        return EXIT_FAILURE;
    }

    let store = match S3Store::new(&config.store, config.retry_policy()).await {
        Ok(s) => s,
        Err(e) => {
            error!("Store init failed: {e}");
            return EXIT_FAILURE;
        }
    };

    let keys = match store.list_keys(&config.store.bucket).await {
        Ok(keys) => keys,
        Err(e) => {
            error!("Listing failed: {e}");
            return EXIT_FAILURE;
        }
    };

    let total = keys.len();
    let mut failed = 0usize;
    for key in keys {
        if let Err(e) = store.delete_object(&config.store.bucket, &key).await {
            error!("Delete of {key} failed: {e}");
            failed += 1;
        }
    }

    info!("Cleared {}/{} object(s)", total - failed, total);
    match failed {
        0 => EXIT_OK,
        n if n == total && total > 0 => EXIT_FAILURE,
        _ => EXIT_PARTIAL,
    }
}

/// `wavevault policy-migrate` — re-apply policy/CORS and hash objects that
/// predate canonical metadata.
async fn policy_migrate(config: Config) -> i32 {
    let store = match S3Store::new(&config.store, config.retry_policy()).await {
        Ok(s) => s,
        Err(e) => {
            error!("Store init failed: {e}");
            return EXIT_FAILURE;
        }
    };
    let bucket = config.store.bucket.clone();

    let mut failed = 0usize;
    if let Err(e) = store.set_bucket_policy(&bucket).await {
        error!("Policy apply failed: {e}");
        failed += 1;
    }
    if let Err(e) = store.set_bucket_cors(&bucket, &config.store.cors_origins).await {
        error!("CORS apply failed: {e}");
        failed += 1;
    }

    let keys = match store.list_keys(&bucket).await {
        Ok(keys) => keys,
        Err(e) => {
            error!("Listing failed: {e}");
            return EXIT_FAILURE;
        }
    };

    let total = keys.len();
    let mut migrated = 0usize;
    for key in keys {
        match backfill_hash(&store, &bucket, &key).await {
            Ok(true) => migrated += 1,
            Ok(false) => {}
            Err(e) => {
                error!("Backfill of {key} failed: {e}");
                failed += 1;
            }
        }
    }

    info!("Backfilled {}/{} object(s)", migrated, total);
    if failed == 0 {
        EXIT_OK
    } else {
        EXIT_PARTIAL
    }
}

/// Hash an object's bytes and write canonical metadata if absent.
/// Returns whether a backfill happened.
async fn backfill_hash(
    store: &S3Store,
    bucket: &str,
    key: &str,
) -> Result<bool, Box<dyn std::error::Error>> {
    let head = store.head_object(bucket, key).await?;
    if head.file_hash().is_some() {
        return Ok(false);
    }

    let mut body = store.get_stream(bucket, key).await?;
    let mut hasher = StreamingHasher::new();
    while let Some(chunk) = body.next().await {
        hasher.update(&chunk?);
    }
    let digest = hasher.finalize();

    let mut metadata = head.user_metadata.clone();
    metadata.insert(meta_keys::FILE_HASH.to_string(), digest.to_string());
    metadata
        .entry(meta_keys::ORIGINAL_NAME.to_string())
        .or_insert_with(|| key.to_string());
    metadata.insert(
        meta_keys::UPLOAD_DATE.to_string(),
        head.last_modified
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );

    store
        .copy_object_replace_metadata(bucket, key, metadata)
        .await?;
    Ok(true)
}

/// Resolve on Ctrl+C. In-flight uploads drain through the pool's own
/// shutdown deadline; nothing here needs to distinguish signal kinds.
async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        // No signal handler means no clean trigger; keep serving.
        error!("Cannot listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
    warn!("Shutdown requested, draining active uploads...");
}
