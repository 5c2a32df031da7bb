// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of duelrank.
//
// duelrank is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// duelrank is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with duelrank.  If not,
// see <http://www.gnu.org/licenses/>.

//! # duelrankd
//!
//! The duelrank server: deal pairs, take votes, keep the ranking live.
//!
//! Startup is deliberately single-threaded: connect to both storage tiers, prime the cache from
//! the durable snapshot, record the cache's run id, and only then spin up the background services
//! (vote processor & patroller, snapshot scheduler, health poller, activation worker) and start
//! listening. Shutdown runs the same order in reverse, in two phases: the HTTP server first, then
//! a graceful broadcast that lets the vote processor drain, then a short forceful one, and a final
//! snapshot so the next start warms from fresh state.

use std::{future::IntoFuture, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use clap::{crate_version, value_parser, Arg, ArgAction, Command};
use opentelemetry::KeyValue;
use snafu::{prelude::*, Backtrace};
use tokio::{net::TcpListener, sync::Notify};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, Layer, Registry};

use duelrank::{
    api::make_router,
    cache,
    catalog::Catalog,
    config,
    duelrank::{prime, Duelrank},
    elo::EloTracker,
    health::{HealthStatus, Monitor, Rebuilder},
    ip_limiter::IpLimiter,
    lifecycle,
    metrics::check_metric_registrations,
    processor::{self, ProcessorContext},
    replay::ReplayGate,
    report::ReportService,
    selector::PairSelector,
    snapshot::Snapshotter,
    storage::Store,
    token::Secret,
    users::{start_activation_worker, Users},
};

const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const FORCEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// The duelrankd application error type
///
/// Note that [Debug] is implemented in terms of [Display]: `main()` returns `Result<(), Error>`,
/// and on the `Err` variant the Rust runtime prints the `Debug` representation to stderr. The
/// derived implementation is unreadable; operators get the display text instead.
#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind {address}: {source}"))]
    Bind {
        address: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Failed to load the item catalog: {source}"))]
    Catalog { source: duelrank::catalog::Error },
    #[snafu(display("Failed to connect to the cache tier: {source}"))]
    CacheConnect { source: cache::Error },
    #[snafu(display("The cache tier did not report a run id at startup: {source}"))]
    InitialRunId { source: cache::Error },
    #[snafu(display("Failed to load configuration: {source}"))]
    Config { source: config::Error },
    #[snafu(display("Failed to parse RUST_LOG: {source}"))]
    EnvFilter {
        source: tracing_subscriber::filter::FromEnvError,
    },
    #[snafu(display("Lifecycle registration failed: {source}"))]
    Lifecycle { source: lifecycle::Error },
    #[snafu(display("Startup priming failed: {source}"))]
    Prime { source: duelrank::duelrank::Error },
    #[snafu(display("Failed to set the tracing subscriber: {source}"))]
    Subscriber {
        source: tracing::subscriber::SetGlobalDefaultError,
    },
    #[snafu(display("While building the Prometheus exporter: {message}"))]
    Telemetry { message: String },
    #[snafu(display("Failed to instantiate a Tokio runtime: {source}"))]
    TokioRuntime { source: std::io::Error },
    #[snafu(display("Failed to open the durable log: {source}"))]
    Store { source: duelrank::storage::Error },
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Logging-related options read from the command line or the environment
struct LogOpts {
    pub plain: bool,
    pub level: Level,
}

struct CliOpts {
    pub log_opts: LogOpts,
    pub cfg: Option<PathBuf>,
}

impl CliOpts {
    fn new(matches: clap::ArgMatches) -> CliOpts {
        CliOpts {
            log_opts: LogOpts {
                plain: matches.get_flag("plain"),
                level: match (
                    matches.get_flag("debug"),
                    matches.get_flag("verbose"),
                    matches.get_flag("quiet"),
                ) {
                    (true, _, _) => Level::TRACE,
                    (false, true, _) => Level::DEBUG,
                    (false, false, true) => Level::ERROR,
                    (_, _, _) => Level::INFO,
                },
            },
            cfg: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

/// Configure logging; JSON structured output by default, compact text with `--plain`
fn configure_logging(opts: &LogOpts) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(opts.level.into())
        .from_env()
        .context(EnvFilterSnafu)?;
    let formatter: Box<dyn Layer<Registry> + Send + Sync> = if opts.plain {
        Box::new(fmt::Layer::default().compact().with_writer(std::io::stdout))
    } else {
        Box::new(
            fmt::Layer::default()
                .json()
                .with_current_span(true)
                .with_writer(std::io::stdout),
        )
    };
    tracing::subscriber::set_global_default(Registry::default().with(formatter).with(filter))
        .context(SubscriberSnafu)
}

/// Initialize telemetry; returns the registry backing the `/metrics` endpoint
///
/// Must be invoked inside the Tokio runtime, before any instrument is touched.
fn init_telemetry() -> Result<prometheus::Registry> {
    check_metric_registrations();
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|err| Error::Telemetry {
            message: err.to_string(),
        })?;
    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder_empty()
                .with_attribute(KeyValue::new("service.name", "duelrank"))
                .build(),
        )
        .with_reader(exporter)
        .build();
    opentelemetry::global::set_meter_provider(provider);
    Ok(registry)
}

/// Block until SIGINT or SIGTERM
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            error!("failed to install the SIGTERM handler: {}", err);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = sigterm.recv() => (),
    }
}

async fn serve(cfg: config::Config, registry: prometheus::Registry) -> Result<()> {
    // --- storage tiers ---
    let store = Store::open(&cfg.database.sqlite).await.context(StoreSnafu)?;
    store.migrate().await.context(StoreSnafu)?;
    let cache: Arc<dyn cache::Backend> = Arc::new(
        cache::Redis::connect(
            &cfg.database.redis.address,
            &cfg.database.redis.password,
            cfg.database.redis.db,
        )
        .await
        .context(CacheConnectSnafu)?,
    );

    // --- core components ---
    let secret = Secret::generate();
    let catalog = Arc::new(Catalog::load(&store).await.context(CatalogSnafu)?);
    let selector = PairSelector::new(catalog.len());
    let tracker = EloTracker::new();
    let users = Arc::new(Users::new(cache.clone()));
    let replay = Arc::new(ReplayGate::new(cache.clone(), store.clone()));
    let ip_limiter = Arc::new(IpLimiter::new(cache.clone()));

    prime(
        cache.as_ref(),
        &store,
        &catalog,
        &tracker,
        &users,
        &replay,
        &ip_limiter,
    )
    .await
    .context(PrimeSnafu)?;

    let health_status = Arc::new(HealthStatus::new());
    health_status.set_initial_run_id(cache.ping().await.context(InitialRunIdSnafu)?);

    // --- lifecycle & background services ---
    let graceful = lifecycle::Manager::new();
    let forceful = lifecycle::Manager::new();

    let activation = start_activation_worker(
        store.clone(),
        cache.clone(),
        graceful.handle("UserActivationWorker").context(LifecycleSnafu)?,
    );

    let snapshotter = Arc::new(Snapshotter::new(cache.clone(), store.clone(), users.clone()));
    {
        let snapshotter = snapshotter.clone();
        let health_status = health_status.clone();
        let handle = graceful.handle("SnapshotScheduler").context(LifecycleSnafu)?;
        tokio::spawn(async move {
            snapshotter.run_scheduler(health_status, handle).await;
        });
    }

    let start_id = store.last_snapshot_vote_id().await.context(StoreSnafu)?;
    let processor_ctx = ProcessorContext {
        cache: cache.clone(),
        store: store.clone(),
        catalog: catalog.clone(),
        tracker: tracker.clone(),
        users: users.clone(),
        health: health_status.clone(),
    };
    let processor = processor::start(
        processor_ctx,
        start_id,
        graceful.handle("VoteProcessor").context(LifecycleSnafu)?,
        forceful.handle("VoteProcessor").context(LifecycleSnafu)?,
        graceful.handle("VotePatroller").context(LifecycleSnafu)?,
    );

    let reports = Arc::new(ReportService::new(
        cache.clone(),
        store.clone(),
        catalog.clone(),
        users.clone(),
        health_status.clone(),
    ));

    let monitor = Monitor {
        status: health_status.clone(),
        cache: cache.clone(),
        rebuilder: Rebuilder {
            cache: cache.clone(),
            store: store.clone(),
            catalog: catalog.clone(),
            tracker: tracker.clone(),
            users: users.clone(),
            replay: replay.clone(),
            ip_limiter: ip_limiter.clone(),
            processor: processor.clone(),
            snapshotter: snapshotter.clone(),
        },
        reports: reports.clone(),
    };
    {
        let handle = forceful.handle("HealthPoller").context(LifecycleSnafu)?;
        tokio::spawn(async move {
            monitor.run(handle).await;
        });
    }

    let state = Arc::new(Duelrank {
        cache,
        store,
        catalog,
        selector,
        tracker,
        secret,
        replay,
        ip_limiter,
        users,
        activation,
        health: health_status,
        processor,
        snapshotter: snapshotter.clone(),
        reports,
        registry,
        image_base_url: cfg.app.image_base_url.clone(),
    });

    // --- the server itself ---
    let listener = TcpListener::bind(&cfg.server.address).await.context(BindSnafu {
        address: cfg.server.address.clone(),
    })?;
    info!("duelrankd listening on {}", cfg.server.address);

    let http_nfy = Arc::new(Notify::new());
    let shutdown_nfy = http_nfy.clone();
    let server = axum::serve(
        listener,
        make_router(state.clone(), &cfg.server.cors.allowed_origins)
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown_nfy.notified().await });
    let mut server_task = tokio::spawn(server.into_future());

    // --- wait, then run the two-phase shutdown ---
    tokio::select! {
        _ = wait_for_signal() => info!("received a termination signal; shutting down"),
        result = &mut server_task => {
            // The server should never exit on its own.
            error!("the HTTP server exited unexpectedly: {:?}", result);
        }
    }

    http_nfy.notify_one();
    match tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, &mut server_task).await {
        Ok(Ok(Ok(()))) => info!("HTTP server closed"),
        Ok(other) => warn!("HTTP server shutdown reported {:?}", other),
        Err(_) => warn!("HTTP server did not close within {:?}", HTTP_SHUTDOWN_TIMEOUT),
    }

    info!("phase one: graceful shutdown");
    graceful.shutdown();
    let stragglers = graceful.wait_with_timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await;
    if !stragglers.is_empty() {
        warn!("graceful services still running: {:?}", stragglers);
    }

    info!("phase two: forceful shutdown");
    forceful.shutdown();
    let stragglers = forceful.wait_with_timeout(FORCEFUL_SHUTDOWN_TIMEOUT).await;
    if !stragglers.is_empty() {
        warn!("forceful services still running: {:?}", stragglers);
    }

    info!("taking the final snapshot");
    match snapshotter.snapshot(None).await {
        Ok(()) => info!("final snapshot complete"),
        Err(err) => error!("final snapshot failed: {}", err),
    }

    info!("duelrankd shut down cleanly");
    Ok(())
}

async fn go_async(opts: CliOpts) -> Result<()> {
    configure_logging(&opts.log_opts)?;
    info!("duelrank version {} starting", crate_version!());
    let cfg = config::load(opts.cfg.as_ref()).context(ConfigSnafu)?;
    let registry = init_telemetry()?;
    serve(cfg, registry).await
}

fn main() -> Result<()> {
    // Most of duelrankd's configuration is read from file; the command line governs where to find
    // that file & how to log while getting there.
    let opts = CliOpts::new(
        Command::new("duelrankd")
            .version(crate_version!())
            .about("A live pairwise-ranking service")
            .long_about(
                "duelrankd deals head-to-head matchups, takes votes on them, and maintains an \
                 ELO-derived ranking in Redis backed by an append-only SQLite log.",
            )
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .num_args(1)
                    .value_parser(value_parser!(PathBuf))
                    .env("DUELRANK_CONFIG")
                    .help(
                        "path (absolute or relative to the process' current directory) to a \
                         configuration file; without it, CONFIG_NAME selects a basename under \
                         ./config or .",
                    ),
            )
            .arg(
                Arg::new("debug")
                    .short('D')
                    .long("debug")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("DUELRANK_DEBUG")
                    .help("produce debug output"),
            )
            .arg(
                Arg::new("plain")
                    .short('p')
                    .long("plain")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("DUELRANK_PLAIN")
                    .help("log in human-readable format, not JSON/structured logging"),
            )
            .arg(
                Arg::new("quiet")
                    .short('q')
                    .long("quiet")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("DUELRANK_QUIET")
                    .help("produce only error output"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .num_args(0)
                    .action(ArgAction::SetTrue)
                    .env("DUELRANK_VERBOSE")
                    .help("produce prolix output"),
            )
            .get_matches(),
    );

    tokio::runtime::Runtime::new()
        .context(TokioRuntimeSnafu)?
        .block_on(go_async(opts))
}
