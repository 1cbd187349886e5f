//! Floorlink - shop-floor telemetry bridge and ingest service
//!
//! Usage:
//!   floorlink [OPTIONS] [COMMAND]
//!
//! Commands:
//!   bridge   Forward between MQTT and Kafka
//!   ingest   Persist Kafka domain messages to PostgreSQL
//!   all      Run both (default)
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -d, --debug            Shorthand for --log-level debug
//!   --dry-run              Roll back every ingest transaction
//!   -h, --help             Print help

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use floorlink::bridge::{BridgeEngine, TopicTranslator};
use floorlink::cache::IdResolver;
use floorlink::config::Config;
use floorlink::lifecycle::Lifecycle;
use floorlink::metrics::{HealthServer, Metrics};
use floorlink::processor::{HandlerContext, HandlerRegistry, IngestConsumer};
use floorlink::store::{PostgresStore, Store};
use floorlink::transport::{BrokerConsumer, KafkaConsumer, KafkaProducer, MqttDeviceClient};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Subcommand, Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Mode {
    /// Forward between MQTT and Kafka
    Bridge,
    /// Persist Kafka domain messages to PostgreSQL
    Ingest,
    /// Bridge and ingest in one process
    #[default]
    All,
}

impl Mode {
    fn bridge(self) -> bool {
        matches!(self, Mode::Bridge | Mode::All)
    }

    fn ingest(self) -> bool {
        matches!(self, Mode::Ingest | Mode::All)
    }
}

/// Floorlink - shop-floor telemetry bridge
#[derive(Parser, Debug)]
#[command(name = "floorlink")]
#[command(author = "Floorlink Contributors")]
#[command(version)]
#[command(about = "MQTT/Kafka bridge and transactional PostgreSQL ingest")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Execute every ingest write but roll it back
    #[arg(long)]
    dry_run: bool,

    #[command(subcommand)]
    mode: Option<Mode>,
}

fn fatal(what: &str, err: impl std::fmt::Display) -> ! {
    error!("{}: {}", what, err);
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Missing file falls back to defaults plus environment overrides
    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };
    if args.dry_run {
        config.ingest.dry_run = true;
    }

    // CLI level, then --debug, then config
    let log_level = args.log_level.unwrap_or_else(|| {
        if args.debug {
            LogLevel::Debug
        } else {
            LogLevel::from_config(&config.log.level)
        }
    });

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    let mode = args.mode.unwrap_or_default();
    info!("Starting floorlink ({:?})", mode);
    info!("  MQTT: {} ({})", config.mqtt.address, config.mqtt.protocol);
    info!("  Kafka: {}", config.kafka.bootstrap_servers);
    if mode.ingest() {
        info!(
            "  PostgreSQL: {}:{}/{}{}",
            config.postgres.host,
            config.postgres.port,
            config.postgres.database,
            if config.ingest.dry_run { " (dry run)" } else { "" }
        );
    }

    let metrics = Arc::new(Metrics::new());
    let lifecycle = Lifecycle::new(
        config.lifecycle.drain_window,
        config.health.max_workers,
        metrics.clone(),
    );

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    if config.health.enabled {
        let server = HealthServer::new(metrics.clone(), lifecycle.clone(), config.health.bind);
        match server.bind().await {
            Ok(bound) => handles.push(tokio::spawn(bound.run())),
            Err(e) => fatal("Failed to bind health server", e),
        }
    } else {
        info!("  Health server: disabled");
    }

    let translator = TopicTranslator::new(config.bridge.topic_prefix.clone());

    // Bridge: MQTT <-> Kafka
    let mut bridge = None;
    if mode.bridge() {
        let producer = KafkaProducer::new(&config.kafka)
            .unwrap_or_else(|e| fatal("Failed to create Kafka producer", e));

        let consumer = match &config.bridge.kafka_listen_topic {
            Some(_) => {
                let consumer = KafkaConsumer::new(&config.kafka, &config.bridge.group_id, true)
                    .unwrap_or_else(|e| fatal("Failed to create Kafka consumer", e));
                Some(Arc::new(consumer) as Arc<dyn BrokerConsumer>)
            }
            None => None,
        };

        let (device, mqtt_handle) = MqttDeviceClient::connect(&config.mqtt, lifecycle.token());
        handles.push(mqtt_handle);

        let engine = Arc::new(BridgeEngine::new(
            config.bridge.clone(),
            Arc::new(producer),
            consumer,
            Arc::new(device),
            metrics.clone(),
            lifecycle.clone(),
        ));
        if let Err(e) = engine.subscribe().await {
            fatal("Bridge subscription failed", e);
        }
        handles.extend(engine.spawn());
        bridge = Some(engine);
    }

    // Ingest: Kafka -> PostgreSQL
    let mut store: Option<Arc<dyn Store>> = None;
    if mode.ingest() {
        let postgres: Arc<dyn Store> = match PostgresStore::connect(&config.postgres).await {
            Ok(pg) => Arc::new(pg),
            Err(e) => fatal("Failed to connect to PostgreSQL", e),
        };
        let resolver = Arc::new(IdResolver::new(postgres.clone(), metrics.clone()));
        let ctx = Arc::new(HandlerContext::new(
            postgres.clone(),
            resolver,
            metrics.clone(),
            config.ingest.dry_run,
            config.ingest.transaction_timeout,
        ));
        let registry = Arc::new(HandlerRegistry::with_defaults(ctx));

        let consumer = KafkaConsumer::new(&config.kafka, &config.ingest.group_id, false)
            .unwrap_or_else(|e| fatal("Failed to create Kafka consumer", e));
        let ingest = IngestConsumer::new(
            Arc::new(consumer),
            registry,
            translator.clone(),
            config.ingest.clone(),
            metrics.clone(),
        );
        if let Err(e) = ingest.subscribe().await {
            fatal("Ingest subscription failed", e);
        }
        let token = lifecycle.token();
        handles.push(lifecycle.spawn("ingest", ingest.run(token)));
        store = Some(postgres);
    }

    // First signal drains, second one cuts the drain window short
    let signals = lifecycle.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown requested");
        let draining = signals.clone();
        tokio::spawn(async move { draining.drain().await });

        shutdown_signal().await;
        warn!("Second shutdown signal, stopping now");
        signals.shutdown_now();
    });

    lifecycle.token().cancelled().await;

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    if let Some(engine) = bridge {
        engine.shutdown().await;
    }
    if let Some(store) = store {
        store.close().await;
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
