use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use maestro::controller::{
    ConsumerConfig, DeploymentMonitor, EventConsumer, HealthState, LifecycleHandler,
    MonitorConfig, Reconciler, Service,
};
use maestro::deployer::{CollectorSettings, DeployerConfig, ExporterRegistry, KubeDeployer};
use maestro::events::RedisEventLog;
use maestro::registry::HttpSinkRegistry;
use maestro::store::{RedisLedger, RedisStatusCache};
use maestro::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane
    Run(RunArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Redis holding the sink lifecycle and channel streams
    #[arg(long, env = "MAESTRO_REDIS_STREAM_URL", default_value = "redis://localhost:6379")]
    redis_stream_url: String,

    /// Redis holding the deployment ledger and sink status cache
    #[arg(long, env = "MAESTRO_REDIS_SINKER_URL", default_value = "redis://localhost:6379")]
    redis_sinker_url: String,

    /// Base URL of the sink registry
    #[arg(long, env = "MAESTRO_REGISTRY_URL", default_value = "http://localhost:8200")]
    registry_url: String,

    /// Consumer name within the consumer groups (defaults to the hostname)
    #[arg(long, env = "MAESTRO_CONSUMER_NAME")]
    consumer_name: Option<String>,

    /// Namespace collectors are deployed to
    #[arg(long, env = "MAESTRO_NAMESPACE", default_value = "otelcollectors")]
    namespace: String,

    /// Kafka brokers collectors read metrics from
    #[arg(long, env = "MAESTRO_KAFKA_URL", default_value = "kafka:9092")]
    kafka_url: String,

    /// Collector container image
    #[arg(
        long,
        env = "MAESTRO_COLLECTOR_IMAGE",
        default_value = "otel/opentelemetry-collector-contrib:0.91.0"
    )]
    collector_image: String,

    /// Maximum messages per stream read
    #[arg(long, env = "MAESTRO_BATCH_SIZE", default_value_t = 100)]
    batch_size: usize,

    /// Longest a stream read blocks, in milliseconds
    #[arg(long, env = "MAESTRO_BLOCK_MS", default_value_t = 5000)]
    block_ms: u64,

    /// Seconds between monitor polls
    #[arg(long, env = "MAESTRO_MONITOR_INTERVAL_SECS", default_value_t = 30)]
    monitor_interval_secs: u64,

    /// Consecutive failed monitor polls before shutting down
    #[arg(long, env = "MAESTRO_MONITOR_MAX_FAILURES", default_value_t = 5)]
    monitor_max_failures: u32,

    /// Address for the health and metrics endpoints
    #[arg(long, env = "MAESTRO_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    http_addr: SocketAddr,

    /// Emit logs as JSON
    #[arg(long, env = "MAESTRO_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Maestro v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Run(run_args) => run(run_args).await,
    }
}

fn init_tracing(log_json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = if log_json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer().with_target(true).boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    let otel_enabled = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok();

    if otel_enabled {
        let otel_layer = maestro::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

fn default_consumer_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "maestro".to_string())
}

async fn run(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_json);
    info!("Starting Maestro v{}", env!("CARGO_PKG_VERSION"));

    let consumer_name = args.consumer_name.clone().unwrap_or_else(default_consumer_name);
    info!("Consuming streams as {}", consumer_name);

    let ledger = Arc::new(RedisLedger::connect(&args.redis_sinker_url).await?);
    let status = Arc::new(RedisStatusCache::connect(&args.redis_sinker_url).await?);
    // A blocking group read holds its connection, so each subscription gets one
    let sinks_log = Arc::new(RedisEventLog::connect(&args.redis_stream_url).await?);
    let channels_log = Arc::new(RedisEventLog::connect(&args.redis_stream_url).await?);
    info!("Connected to Redis");

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let deployer = Arc::new(KubeDeployer::new(
        client,
        DeployerConfig {
            namespace: args.namespace.clone(),
            collector_image: args.collector_image.clone(),
            collector: CollectorSettings {
                kafka_url: args.kafka_url.clone(),
            },
        },
        Arc::new(ExporterRegistry::default()),
    ));
    let registry = Arc::new(HttpSinkRegistry::new(
        &args.registry_url,
        Duration::from_secs(30),
    )?);

    let health = HealthState::new();
    let handler = LifecycleHandler::new(ledger.clone(), status.clone(), deployer.clone());
    let block = Duration::from_millis(args.block_ms);
    let consumers = vec![
        EventConsumer::new(
            sinks_log,
            handler.clone(),
            ConsumerConfig::for_sinks(&consumer_name)
                .with_batch_size(args.batch_size)
                .with_block(block),
            health.clone(),
        ),
        EventConsumer::new(
            channels_log,
            handler,
            ConsumerConfig::for_channels(&consumer_name)
                .with_batch_size(args.batch_size)
                .with_block(block),
            health.clone(),
        ),
    ];
    let monitor = Arc::new(DeploymentMonitor::new(
        ledger.clone(),
        status.clone(),
        deployer.clone(),
        MonitorConfig {
            interval: Duration::from_secs(args.monitor_interval_secs.max(1)),
            max_failures: args.monitor_max_failures.max(1),
            ..Default::default()
        },
    ));
    let reconciler = Reconciler::new(registry, ledger, status, deployer);
    let service = Service::new(reconciler, consumers, monitor);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
            }
            cancel.cancel();
        });
    }

    #[cfg(feature = "rest-api")]
    {
        let api_state = maestro::rest_api::ApiState {
            health: health.clone(),
        };
        let addr = args.http_addr;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = maestro::rest_api::run_server(api_state, addr, cancel).await {
                error!("REST API server error: {:?}", e);
            }
        });
    }

    let result = service.run(cancel.clone()).await;
    if let Err(e) = &result {
        error!("Maestro stopped with error: {}", e);
        cancel.cancel();
    }

    // Flush any remaining traces
    maestro::telemetry::shutdown_telemetry();

    result
}
