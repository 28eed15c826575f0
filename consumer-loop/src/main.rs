use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use common_consumption::kafka::KafkaBrokerClient;
use common_consumption::{BrokerClient, ConsumptionEngine, EngineState};
use envconfig::Envconfig;
use opentelemetry::{KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::level_filters::LevelFilter;
use tracing::{error, info, warn};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use consumer_loop::config::Config;
use consumer_loop::handler::TracingRecordHandler;
use consumer_loop::observer::AssignmentGaugeObserver;
use consumer_loop::serve::{router, serve, Readiness};

fn init_tracer(config: &Config, sink_url: &str) -> Result<Tracer> {
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                    config.otel_sampling_rate,
                ))))
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![KeyValue::new(
                    "service.name",
                    Value::from(config.otel_service_name.clone()),
                )])),
        )
        .with_batch_config(BatchConfig::default())
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(sink_url)
                .with_timeout(Duration::from_secs(config.otel_export_timeout_secs)),
        )
        .install_batch(runtime::Tokio)?;

    Ok(tracer)
}

fn init_tracing(config: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "consumer_loop=info,common_consumption=info,warn".into());

    let log_layer = if config.json_logs() {
        fmt::layer().json().with_filter(filter).boxed()
    } else {
        fmt::layer().with_target(true).with_filter(filter).boxed()
    };

    // record spans are exported only when a collector is configured
    let otel_layer = match config.otel_url.as_deref() {
        Some(otel_url) => Some(
            OpenTelemetryLayer::new(
                init_tracer(config, otel_url).context("Failed to initialize OpenTelemetry tracer")?,
            )
            .with_filter(LevelFilter::INFO),
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .init();
    Ok(())
}

fn start_server(config: &Config, readiness: Readiness) -> Result<JoinHandle<()>> {
    let router = router(&config.otel_service_name, readiness)
        .context("Failed to install metrics recorder")?;
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Metrics server failed on {}: {:#}", bind, e);
        }
    }))
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;

    init_tracing(&config)?;
    info!("Starting consumer loop");
    info!("Configuration loaded: {:?}", config);

    let client = KafkaBrokerClient::connect(&config.kafka, &config.consumer)
        .await
        .with_context(|| format!("Failed to connect to Kafka at {}", config.kafka.kafka_hosts))?;

    let handler = Arc::new(TracingRecordHandler::new(
        client.group_identity(),
        config.trace_header.clone(),
    ));
    let engine = ConsumptionEngine::new(config.consumer.subscription(), client, handler)
        .context("Invalid consumption engine configuration")?
        .with_rebalance_observer(Arc::new(AssignmentGaugeObserver::default()));
    let engine = Arc::new(engine);

    let readiness: Readiness = {
        let engine = engine.clone();
        Arc::new(move || engine.state() == EngineState::Running)
    };
    let server_handle = start_server(&config, readiness)?;
    info!("Started metrics server on {}", config.bind_address());

    let mut running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    let result = tokio::select! {
        signalled = wait_for_shutdown_signal() => {
            if let Err(e) = signalled {
                error!("Stopping after signal handler failure: {:#}", e);
            }
            engine.shutdown();

            match tokio::time::timeout(config.shutdown_timeout(), &mut running).await {
                Ok(joined) => joined.context("Consumption task panicked")?.map_err(anyhow::Error::from),
                Err(_) => {
                    warn!(
                        "Consumption engine did not stop within {:?}, aborting",
                        config.shutdown_timeout()
                    );
                    running.abort();
                    Err(anyhow!("consumption engine did not stop in time"))
                }
            }
        }
        joined = &mut running => {
            joined.context("Consumption task panicked")?.map_err(anyhow::Error::from)
        }
    };

    server_handle.abort();

    if let Err(e) = &result {
        error!("Consumer loop exited with error: {:#}", e);
    } else {
        info!("Consumer loop stopped");
    }
    // flushes pending record spans when an OTLP exporter is installed
    opentelemetry::global::shutdown_tracer_provider();
    result
}
