//! Journey worker: consumes the journey and trigger queues and runs the scan
//! scheduler.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use journey_broker::{AmqpBroker, BrokerClient};
use journey_cache::RedisMarkerStore;
use journey_content::{HttpContentStore, HttpRuleEvaluator, HttpSender};
use journey_core::config::AppConfig;
use journey_core::event_bus::noop_sink;
use journey_engine::{attach_all, EngineSettings, JourneyEngine, Scheduler};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "journey-worker")]
#[command(about = "Moves contacts through journeys over RabbitMQ delayed queues")]
#[command(version)]
struct Cli {
    /// AMQP URL (overrides config)
    #[arg(long, env = "JOURNEYS__BROKER__URL")]
    broker_url: Option<String>,

    /// Redis URL for scan markers (overrides config)
    #[arg(long, env = "JOURNEYS__REDIS__URL")]
    redis_url: Option<String>,

    /// Content API base URL (overrides config)
    #[arg(long, env = "JOURNEYS__CONTENT__BASE_URL")]
    content_url: Option<String>,

    /// Do not run the journey-scan scheduler on this node
    #[arg(long, default_value_t = false)]
    no_scheduler: bool,

    /// Declare exchanges and queues, then exit
    #[arg(long, default_value_t = false)]
    setup_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journey_worker=info,journey_engine=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Journey worker starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(url) = cli.broker_url {
        config.broker.url = url;
    }
    if let Some(url) = cli.redis_url {
        config.redis.urls = vec![url];
    }
    if let Some(url) = cli.content_url {
        config.content.base_url = url;
    }
    if cli.no_scheduler {
        config.scheduler.enabled = false;
    }

    info!(
        node_id = %config.node_id,
        content_url = %config.content.base_url,
        scheduler = config.scheduler.enabled,
        backoff_secs = config.rule_check.backoff_secs,
        max_rule_checks = ?config.rule_check.max_attempts,
        "Configuration loaded"
    );

    let metrics_addr = SocketAddr::new(
        config.metrics.host.parse().context("invalid metrics host")?,
        config.metrics.port,
    );
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
    {
        Ok(()) => info!(port = config.metrics.port, "Metrics exporter started"),
        Err(e) => error!(error = %e, "Failed to start metrics exporter"),
    }

    let mut amqp = AmqpBroker::connect(&config.broker)
        .await
        .context("broker connection required")?;
    let mut consumer_failures = amqp.consumer_failures();
    let broker: Arc<dyn BrokerClient> = Arc::new(amqp);
    broker.setup().await.context("broker topology setup failed")?;
    info!("Broker topology declared");
    if cli.setup_only {
        info!("Setup only, exiting");
        return Ok(());
    }

    let markers = Arc::new(
        RedisMarkerStore::new(&config.redis)
            .await
            .context("Redis connection required")?,
    );
    let engine = Arc::new(JourneyEngine::new(
        Arc::new(HttpContentStore::new(&config.content)?),
        Arc::new(HttpSender::new(&config.content)?),
        Arc::new(HttpRuleEvaluator::new(&config.content)?),
        broker.clone(),
        noop_sink(),
        EngineSettings::from_config(&config),
    ));

    attach_all(&broker, engine.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = if config.scheduler.enabled {
        let scheduler = Scheduler::new(engine, markers, config.scheduler.clone());
        Some(tokio::spawn(async move { scheduler.run(shutdown_rx).await }))
    } else {
        info!("Scheduler disabled on this node");
        None
    };

    info!("Journey worker is ready");

    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
            Ok(())
        }
        Some(stopped) = consumer_failures.recv() => {
            error!(queue = %stopped.queue, reason = %stopped.reason, "Consumer stopped, shutting down");
            Err(anyhow::anyhow!(
                "consumer on {} stopped: {}",
                stopped.queue,
                stopped.reason
            ))
        }
    };

    // Receiver may already be gone when the scheduler is disabled.
    let _ = shutdown_tx.send(true);
    if let Some(task) = scheduler_task {
        if let Err(e) = task.await {
            error!(error = %e, "Scheduler task failed");
        }
    }

    info!("Journey worker stopped");
    outcome
}
