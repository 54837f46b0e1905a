use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use chat_relay::{
    broker::{self, AmqpDialer, BrokerHealth, Topology, redact_credentials},
    cli::Config,
    egress::{self, Broadcaster},
    http::{self, AppState},
    registry::ConnectionRegistry,
    session::Relay,
    shutdown,
};

const SESSION_GRACE: Duration = Duration::from_secs(5);

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::parse();
    let instance = config.instance_id();
    let broker_url = redact_credentials(&config.rabbitmq_url);
    info!(pod = %instance, "starting chat relay");
    info!(url = %broker_url, "using broker");

    let connection = broker::connect(&AmqpDialer, &config.rabbitmq_url, config.retry_policy())
        .await
        .context("broker unavailable at startup")?;
    let topology = Topology::declare(connection)
        .await
        .context("failed to declare broker topology")?;

    let health = Arc::new(BrokerHealth::new());
    {
        let health = Arc::clone(&health);
        topology.on_connection_error(move |err| {
            error!(error = %err, "broker connection failed; fan-out has stopped");
            health.mark_disconnected();
        });
    }

    let (trigger, shutdown) = shutdown::channel();
    let registry = Arc::new(ConnectionRegistry::new());

    let deliveries = topology
        .consume()
        .await
        .context("failed to start broker consumer")?;
    info!(queue = topology.queue_name(), "consuming broker messages");
    let consumer = egress::spawn(
        deliveries,
        Broadcaster::new(Arc::clone(&registry)),
        shutdown.clone(),
        Arc::clone(&health),
    );

    let relay = Relay::new(
        instance.clone(),
        registry,
        Arc::new(topology.publisher()),
        shutdown,
    );
    let app = http::router(AppState::new(relay.clone(), health, broker_url));

    let listener = TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr()))?;
    info!(pod = %instance, "chat relay listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            info!("shutting down");
            trigger.fire();
        })
        .await
        .context("http server failed")?;

    let lingering = relay.drain_sessions(SESSION_GRACE).await;
    if lingering > 0 {
        warn!(sessions = lingering, "sessions still open after the shutdown grace period");
    }
    if let Err(err) = consumer.await {
        warn!(error = ?err, "broker consumer task panicked");
    }
    topology.close().await;

    Ok(())
}
