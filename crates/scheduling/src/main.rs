use std::sync::Arc;

use anyhow::{Context, Result};
use syncwarden_scheduling::activities::{
    ConnectionRecord, InMemoryConfigFetch, InMemoryJobTracker, SimulatedSyncRunner,
};
use syncwarden_scheduling::{
    ConnectionId, ConnectionManagerService, ConnectionSchedule, ManagerConfig, ManagerDeps,
    TimeUnit,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // RUST_LOG overrides the default filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("syncwarden_scheduling=debug,syncwarden_durable=info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("syncwarden-worker starting...");

    let config = ManagerConfig::from_env().context("Failed to load manager config")?;
    let connections = connections_from_env()?;

    tracing::info!(
        connections = connections.len(),
        cycles_before_handoff = config.cycles_before_handoff,
        default_max_attempt = config.default_max_attempt,
        "Starting connection managers"
    );

    let activities = Arc::new(InMemoryConfigFetch::new(config.default_max_attempt));
    for connection_id in &connections {
        activities.insert(
            *connection_id,
            ConnectionRecord::new(ConnectionSchedule::every(1, TimeUnit::Hours)),
        );
    }
    let jobs = Arc::new(InMemoryJobTracker::new().with_schedule_feedback(activities.clone()));

    let service = ConnectionManagerService::new(ManagerDeps {
        activities,
        jobs,
        runner: Arc::new(SimulatedSyncRunner::default()),
        config,
    });

    for connection_id in connections {
        service
            .start_connection(connection_id)
            .with_context(|| format!("Failed to start manager for {connection_id}"))?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    service.shutdown();
    tracing::info!("Worker shutdown complete");
    Ok(())
}

/// Connections named in `SYNCWARDEN_CONNECTIONS` (comma separated), or one
/// generated connection if unset
fn connections_from_env() -> Result<Vec<ConnectionId>> {
    let raw = std::env::var("SYNCWARDEN_CONNECTIONS").unwrap_or_default();
    let connections = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<ConnectionId>()
                .with_context(|| format!("Invalid connection id in SYNCWARDEN_CONNECTIONS: {s}"))
        })
        .collect::<Result<Vec<_>>>()?;

    if connections.is_empty() {
        return Ok(vec![ConnectionId::new()]);
    }
    Ok(connections)
}
