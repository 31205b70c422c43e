mod config;
mod server;

use anyhow::Result;
use std::sync::Arc;
use telemon_check::api::{ApiOptions, ApiResolver};
use telemon_check::Resolver;
use telemon_collector::cpu::CpuCollector;
use telemon_collector::disk::DiskCollector;
use telemon_collector::load::LoadCollector;
use telemon_collector::memory::MemoryCollector;
use telemon_collector::network::NetworkCollector;
use telemon_collector::Collector;
use telemon_reverse::Reverse;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|e| anyhow::anyhow!("Failed to install default CryptoProvider: {e:?}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("telemon=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());
    let config = config::AgentConfig::load(&config_path)?;
    tracing::info!(
        check_uuid = %config.check_uuid,
        listen = %config.listen,
        reverse = config.reverse.enabled,
        "telemon-agent starting"
    );

    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(CpuCollector::new()),
        Box::new(MemoryCollector::new()),
        Box::new(DiskCollector::new()),
        Box::new(NetworkCollector::new()),
        Box::new(LoadCollector::new()),
    ];

    let app = server::build_router(collectors);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    let agent_address = listener.local_addr()?.to_string();

    let token = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    {
        let shutdown = token.child_token();
        tasks.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await?;
            Ok(())
        });
    }

    if config.reverse.enabled {
        let resolver = Arc::new(ApiResolver::new(ApiOptions {
            base_url: config.api.url.clone().unwrap_or_default(),
            token: config.api.token.clone().unwrap_or_default(),
            check_uuid: config.check_uuid.clone(),
            broker_ca: config.tls.broker_ca.clone(),
            api_ca: config.tls.ca_file.clone(),
        })?);
        // The initial bundle load must succeed; an agent that cannot learn
        // its brokers has nothing to do.
        resolver.refresh_reverse_config().await?;

        let mut reverse = Reverse::new(resolver, agent_address.clone(), config.reverse_opts())?;
        let reverse_token = token.child_token();
        tasks.spawn(async move {
            reverse.start(reverse_token).await?;
            Ok(())
        });
    }

    {
        let shutdown = token.clone();
        tasks.spawn(async move {
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res?;
                    tracing::info!("shutdown signal received");
                    shutdown.cancel();
                }
                // A failing subsystem cancels the token; stop watching.
                _ = shutdown.cancelled() => {}
            }
            Ok(())
        });
    }

    // First failure cancels the siblings; the exit code reflects it.
    let mut first_error: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    tracing::error!(error = %e, "subsystem failed, shutting down");
                    first_error = Some(e);
                }
                token.cancel();
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e.into());
                }
                token.cancel();
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            tracing::info!("telemon-agent stopped");
            Ok(())
        }
    }
}
