use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use forestcache_service::backend::JsonBackend;
use forestcache_service::config::Config;
use forestcache_service::metric;
use forestcache_service::server::serve;
use forestcache_service::service::ProfileService;
use tokio::net::TcpListener;

use crate::memory::AllocatorMemory;

/// Binds the listener and serves until the process receives Ctrl-C.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // binding fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let parse_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("forestcache-parse")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("forestcache-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let service = Arc::new(ProfileService::create(
        &config,
        JsonBackend,
        Arc::new(AllocatorMemory::default()),
        parse_pool.handle().to_owned(),
    ));

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address {:?}", config.bind))?;

    web_pool.block_on(async move {
        let listener = TcpListener::bind(socket)
            .await
            .with_context(|| format!("failed to bind to {socket}"))?;
        tracing::info!("Starting profile server on {}", socket);

        serve(listener, service, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to listen for shutdown signal"
                );
                std::future::pending::<()>().await;
            }
        })
        .await;

        anyhow::Ok(())
    })?;

    tracing::info!("System shutdown complete");
    Ok(())
}
