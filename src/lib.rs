pub mod config;
pub mod error;
/// sentinel-proxy - transparent high-availability proxy for Redis deployments
/// managed by Redis Sentinel
///
/// Clients talk plain RESP to the proxy. Writes go to the current primary,
/// reads that are safe to serve from a replica go to the replica pool and
/// their replies are cached for a short freshness window. A background task
/// follows failovers and replica changes reported by the sentinels.
pub mod core;
pub mod discovery;
pub mod redis;
pub mod utils;

use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::core::{ResponseCache, Session};
use crate::discovery::{Coordinator, Discovery, SentinelClient, Topology};
use crate::error::ProxyResult;
use crate::utils::{format_bytes, format_duration};

/// Main proxy instance
pub struct SentinelProxy {
    config: Config,
}

impl SentinelProxy {
    /// Create a proxy from a validated configuration
    pub fn new(config: Config) -> ProxyResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the configured listener and serve until Ctrl-C
    pub async fn run(&self) -> ProxyResult<()> {
        let listener = TcpListener::bind(&self.config.server.listen_addr).await?;
        let coordinator = Arc::new(SentinelClient::new(self.config.sentinel.query_timeout()));
        self.run_with(coordinator, listener, shutdown_signal()).await
    }

    /// Serve clients accepted on `listener` until `shutdown` resolves.
    ///
    /// Fails without serving anyone when the initial primary cannot be
    /// reached.
    pub async fn run_with<F>(
        &self,
        coordinator: Arc<dyn Coordinator>,
        listener: TcpListener,
        shutdown: F,
    ) -> ProxyResult<()>
    where
        F: Future<Output = ()>,
    {
        let config = &self.config;

        let topology = Arc::new(Topology::new(
            config.pool.connections_per_endpoint,
            config.pool.connect_timeout(),
        ));
        let discovery = Arc::new(
            Discovery::new(Arc::clone(&topology), coordinator)
                .with_master_name(config.sentinel.master_name.clone())
                .with_refresh_interval(config.sentinel.refresh_interval())
                .with_exploration_window(config.sentinel.exploration_window()),
        );
        discovery
            .bootstrap(config.sentinel.primary(), config.sentinel.seed_endpoints()?)
            .await?;
        let discovery_task = Arc::clone(&discovery).spawn();
        log::info!(
            "Following sentinels every {}",
            format_duration(config.sentinel.refresh_interval())
        );

        let cache = config.cache.enabled.then(|| {
            Arc::new(ResponseCache::new(
                config.cache.freshness(),
                config.cache.max_request_bytes,
            ))
        });
        let sweeper = cache
            .clone()
            .map(|cache| cache.start_sweeper(config.cache.sweep_interval()));
        if cache.is_some() {
            log::info!(
                "Caching replica replies for {}ms (requests up to {})",
                config.cache.freshness_ms,
                format_bytes(config.cache.max_request_bytes as u64)
            );
        }

        let timeouts = config.session.timeouts();
        let limiter = Arc::new(Semaphore::new(config.server.max_connections));
        let mut sessions = JoinSet::new();

        log::info!("Proxy listening on: {}", listener.local_addr()?);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutdown requested, closing {} sessions", sessions.len());
                    break;
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            log::error!("Session task panicked: {e}");
                        }
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Failed to accept client connection: {e}");
                            continue;
                        }
                    };

                    let permit = match Arc::clone(&limiter).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            log::warn!(
                                "Connection limit of {} reached, rejecting {}",
                                config.server.max_connections,
                                peer
                            );
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        log::debug!("Failed to set TCP_NODELAY for {peer}: {e}");
                    }

                    let session = Session::new(stream, Arc::clone(&topology), cache.clone(), timeouts)
                        .with_peer(peer.to_string())
                        .with_buffer_size(config.server.buffer_size)
                        .with_max_request_bytes(config.server.max_request_bytes);
                    sessions.spawn(async move {
                        let _permit = permit;
                        // Outcome is logged by the session itself
                        let _ = session.run().await;
                    });
                }
            }
        }

        discovery_task.abort();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        topology.close();
        sessions.shutdown().await;

        log::info!("Proxy stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Unable to listen for Ctrl-C, running until killed: {e}");
        std::future::pending::<()>().await;
    }
}
