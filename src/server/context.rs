//! The server context holds the state shared by every listener, and the
//! server wrapper that runs the listeners and tears them down again.

use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

use crate::config::settings::ConfigHandle;
use crate::logging::query_logger::QueryLogger;
use crate::pipeline::handler::QueryHandler;
use crate::server::listeners;

/// Cadence of the cache and limiter sweeps.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Common state across all listeners.
pub struct ServerContext {
    pub handler: Arc<QueryHandler>,
    pub logger: Arc<QueryLogger>,
    pub config: Arc<ConfigHandle>,
}

impl ServerContext {
    pub fn new(
        handler: Arc<QueryHandler>,
        logger: Arc<QueryLogger>,
        config: Arc<ConfigHandle>,
    ) -> Arc<ServerContext> {
        Arc::new(ServerContext {
            handler,
            logger,
            config,
        })
    }
}

/// Runs the enabled listeners against one shared context and shuts them
/// down in order: stop accepting, grace for in-flight handlers, then
/// drain the query logger.
pub struct DnsServer {
    context: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DnsServer {
    pub fn new(context: Arc<ServerContext>) -> DnsServer {
        let (shutdown, _) = watch::channel(false);
        DnsServer {
            context,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Binds and spawns every listener the configuration enables. The
    /// TLS configuration is built elsewhere and consumed here; DoT stays
    /// off when it is absent.
    pub async fn run(&self, tls: Option<rustls::ServerConfig>) -> Result<(), ServerError> {
        let settings = self.context.config.snapshot();
        let mut tasks = self.tasks.lock().await;

        if settings.udp_enabled {
            let socket = UdpSocket::bind(&settings.udp_bind).await?;
            info!(bind = %settings.udp_bind, "udp listener bound");
            tasks.push(tokio::spawn(listeners::run_udp(
                Arc::clone(&self.context),
                socket,
                self.shutdown.subscribe(),
            )));
        }

        if settings.tcp_enabled {
            let listener = TcpListener::bind(&settings.tcp_bind).await?;
            info!(bind = %settings.tcp_bind, "tcp listener bound");
            tasks.push(tokio::spawn(listeners::run_tcp(
                Arc::clone(&self.context),
                listener,
                self.shutdown.subscribe(),
            )));
        }

        if settings.dot_enabled {
            match tls {
                Some(tls) => {
                    let listener = TcpListener::bind(&settings.dot_bind).await?;
                    info!(bind = %settings.dot_bind, "dot listener bound");
                    tasks.push(tokio::spawn(listeners::run_dot(
                        Arc::clone(&self.context),
                        listener,
                        tls,
                        self.shutdown.subscribe(),
                    )));
                }
                None => warn!("dot enabled but no tls configuration was provided"),
            }
        }

        // Housekeeping: sweep expired cache entries (all shards in
        // parallel) and idle rate-limit buckets.
        let cache = Arc::clone(self.context.handler.cache());
        let limiter = self.context.handler.limiter().cloned();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {
                        Arc::clone(&cache).cleanup().await;
                        if let Some(limiter) = &limiter {
                            limiter.sweep_idle();
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    /// Cancels the accept loops, gives each listener a grace period to
    /// finish, then closes the query logger so buffered entries drain.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown.send(true);

        let handles = {
            let mut tasks = self.tasks.lock().await;
            std::mem::take(&mut *tasks)
        };
        for mut handle in handles {
            if timeout(grace, &mut handle).await.is_err() {
                warn!("listener did not stop within the grace period");
                handle.abort();
            }
        }

        self.context.logger.close().await;
    }
}
