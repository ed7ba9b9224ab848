/// Listeners and per-accept dispatch
///
/// Two listeners are bound: the primary address serves read-write clients
/// and resolves against the pool's primary; the follower address serves
/// read-only clients and resolves against the lowest-latency available
/// backend. Each accept spawns one proxy session.
pub mod stats;

pub use stats::{ServerStats, StatsSnapshot};

use std::fmt;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use crate::error::PorteraResult;
use crate::pool::Pool;

/// Which routing a listener applies to its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    /// Route to the backend currently serving writes.
    Primary,
    /// Route to an available read-only replica (possibly the primary).
    Follower,
}

impl fmt::Display for ListenerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerRole::Primary => write!(f, "primary"),
            ListenerRole::Follower => write!(f, "follower"),
        }
    }
}

/// The accept side of the proxy: two listeners over one pool.
pub struct Server {
    pool: Arc<Pool>,
    stats: Arc<ServerStats>,
}

impl Server {
    pub fn new(pool: Arc<Pool>, stats: Arc<ServerStats>) -> Self {
        Self { pool, stats }
    }

    /// Bind `addr` and serve it forever. Only the bind can fail; accept
    /// errors are logged and the loop continues.
    pub async fn listen(&self, addr: &str, role: ListenerRole) -> PorteraResult<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("{role} listener on {addr}");
        self.serve_on(listener, role).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve_on(&self, listener: TcpListener, role: ListenerRole) -> PorteraResult<()> {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::error!("error accepting client: {err}");
                    continue;
                }
            };

            if let Err(err) = stream.set_nodelay(true) {
                log::warn!("failed to configure client stream: {err}");
            }

            let pool = Arc::clone(&self.pool);
            let stats = Arc::clone(&self.stats);
            stats.connection_opened();
            tokio::spawn(async move {
                serve_connection(stream, role, pool, Arc::clone(&stats)).await;
                stats.connection_closed();
            });
        }
    }
}

#[cfg(not(feature = "splice"))]
async fn serve_connection(
    stream: TcpStream,
    role: ListenerRole,
    pool: Arc<Pool>,
    stats: Arc<ServerStats>,
) {
    crate::core::session::handle_client(stream, role, pool, stats).await;
}

#[cfg(feature = "splice")]
async fn serve_connection(
    stream: TcpStream,
    role: ListenerRole,
    pool: Arc<Pool>,
    stats: Arc<ServerStats>,
) {
    let dialed = match role {
        ListenerRole::Primary => pool.dial_for_write().await,
        ListenerRole::Follower => pool.dial_for_read().await,
    };
    match dialed {
        Ok((backend, conn)) => crate::core::relay::splice(stream, conn, backend, stats).await,
        Err(err) => {
            // Close the accepted client without writing anything.
            log::error!("couldn't retrieve a backend: {err}");
        }
    }
}
