/// Read-only stats endpoint
///
/// The forwarding loops and listeners feed two atomic counters; this
/// module serves them as JSON over HTTP.
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use crate::error::PorteraResult;

/// Process-wide traffic counters.
#[derive(Debug, Default)]
pub struct ServerStats {
    transferred_bytes: AtomicI64,
    connections: AtomicI64,
}

impl ServerStats {
    /// Count bytes that completed one traversal through the proxy.
    pub fn add_transferred(&self, n: usize) {
        self.transferred_bytes.fetch_add(n as i64, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transferred_bytes: self.transferred_bytes.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub transferred_bytes: i64,
    pub connections: i64,
}

/// Serve `GET /stats` on the given address until the process exits.
pub async fn serve(addr: &str, stats: Arc<ServerStats>) -> PorteraResult<()> {
    let app = router(stats);
    let listener = TcpListener::bind(addr).await?;
    log::info!("stats endpoint on http://{addr}/stats");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(stats: Arc<ServerStats>) -> Router {
    Router::new()
        .route("/stats", get(get_stats))
        .with_state(stats)
}

async fn get_stats(State(stats): State<Arc<ServerStats>>) -> Json<StatsSnapshot> {
    Json(stats.snapshot())
}
