/// Backend abstraction and in-flight connection tracking
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::error::PorteraResult;

/// Role a backend currently serves, as observed by its health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unavailable,
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Unavailable => write!(f, "unavailable"),
            BackendState::ReadOnly => write!(f, "read-only"),
            BackendState::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// A single database backend as the pool sees it.
///
/// `ping` is called periodically by the pool to assess health and role;
/// any error temporarily removes the backend from the pool. `fail` closes
/// every connection previously handed out by `connect` and is invoked both
/// by clients that hit a read/write fault and by the pool on demotion.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn ping(&self) -> PorteraResult<BackendState>;

    fn addr(&self) -> &str;

    async fn connect(&self, timeout: Duration) -> PorteraResult<PooledConn>;

    fn fail(&self);
}

/// The set of live client-facing connections routed through one backend.
///
/// Each connection holds a cancellation token registered here; `fail_all`
/// trips every token, and the connection's guard deregisters it on drop.
#[derive(Debug, Default)]
pub struct InflightRegistry {
    conns: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
}

impl InflightRegistry {
    pub fn register(self: &Arc<Self>) -> (CancellationToken, InflightGuard) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Ok(mut conns) = self.conns.lock() {
            conns.insert(id, token.clone());
        }
        let guard = InflightGuard {
            id,
            registry: Arc::clone(self),
        };
        (token, guard)
    }

    /// Trip the kill switch of every registered connection.
    pub fn fail_all(&self) {
        let tokens: Vec<CancellationToken> = match self.conns.lock() {
            Ok(mut conns) => conns.drain().map(|(_, token)| token).collect(),
            Err(_) => return,
        };
        for token in tokens {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.conns.lock().map(|conns| conns.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn deregister(&self, id: u64) {
        if let Ok(mut conns) = self.conns.lock() {
            conns.remove(&id);
        }
    }
}

/// Removes a connection from its backend's in-flight set when dropped.
#[derive(Debug)]
pub struct InflightGuard {
    id: u64,
    registry: Arc<InflightRegistry>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// A TCP connection handed out by a backend, carrying the kill switch the
/// backend trips on `fail` and the guard that deregisters it on drop.
#[derive(Debug)]
pub struct PooledConn {
    stream: TcpStream,
    token: CancellationToken,
    guard: InflightGuard,
}

impl PooledConn {
    pub fn new(stream: TcpStream, token: CancellationToken, guard: InflightGuard) -> Self {
        Self {
            stream,
            token,
            guard,
        }
    }

    pub fn kill_switch(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Take the connection apart. The guard must be kept alive for as long
    /// as the stream is in use, or the backend will consider it closed.
    pub fn into_parts(self) -> (TcpStream, CancellationToken, InflightGuard) {
        (self.stream, self.token, self.guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_all_trips_every_registered_connection() {
        let registry = Arc::new(InflightRegistry::default());
        let (first, _guard_a) = registry.register();
        let (second, _guard_b) = registry.register();
        assert_eq!(registry.len(), 2);

        registry.fail_all();
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
        assert!(registry.is_empty());
    }

    #[test]
    fn dropping_the_guard_deregisters() {
        let registry = Arc::new(InflightRegistry::default());
        let (token, guard) = registry.register();
        assert_eq!(registry.len(), 1);

        drop(guard);
        assert!(registry.is_empty());

        // A later sweep must not touch the departed connection.
        registry.fail_all();
        assert!(!token.is_cancelled());
    }
}
