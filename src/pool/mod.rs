/// A pool of monitored database backends
///
/// Every registered backend gets its own probe task that pings it once a
/// second, classifies it as unavailable / read-only / read-write, and
/// applies the resulting transition under the pool's single lock. The pool
/// maintains two derived views: the list of available members, kept sorted
/// ascending by probe latency, and the primary pointer, referencing the one
/// member currently serving writes.
pub mod backend;
pub mod postgres;

pub use backend::{Backend, BackendState, InflightGuard, InflightRegistry, PooledConn};

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{PorteraError, PorteraResult};

/// How often each backend is probed.
const PROBE_INTERVAL: Duration = Duration::from_secs(1);
/// Per-attempt timeout for a client-side dial.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Wall-clock budget for a client-side dial including retries.
const DIAL_DEADLINE: Duration = Duration::from_secs(30);
/// Initial client-side dial backoff; doubles on every failed attempt.
const DIAL_BACKOFF: Duration = Duration::from_millis(2);

struct Member {
    backend: Arc<dyn Backend>,
    state: BackendState,
    latency: Duration,
}

struct PoolInner {
    members: Vec<Member>,
    /// Indices of available members, sorted ascending by latency.
    avail: Vec<usize>,
    /// Index of the read-write member, when one exists.
    primary: Option<usize>,
}

impl PoolInner {
    /// Apply one probe outcome. Returns true when the member must have its
    /// in-flight connections failed (called after the lock is released, so
    /// no I/O happens under the lock).
    fn apply_probe(
        &mut self,
        idx: usize,
        outcome: &PorteraResult<BackendState>,
        latency: Duration,
    ) -> bool {
        let prev = self.members[idx].state;
        let mut needs_fail = false;

        let next = match outcome {
            Err(_) if prev != BackendState::Unavailable => {
                // Going down: drop out of the availability view, clear the
                // primary pointer if we held it, and fail open connections.
                self.avail.retain(|&i| i != idx);
                if prev == BackendState::ReadWrite {
                    self.primary = None;
                }
                needs_fail = true;
                BackendState::Unavailable
            }
            Err(_) => BackendState::Unavailable,
            Ok(state) if prev == *state => *state,
            Ok(state) if prev == BackendState::Unavailable => {
                self.avail.push(idx);
                if *state == BackendState::ReadWrite {
                    self.primary = Some(idx);
                }
                *state
            }
            Ok(BackendState::ReadOnly) if prev == BackendState::ReadWrite => {
                // Demoted from primary to follower; fail all connections and
                // let client applications reconnect.
                self.primary = None;
                needs_fail = true;
                BackendState::ReadOnly
            }
            Ok(BackendState::ReadWrite) if prev == BackendState::ReadOnly => {
                self.primary = Some(idx);
                BackendState::ReadWrite
            }
            Ok(state) => *state,
        };

        if prev != next {
            log::info!(
                "backend {}: {} -> {} (latency {:?})",
                self.members[idx].backend.addr(),
                prev,
                next,
                latency
            );
        }

        self.members[idx].state = next;
        self.members[idx].latency = if next == BackendState::Unavailable {
            Duration::MAX
        } else {
            latency
        };
        self.sort_avail();

        needs_fail
    }

    fn sort_avail(&mut self) {
        let members = &self.members;
        // Stable sort keeps insertion order for equal latencies.
        self.avail.sort_by_key(|&i| members[i].latency);
    }

    fn pick_read(&self) -> Option<Arc<dyn Backend>> {
        self.avail
            .first()
            .map(|&i| Arc::clone(&self.members[i].backend))
    }

    fn pick_write(&self) -> Option<Arc<dyn Backend>> {
        self.primary.map(|i| Arc::clone(&self.members[i].backend))
    }
}

/// The pool singleton: membership, availability ordering, primary tracking.
pub struct Pool {
    inner: RwLock<PoolInner>,
    shutdown: CancellationToken,
    probes: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                members: Vec::new(),
                avail: Vec::new(),
                primary: None,
            }),
            shutdown: CancellationToken::new(),
            probes: Mutex::new(Vec::new()),
        }
    }

    /// Add a backend and start probing it. The backend starts out
    /// unavailable; there is no guarantee of immediate availability.
    pub async fn register(self: &Arc<Self>, backend: Arc<dyn Backend>) {
        let idx = {
            let mut inner = self.inner.write().await;
            inner.members.push(Member {
                backend: Arc::clone(&backend),
                state: BackendState::Unavailable,
                latency: Duration::MAX,
            });
            inner.members.len() - 1
        };

        log::info!("starting monitoring of {}", backend.addr());
        let handle = tokio::spawn(monitor(
            Arc::downgrade(self),
            idx,
            backend,
            self.shutdown.clone(),
        ));
        if let Ok(mut probes) = self.probes.lock() {
            probes.push(handle);
        }
    }

    /// The lowest-latency available backend; may be the primary.
    pub async fn get_for_read(&self) -> PorteraResult<Arc<dyn Backend>> {
        self.inner
            .read()
            .await
            .pick_read()
            .ok_or(PorteraError::NoneAvailable)
    }

    /// The backend currently serving writes.
    pub async fn get_for_write(&self) -> PorteraResult<Arc<dyn Backend>> {
        self.inner
            .read()
            .await
            .pick_write()
            .ok_or(PorteraError::NoneAvailable)
    }

    /// Dial the lowest-latency available backend, retrying with backoff.
    pub async fn dial_for_read(&self) -> PorteraResult<(Arc<dyn Backend>, PooledConn)> {
        self.dial(PoolInner::pick_read).await
    }

    /// Dial the primary. Fails fast with `NoneAvailable` when no primary is
    /// known, so writer clients are refused rather than misrouted.
    pub async fn dial_for_write(&self) -> PorteraResult<(Arc<dyn Backend>, PooledConn)> {
        self.dial(PoolInner::pick_write).await
    }

    async fn dial<F>(&self, pick: F) -> PorteraResult<(Arc<dyn Backend>, PooledConn)>
    where
        F: Fn(&PoolInner) -> Option<Arc<dyn Backend>>,
    {
        let first = { pick(&*self.inner.read().await) };
        let Some(mut backend) = first else {
            return Err(PorteraError::NoneAvailable);
        };

        let deadline = Instant::now() + DIAL_DEADLINE;
        let mut retry = DIAL_BACKOFF;
        loop {
            match backend.connect(DIAL_TIMEOUT).await {
                Ok(conn) => return Ok((backend, conn)),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err);
                    }
                    sleep(retry).await;
                    retry *= 2;
                    // Re-resolve: the next probe tick may have reclassified
                    // the pool; keep waiting if nothing is available yet.
                    match { pick(&*self.inner.read().await) } {
                        Some(next) => backend = next,
                        None => {
                            if Instant::now() >= deadline {
                                return Err(PorteraError::NoneAvailable);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stop all probe tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = match self.probes.lock() {
            Ok(mut probes) => probes.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn available_addrs(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .avail
            .iter()
            .map(|&i| inner.members[i].backend.addr().to_string())
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn primary_addr(&self) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .primary
            .map(|i| inner.members[i].backend.addr().to_string())
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

/// One probe task per backend: tick, ping, apply the transition.
async fn monitor(
    pool: Weak<Pool>,
    idx: usize,
    backend: Arc<dyn Backend>,
    shutdown: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + PROBE_INTERVAL, PROBE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let outcome = backend.ping().await;
        let latency = started.elapsed();

        if let Err(err) = &outcome {
            log::debug!("backend {}: probe failed: {}", backend.addr(), err);
        }

        let Some(pool) = pool.upgrade() else { return };
        let needs_fail = {
            let mut inner = pool.inner.write().await;
            inner.apply_probe(idx, &outcome, latency)
        };

        if needs_fail {
            backend.fail();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A backend whose probe outcome is scripted by the test.
    struct Mockend {
        id: String,
        script: Mutex<(BackendState, Option<String>)>,
        ping_delay: Mutex<Duration>,
        failures: AtomicUsize,
    }

    impl Mockend {
        fn new(id: &str, state: BackendState) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                script: Mutex::new((state, None)),
                ping_delay: Mutex::new(Duration::ZERO),
                failures: AtomicUsize::new(0),
            })
        }

        fn erroring(id: &str) -> Arc<Self> {
            let mock = Self::new(id, BackendState::Unavailable);
            mock.set_error(Some("scripted failure"));
            mock
        }

        fn set_state(&self, state: BackendState) {
            self.script.lock().unwrap().0 = state;
        }

        fn set_error(&self, err: Option<&str>) {
            self.script.lock().unwrap().1 = err.map(str::to_string);
        }

        fn set_ping_delay(&self, delay: Duration) {
            *self.ping_delay.lock().unwrap() = delay;
        }

        fn fail_count(&self) -> usize {
            self.failures.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for Mockend {
        async fn ping(&self) -> PorteraResult<BackendState> {
            let delay = *self.ping_delay.lock().unwrap();
            if !delay.is_zero() {
                sleep(delay).await;
            }
            let (state, err) = self.script.lock().unwrap().clone();
            match err {
                Some(msg) => Err(PorteraError::Io(std::io::Error::other(msg))),
                None => Ok(state),
            }
        }

        fn addr(&self) -> &str {
            &self.id
        }

        async fn connect(&self, _timeout: Duration) -> PorteraResult<PooledConn> {
            Err(PorteraError::Io(std::io::Error::other(
                "mockend does not dial",
            )))
        }

        fn fail(&self) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn empty_pool_has_nothing_to_offer() {
        let pool = Pool::new();
        assert!(matches!(
            pool.get_for_read().await,
            Err(PorteraError::NoneAvailable)
        ));
        assert!(matches!(
            pool.get_for_write().await,
            Err(PorteraError::NoneAvailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn probes_classify_members_by_role() {
        let pool = Arc::new(Pool::new());
        let a = Mockend::new("a", BackendState::ReadOnly);
        let b = Mockend::new("b", BackendState::ReadWrite);
        let c = Mockend::erroring("c");

        pool.register(a.clone()).await;
        pool.register(b.clone()).await;
        pool.register(c.clone()).await;

        sleep(Duration::from_millis(1100)).await;

        let reader = pool.get_for_read().await.unwrap();
        assert_ne!(reader.addr(), "c");
        assert!(reader.addr() == "a" || reader.addr() == "b");

        let writer = pool.get_for_write().await.unwrap();
        assert_eq!(writer.addr(), "b");

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_primary_fails_its_connections() {
        let pool = Arc::new(Pool::new());
        let a = Mockend::new("a", BackendState::ReadWrite);
        pool.register(a.clone()).await;

        // Let one probe succeed so the member becomes the primary.
        sleep(Duration::from_millis(1001)).await;
        assert_eq!(pool.primary_addr().await.as_deref(), Some("a"));

        a.set_error(Some("kill"));
        sleep(Duration::from_millis(1001)).await;

        assert_eq!(a.fail_count(), 1);
        assert!(pool.available_addrs().await.is_empty());
        assert_eq!(pool.primary_addr().await, None);

        // Staying down must not fail the connections again.
        sleep(Duration::from_millis(1001)).await;
        assert_eq!(a.fail_count(), 1);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn demotion_to_follower_clears_the_primary() {
        let pool = Arc::new(Pool::new());
        let a = Mockend::new("a", BackendState::ReadWrite);
        pool.register(a.clone()).await;

        sleep(Duration::from_millis(1001)).await;
        assert_eq!(pool.primary_addr().await.as_deref(), Some("a"));

        a.set_state(BackendState::ReadOnly);
        sleep(Duration::from_millis(1001)).await;

        assert_eq!(a.fail_count(), 1);
        assert_eq!(pool.primary_addr().await, None);
        // The demoted member still serves reads.
        assert_eq!(pool.available_addrs().await, vec!["a".to_string()]);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn promotion_to_primary_moves_the_pointer() {
        let pool = Arc::new(Pool::new());
        let a = Mockend::new("a", BackendState::ReadOnly);
        pool.register(a.clone()).await;

        sleep(Duration::from_millis(1001)).await;
        assert_eq!(pool.primary_addr().await, None);

        a.set_state(BackendState::ReadWrite);
        sleep(Duration::from_millis(1001)).await;

        assert_eq!(pool.primary_addr().await.as_deref(), Some("a"));
        assert_eq!(a.fail_count(), 0);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn availability_view_is_ordered_by_latency() {
        let pool = Arc::new(Pool::new());
        let slow = Mockend::new("slow", BackendState::ReadOnly);
        let fast = Mockend::new("fast", BackendState::ReadOnly);
        slow.set_ping_delay(Duration::from_millis(30));
        fast.set_ping_delay(Duration::from_millis(10));

        pool.register(slow.clone()).await;
        pool.register(fast.clone()).await;

        sleep(Duration::from_millis(1200)).await;
        assert_eq!(
            pool.available_addrs().await,
            vec!["fast".to_string(), "slow".to_string()]
        );
        assert_eq!(pool.get_for_read().await.unwrap().addr(), "fast");

        // The ordering follows the latest measurements.
        slow.set_ping_delay(Duration::from_millis(5));
        fast.set_ping_delay(Duration::from_millis(40));
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(pool.get_for_read().await.unwrap().addr(), "slow");

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn dialing_with_no_candidates_fails_fast() {
        let pool = Pool::new();
        assert!(matches!(
            pool.dial_for_read().await,
            Err(PorteraError::NoneAvailable)
        ));
        assert!(matches!(
            pool.dial_for_write().await,
            Err(PorteraError::NoneAvailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dial_retries_with_backoff_until_the_deadline() {
        let pool = Arc::new(Pool::new());
        let a = Mockend::new("a", BackendState::ReadOnly);
        pool.register(a.clone()).await;
        sleep(Duration::from_millis(1001)).await;

        // The mock refuses every dial, so the backoff loop must run the
        // full wall-clock budget before giving up.
        let started = Instant::now();
        assert!(pool.dial_for_read().await.is_err());
        assert!(started.elapsed() >= DIAL_DEADLINE);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_probes() {
        let pool = Arc::new(Pool::new());
        let a = Mockend::new("a", BackendState::ReadOnly);
        pool.register(a.clone()).await;

        sleep(Duration::from_millis(1001)).await;
        pool.shutdown().await;

        a.set_error(Some("down"));
        sleep(Duration::from_millis(2000)).await;
        // No probe ran after shutdown, so the failure was never observed.
        assert_eq!(a.fail_count(), 0);
        assert_eq!(pool.available_addrs().await, vec!["a".to_string()]);
    }
}
