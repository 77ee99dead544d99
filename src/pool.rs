//! Transport pool
//!
//! Process-wide registry of bastion transports, keyed by descriptor string.
//! The pool lazily establishes one shared transport per descriptor, lends it
//! to tunnels and exec sessions, and reaps instances that go idle or
//! unhealthy. Construct one pool at startup and inject it into callers;
//! there is deliberately no hidden global, so tests run isolated pools.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{BastionError, Result};
use crate::exec::ExecSession;
use crate::resolver::TargetResolver;
use crate::ssh::PooledTransport;
use crate::tunnel::TunnelEndpoint;

/// How long a waiter sleeps between checks while another caller's dial for
/// the same descriptor is in flight
const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tunable intervals and timeouts for a transport pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Interval between keepalive probes on each live transport
    pub keepalive_interval: Duration,
    /// How long an unborrowed transport may sit idle before the reaper
    /// closes it
    pub idle_timeout: Duration,
    /// Interval between reaper passes
    pub reap_interval: Duration,
    /// Timeout for establishing and authenticating a transport
    pub connect_timeout: Duration,
    /// Timeout for dialing one forwarded connection's channel
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Create a pool configuration with the default intervals
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the keepalive probe interval
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the reaper pass interval
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Set the transport establishment timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-forwarded-connection dial timeout
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

/// Registry slot for one descriptor
enum Slot {
    /// An established transport
    Ready(Arc<PooledTransport>),
    /// A dial is in flight; waiters poll until the slot resolves
    Pending,
}

/// Pool of shared bastion transports
///
/// The registry map is the subsystem's only shared mutable structure; all
/// insert/remove goes through its lock, while per-transport health and
/// borrower counts live under each transport's own lock so the reaper can
/// run concurrently with `borrow`/release.
pub struct TransportPool {
    config: PoolConfig,
    resolver: TargetResolver,
    transports: RwLock<HashMap<String, Slot>>,
    /// Unhealthy transports displaced from the registry while still
    /// borrowed; closed by the reaper once their last borrower is gone
    doomed: Mutex<Vec<Arc<PooledTransport>>>,
    /// Stops the reaper task
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl TransportPool {
    /// Create a pool with default configuration and the conventional
    /// per-user resolver
    pub fn new() -> Arc<Self> {
        Self::with_config(TargetResolver::new(), PoolConfig::default())
    }

    /// Create a pool with an explicit resolver and configuration
    pub fn with_config(resolver: TargetResolver, config: PoolConfig) -> Arc<Self> {
        debug!(
            keepalive_interval = ?config.keepalive_interval,
            idle_timeout = ?config.idle_timeout,
            reap_interval = ?config.reap_interval,
            "creating transport pool"
        );

        let pool = Arc::new(Self {
            config,
            resolver,
            transports: RwLock::new(HashMap::new()),
            doomed: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        spawn_reaper(&pool);
        pool
    }

    /// Borrow the shared transport for a descriptor, establishing it if
    /// none exists
    ///
    /// Concurrent first-time borrows for the same descriptor coalesce into a
    /// single authentication+dial; borrows for different descriptors never
    /// block each other, because the dial runs outside the registry lock.
    /// Establishment failures are returned as `ConnectFailed` and nothing is
    /// stored — the pool never retries on the caller's behalf.
    pub async fn borrow(&self, descriptor: &str) -> Result<TransportLease> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BastionError::connect("transport pool is shut down"));
            }

            // Fast path: a healthy transport under a shared lock.
            {
                let transports = self.transports.read().await;
                if let Some(Slot::Ready(transport)) = transports.get(descriptor) {
                    if transport.is_healthy() {
                        transport.acquire();
                        return Ok(TransportLease::new(Arc::clone(transport)));
                    }
                }
            }

            // Slow path: decide under the exclusive lock whether to dial or
            // to wait behind somebody else's in-flight dial.
            enum Decision {
                Reuse(Arc<PooledTransport>),
                Wait,
                Dial,
            }

            let decision = {
                let mut transports = self.transports.write().await;
                let decision = match transports.get(descriptor) {
                    // Another caller finished establishing between locks.
                    Some(Slot::Ready(transport)) if transport.is_healthy() => {
                        Decision::Reuse(Arc::clone(transport))
                    }
                    Some(Slot::Pending) => Decision::Wait,
                    _ => Decision::Dial,
                };

                if matches!(decision, Decision::Dial) {
                    if let Some(Slot::Ready(old)) =
                        transports.insert(descriptor.to_string(), Slot::Pending)
                    {
                        // An unhealthy instance is displaced, never revived;
                        // its remaining borrowers run to completion before
                        // the reaper closes it.
                        self.park_doomed(old);
                    }
                }
                decision
            };

            match decision {
                Decision::Reuse(transport) => {
                    transport.acquire();
                    return Ok(TransportLease::new(transport));
                }
                Decision::Dial => return self.dial(descriptor).await,
                Decision::Wait => tokio::time::sleep(PENDING_POLL_INTERVAL).await,
            }
        }
    }

    /// Resolve, establish and register a transport; the `Pending` marker for
    /// the descriptor is owned by this call
    async fn dial(&self, descriptor: &str) -> Result<TransportLease> {
        let result = match self.resolver.resolve(descriptor) {
            Ok(profile) => {
                PooledTransport::establish(
                    descriptor,
                    profile,
                    self.config.connect_timeout,
                    self.config.keepalive_interval,
                )
                .await
            }
            Err(e) => Err(e),
        };

        let mut transports = self.transports.write().await;
        match result {
            Ok(transport) => {
                if self.closed.load(Ordering::SeqCst) {
                    transports.remove(descriptor);
                    drop(transports);
                    transport.close().await;
                    return Err(BastionError::connect("transport pool is shut down"));
                }
                transport.acquire();
                transports.insert(descriptor.to_string(), Slot::Ready(Arc::clone(&transport)));
                Ok(TransportLease::new(transport))
            }
            Err(e) => {
                // Nothing is stored on failure; a waiter observing the empty
                // slot starts (at most) one attempt of its own.
                transports.remove(descriptor);
                warn!(descriptor, error = %e, "bastion transport establishment failed");
                Err(e)
            }
        }
    }

    /// Open a TCP tunnel through the shared transport for a descriptor
    ///
    /// Returns an endpoint listening on an OS-assigned loopback port;
    /// closing the endpoint releases (never closes) the transport. Any
    /// failure after borrowing releases before the error returns.
    pub async fn open_tunnel(
        &self,
        descriptor: &str,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelEndpoint> {
        let lease = self.borrow(descriptor).await?;
        TunnelEndpoint::open(lease, remote_host, remote_port, self.config.dial_timeout).await
    }

    /// Open an exec session on the shared transport for a descriptor
    pub async fn open_exec(&self, descriptor: &str) -> Result<ExecSession> {
        let lease = self.borrow(descriptor).await?;
        Ok(ExecSession::new(lease))
    }

    /// Run one remote command on the bastion and return its combined output
    ///
    /// Convenience over [`open_exec`](Self::open_exec): the session is
    /// released on every exit path. Cancellation returns `Cancelled` with
    /// whatever output was captured.
    pub async fn run_remote_command(
        &self,
        descriptor: &str,
        command: &str,
        cancel: CancellationToken,
    ) -> Result<String> {
        let session = self.open_exec(descriptor).await?;
        session.run(command, cancel).await
    }

    /// Number of transports currently registered
    pub async fn len(&self) -> usize {
        let transports = self.transports.read().await;
        transports
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    /// Whether the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// One reaper pass: close doomed transports whose borrowers are gone,
    /// then evict unhealthy or idle-and-unborrowed registry entries
    async fn reap(&self) {
        let mut to_close: Vec<Arc<PooledTransport>> = {
            let mut doomed = self.doomed.lock().expect("doomed list poisoned");
            let mut still_borrowed = Vec::new();
            let mut ready = Vec::new();
            for transport in doomed.drain(..) {
                if transport.ref_count() == 0 {
                    ready.push(transport);
                } else {
                    still_borrowed.push(transport);
                }
            }
            *doomed = still_borrowed;
            ready
        };

        {
            let mut transports = self.transports.write().await;
            transports.retain(|descriptor, slot| {
                let Slot::Ready(transport) = slot else {
                    // A dial in flight is never reaped.
                    return true;
                };

                if !transport.is_healthy() {
                    if transport.ref_count() == 0 {
                        debug!(descriptor = %descriptor, "reaping unhealthy transport");
                        to_close.push(Arc::clone(transport));
                    } else {
                        debug!(descriptor = %descriptor, "parking unhealthy transport until released");
                        self.park_doomed(Arc::clone(transport));
                    }
                    return false;
                }

                if transport.ref_count() == 0 && transport.idle_for() > self.config.idle_timeout {
                    debug!(descriptor = %descriptor, "reaping idle transport");
                    to_close.push(Arc::clone(transport));
                    return false;
                }

                true
            });
        }

        for transport in to_close {
            transport.close().await;
        }
    }

    /// Move an unhealthy-but-borrowed transport aside for deferred close
    fn park_doomed(&self, transport: Arc<PooledTransport>) {
        self.doomed
            .lock()
            .expect("doomed list poisoned")
            .push(transport);
    }

    /// Drain the registry and close every transport regardless of borrower
    /// count; for process exit only
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        info!("shutting down transport pool");
        self.cancel.cancel();

        let drained: Vec<Arc<PooledTransport>> = {
            let mut transports = self.transports.write().await;
            transports
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Ready(transport) => Some(transport),
                    Slot::Pending => None,
                })
                .collect()
        };

        let doomed: Vec<Arc<PooledTransport>> = {
            let mut doomed = self.doomed.lock().expect("doomed list poisoned");
            doomed.drain(..).collect()
        };

        for transport in drained.into_iter().chain(doomed) {
            transport.close().await;
        }
    }
}

impl std::fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPool")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// RAII guard for one borrow of a pooled transport
///
/// Dropping (or explicitly releasing) the lease decrements the borrower
/// count on the exact transport instance it was minted from and refreshes
/// its idle clock. This guarantees release on every exit path and keeps the
/// count exact even after the registry has replaced the instance.
pub struct TransportLease {
    transport: Arc<PooledTransport>,
    released: AtomicBool,
}

impl TransportLease {
    fn new(transport: Arc<PooledTransport>) -> Self {
        Self {
            transport,
            released: AtomicBool::new(false),
        }
    }

    /// The borrowed transport
    pub fn transport(&self) -> &Arc<PooledTransport> {
        &self.transport
    }

    /// Release the borrow; dropping the lease does the same
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.transport.release();
        }
    }
}

impl Drop for TransportLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for TransportLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLease")
            .field("descriptor", &self.transport.descriptor())
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Start the reaper task for a freshly-created pool
///
/// Holds only a `Weak` reference so a dropped pool does not stay alive
/// through its own maintenance task. Termination contract: exits on
/// cancellation (shutdown) or when the pool has been dropped.
fn spawn_reaper(pool: &Arc<TransportPool>) {
    let weak: Weak<TransportPool> = Arc::downgrade(pool);
    let cancel = pool.cancel.clone();
    let interval = pool.config.reap_interval;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; a fresh pool has nothing to reap.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reaper task stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let Some(pool) = weak.upgrade() else {
                return;
            };
            pool.reap().await;
        }
    });
}
