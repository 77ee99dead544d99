//! Pooled SSH transport
//!
//! One [`PooledTransport`] owns one authenticated SSH connection to one
//! bastion host, shared by every tunnel and exec session borrowed for the
//! same descriptor. The transport tracks its health and borrower count and
//! runs a background keepalive task that marks it unhealthy on the first
//! failed probe. `healthy` only ever transitions from `true` to `false`:
//! a dead transport is replaced by a brand-new instance, never revived.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, Disconnect};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handler::ClientHandler;
use crate::error::{BastionError, Result};
use crate::resolver::ConnectionProfile;

/// One authenticated SSH transport to one bastion host
pub struct PooledTransport {
    /// Canonical descriptor this transport was created for
    descriptor: String,

    /// Resolved connection profile
    profile: ConnectionProfile,

    /// Active SSH session handle
    handle: Handle<ClientHandler>,

    /// Health, borrower count and idle bookkeeping
    state: Mutex<TransportState>,

    /// Stops the keepalive task
    cancel: CancellationToken,
}

struct TransportState {
    healthy: bool,
    ref_count: usize,
    last_used: Instant,
    closed: bool,
}

impl PooledTransport {
    /// Establish and authenticate a transport for a resolved profile
    ///
    /// Connects under `connect_timeout`, authenticates with the profile's
    /// single credential, and starts the keepalive task at
    /// `keepalive_interval`. Any failure is returned as `ConnectFailed` and
    /// nothing is left running.
    pub(crate) async fn establish(
        descriptor: &str,
        profile: ConnectionProfile,
        connect_timeout: Duration,
        keepalive_interval: Duration,
    ) -> Result<Arc<Self>> {
        info!(
            descriptor,
            host = %profile.host,
            port = profile.port,
            "establishing bastion transport"
        );

        let ssh_config = Arc::new(client::Config::default());
        let addr = profile.addr();

        let connect_result = timeout(
            connect_timeout,
            client::connect(ssh_config, addr.as_str(), ClientHandler::new()),
        )
        .await;

        let mut session = match connect_result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                return Err(BastionError::connect(format!("{addr}: {e}")));
            }
            Err(_) => {
                return Err(BastionError::connect(format!(
                    "{addr}: connection timeout after {}s",
                    connect_timeout.as_secs()
                )));
            }
        };

        authenticate(&mut session, &profile).await?;

        let transport = Arc::new(Self {
            descriptor: descriptor.to_string(),
            profile,
            handle: session,
            state: Mutex::new(TransportState {
                healthy: true,
                ref_count: 0,
                last_used: Instant::now(),
                closed: false,
            }),
            cancel: CancellationToken::new(),
        });

        spawn_keepalive(&transport, keepalive_interval);

        Ok(transport)
    }

    /// Descriptor this transport serves
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// Resolved profile this transport was established from
    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    /// Whether the transport is still considered usable
    pub fn is_healthy(&self) -> bool {
        self.state.lock().expect("transport state poisoned").healthy
    }

    /// Current number of outstanding borrows
    pub fn ref_count(&self) -> usize {
        self.state.lock().expect("transport state poisoned").ref_count
    }

    /// Mark the transport unusable; one-way, never reset
    ///
    /// Called by the keepalive task on a failed probe. Callers that observe
    /// a failure mid-operation may also report it here so future borrows go
    /// to a fresh transport.
    pub fn mark_unhealthy(&self) {
        let mut state = self.state.lock().expect("transport state poisoned");
        state.healthy = false;
    }

    /// Record a borrow; refreshes the idle clock
    pub(crate) fn acquire(&self) {
        let mut state = self.state.lock().expect("transport state poisoned");
        state.ref_count += 1;
        state.last_used = Instant::now();
    }

    /// Record a release; refreshes the idle clock
    pub(crate) fn release(&self) {
        let mut state = self.state.lock().expect("transport state poisoned");
        state.ref_count = state.ref_count.saturating_sub(1);
        state.last_used = Instant::now();
    }

    /// How long the transport has gone without a borrow or release
    pub(crate) fn idle_for(&self) -> Duration {
        self.state
            .lock()
            .expect("transport state poisoned")
            .last_used
            .elapsed()
    }

    /// Open a session channel for command execution or probing
    pub(crate) async fn open_session_channel(&self) -> Result<Channel<client::Msg>> {
        self.handle
            .channel_open_session()
            .await
            .map_err(|e| BastionError::connect(format!("failed to open channel: {e}")))
    }

    /// Open a direct-tcpip channel to `remote_host:remote_port` as seen from
    /// the bastion
    pub(crate) async fn open_direct_tcpip(
        &self,
        remote_host: &str,
        remote_port: u16,
        originator: std::net::SocketAddr,
    ) -> Result<Channel<client::Msg>> {
        self.handle
            .channel_open_direct_tcpip(
                remote_host,
                u32::from(remote_port),
                &originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await
            .map_err(|e| {
                BastionError::connect(format!(
                    "failed to open channel to {remote_host}:{remote_port}: {e}"
                ))
            })
    }

    /// Liveness probe: open and immediately end a session channel
    async fn probe(&self) -> std::result::Result<(), russh::Error> {
        let channel = self.handle.channel_open_session().await?;
        channel.eof().await?;
        Ok(())
    }

    /// Close the transport: stop the keepalive task and disconnect
    ///
    /// Idempotent; later calls are no-ops. The session handle stays valid
    /// for borrowers that still hold the `Arc`, but every operation on it
    /// will fail once the disconnect goes out.
    pub(crate) async fn close(&self) {
        {
            let mut state = self.state.lock().expect("transport state poisoned");
            if std::mem::replace(&mut state.closed, true) {
                return;
            }
            state.healthy = false;
        }

        self.cancel.cancel();
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "")
            .await;

        debug!(descriptor = %self.descriptor, "bastion transport closed");
    }
}

impl std::fmt::Debug for PooledTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("transport state poisoned");
        f.debug_struct("PooledTransport")
            .field("descriptor", &self.descriptor)
            .field("host", &self.profile.host)
            .field("healthy", &state.healthy)
            .field("ref_count", &state.ref_count)
            .finish()
    }
}

/// Authenticate with the bastion using the profile's credential
async fn authenticate(session: &mut Handle<ClientHandler>, profile: &ConnectionProfile) -> Result<()> {
    if let Some(ref password) = profile.password {
        debug!(user = %profile.user, "attempting password authentication");
        let auth_result = session
            .authenticate_password(&profile.user, password)
            .await
            .map_err(|e| BastionError::connect(e.to_string()))?;

        if auth_result.success() {
            debug!("password authentication successful");
            return Ok(());
        }
        return Err(BastionError::connect("password authentication rejected"));
    }

    if let Some(ref key_path) = profile.key_path {
        debug!(user = %profile.user, key = %key_path.display(), "attempting key authentication");

        let key = russh::keys::load_secret_key(key_path, profile.key_passphrase.as_deref())
            .map_err(|e| {
                BastionError::connect(format!(
                    "failed to load key {}: {e}",
                    key_path.display()
                ))
            })?;

        let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);

        let auth_result = session
            .authenticate_publickey(&profile.user, key_with_alg)
            .await
            .map_err(|e| BastionError::connect(e.to_string()))?;

        if auth_result.success() {
            debug!("key authentication successful");
            return Ok(());
        }
        return Err(BastionError::connect("key authentication rejected"));
    }

    // The resolver guarantees one credential; this is unreachable through
    // the pool but kept as a real error for direct constructors.
    Err(BastionError::connect(
        "no authentication method available (need password or key)",
    ))
}

/// Start the keepalive task for a freshly-established transport
///
/// The task holds only a `Weak` reference: if every strong reference is
/// dropped the task exits on its next tick instead of keeping the transport
/// alive. Termination contract: exits on cancellation, on the transport
/// turning unhealthy or closed, or on the first failed probe (after marking
/// the transport unhealthy).
fn spawn_keepalive(transport: &Arc<PooledTransport>, interval: Duration) {
    let weak: Weak<PooledTransport> = Arc::downgrade(transport);
    let cancel = transport.cancel.clone();
    let descriptor = transport.descriptor.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first interval tick completes immediately; a transport that
        // just authenticated does not need probing yet.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(descriptor = %descriptor, "keepalive task stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let Some(transport) = weak.upgrade() else {
                return;
            };

            if !transport.is_healthy() {
                return;
            }

            if let Err(e) = transport.probe().await {
                warn!(
                    descriptor = %descriptor,
                    error = %e,
                    "keepalive probe failed, marking transport unhealthy"
                );
                transport.mark_unhealthy();
                return;
            }
        }
    });
}
