//! TCP tunneling through a pooled transport
//!
//! A [`TunnelEndpoint`] owns a loopback listener and forwards every locally
//! accepted connection through a fresh logical channel over the shared
//! transport to one `remote_host:remote_port` as seen from the bastion.
//! Forwarded connections are independent: a failed dial or a broken pipe
//! closes that one connection and nothing else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::Channel;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{BastionError, Result};
use crate::pool::TransportLease;
use crate::ssh::PooledTransport;

/// Local TCP endpoint forwarding into a bastion transport
///
/// Created by [`TransportPool::open_tunnel`](crate::pool::TransportPool::open_tunnel).
/// The endpoint exclusively owns its local listener and merely borrows the
/// shared transport; [`close`](Self::close) drains the accept loop and every
/// in-flight forwarder, then releases (never closes) the transport.
pub struct TunnelEndpoint {
    local_addr: SocketAddr,
    remote_host: String,
    remote_port: u16,
    lease: TransportLease,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl TunnelEndpoint {
    /// Bind a loopback listener and start the accept loop
    ///
    /// Returns as soon as the listener is bound, before any byte has been
    /// forwarded. On failure the lease is released before the error
    /// propagates.
    pub(crate) async fn open(
        lease: TransportLease,
        remote_host: &str,
        remote_port: u16,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(lease.transport()),
            remote_host.to_string(),
            remote_port,
            dial_timeout,
            cancel.clone(),
        ));

        debug!(%local_addr, remote_host, remote_port, "tunnel endpoint open");

        Ok(Self {
            local_addr,
            remote_host: remote_host.to_string(),
            remote_port,
            lease,
            cancel,
            accept_task: Some(accept_task),
        })
    }

    /// Local address clients connect to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote target as seen from the bastion
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Stop accepting, tear down in-flight forwarders, wait for every task
    /// to exit, then release the borrowed transport
    pub async fn close(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        self.lease.release();
        debug!(local_addr = %self.local_addr, "tunnel endpoint closed");
    }
}

impl Drop for TunnelEndpoint {
    fn drop(&mut self) {
        // Close without waiting: the tasks observe the token and unwind;
        // the lease's own drop releases the transport.
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for TunnelEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEndpoint")
            .field("local_addr", &self.local_addr)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

/// Accept loop: one per endpoint
///
/// Termination contract: exits when the cancellation token fires, after
/// draining every forwarder it spawned. Accept errors and per-connection
/// dial failures are logged and isolated; they never end the loop.
async fn accept_loop(
    listener: TcpListener,
    transport: Arc<PooledTransport>,
    remote_host: String,
    remote_port: u16,
    dial_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut forwarders = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (local, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "tunnel accept failed");
                        continue;
                    }
                };

                // Dial a fresh logical channel for this connection, bounded
                // both by the dial timeout and by endpoint close.
                let channel = tokio::select! {
                    _ = cancel.cancelled() => break,
                    dialed = dial_channel(&transport, &remote_host, remote_port, peer, dial_timeout) => {
                        match dialed {
                            Ok(channel) => channel,
                            Err(e) => {
                                // This connection only; the tunnel stays up.
                                warn!(%peer, error = %e, "tunnel dial failed, dropping connection");
                                drop(local);
                                continue;
                            }
                        }
                    }
                };

                forwarders.spawn(forward(local, channel, cancel.clone()));
            }
        }
    }

    // Stop accepting before draining so close observes a quiesced endpoint.
    drop(listener);
    while forwarders.join_next().await.is_some() {}
}

/// Open a direct-tcpip channel for one forwarded connection
async fn dial_channel(
    transport: &PooledTransport,
    remote_host: &str,
    remote_port: u16,
    peer: SocketAddr,
    dial_timeout: Duration,
) -> Result<Channel<client::Msg>> {
    match timeout(
        dial_timeout,
        transport.open_direct_tcpip(remote_host, remote_port, peer),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(BastionError::DialTimeout {
            addr: format!("{remote_host}:{remote_port}"),
            timeout_secs: dial_timeout.as_secs(),
        }),
    }
}

/// Copy bytes in both directions until either side finishes
///
/// The two directions run as independent copies joined by first-closer-wins:
/// as soon as one reaches end-of-stream or errors, both ends are torn down.
/// A half-closed pipe is fully closed.
async fn forward(local: TcpStream, channel: Channel<client::Msg>, cancel: CancellationToken) {
    let (mut local_read, mut local_write) = local.into_split();
    let stream = channel.into_stream();
    let (mut remote_read, mut remote_write) = tokio::io::split(stream);

    tokio::select! {
        _ = cancel.cancelled() => {
            debug!("forwarder cancelled");
        }
        outcome = tokio::io::copy(&mut local_read, &mut remote_write) => {
            if let Err(e) = outcome {
                debug!(error = %e, "tunnel upstream copy ended");
            }
        }
        outcome = tokio::io::copy(&mut remote_read, &mut local_write) => {
            if let Err(e) = outcome {
                debug!(error = %e, "tunnel downstream copy ended");
            }
        }
    }
    // Dropping both halves closes the local socket and the channel.
}
