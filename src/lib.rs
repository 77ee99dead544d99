//! Bastion relay - pooled SSH transports with TCP tunneling and remote exec
//!
//! This crate lets client tools reach TCP services (databases, metrics
//! endpoints, ...) that sit behind an SSH bastion/jump host, and run
//! one-shot remote commands there, while reusing a single authenticated
//! transport per bastion descriptor across many short-lived requests.
//!
//! # Features
//!
//! - `bastion://` descriptor resolution: named references into the user's
//!   SSH-style client configuration file, or fully explicit URIs
//! - One shared, keepalive-checked transport per descriptor, lazily
//!   established and reaped when idle or unhealthy
//! - Local TCP tunnels forwarding each accepted connection over a fresh
//!   logical channel, with per-connection failure isolation
//! - Cancellable one-shot remote command execution with combined output
//!
//! # Example
//!
//! ```no_run
//! use bastion_relay::TransportPool;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> bastion_relay::Result<()> {
//! let pool = TransportPool::new();
//!
//! // Forward a local port to a database reachable from the bastion.
//! let tunnel = pool.open_tunnel("bastion://build-box", "127.0.0.1", 5432).await?;
//! println!("connect to {}", tunnel.local_addr());
//!
//! // Run a one-shot command on the bastion itself.
//! let output = pool
//!     .run_remote_command("bastion://build-box", "uptime", CancellationToken::new())
//!     .await?;
//! println!("{output}");
//!
//! tunnel.close().await;
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! The pool accepts every bastion host key; callers wanting host-key
//! pinning replace [`ssh::ClientHandler`].

pub mod error;
pub mod exec;
pub mod pool;
pub mod resolver;
pub mod ssh;
pub mod tunnel;

// Re-exports for convenience
pub use error::{BastionError, Result};
pub use exec::ExecSession;
pub use pool::{PoolConfig, TransportLease, TransportPool};
pub use resolver::{ConnectionProfile, TargetResolver, BASTION_SCHEME};
pub use ssh::PooledTransport;
pub use tunnel::TunnelEndpoint;
