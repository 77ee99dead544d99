//! SSH transport layer
//!
//! This module owns the authenticated russh transports the pool lends out:
//! establishing and authenticating a connection for a resolved profile,
//! keeping it alive in the background, and tracking its health and borrower
//! count.

pub mod handler;
pub mod transport;

// Re-exports
pub use handler::ClientHandler;
pub use transport::PooledTransport;
