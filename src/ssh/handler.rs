//! SSH client handler implementation
//!
//! Implements the `russh::client::Handler` trait to handle SSH connection
//! events for bastion transports.

/// SSH client handler for russh
///
/// This handler is used by russh to process SSH events such as server key
/// verification. It accepts every server key: bastion descriptors carry no
/// trust policy, and callers wanting host-key pinning are expected to swap
/// this type out — it is the single place that decision lives.
#[derive(Debug, Clone)]
pub struct ClientHandler;

impl ClientHandler {
    /// Create a new SSH client handler
    pub fn new() -> Self {
        Self
    }
}

impl Default for ClientHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Verify the server's host key
    ///
    /// # Security Note
    /// Accepts all server keys. Stronger trust (known_hosts checks,
    /// fingerprint pinning) belongs in a replacement handler.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
