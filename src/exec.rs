//! Remote command execution over a pooled transport
//!
//! An [`ExecSession`] runs exactly one command on the bastion host over a
//! fresh session channel, streaming back combined stdout/stderr. It honors
//! cancellation with a best-effort kill of the remote process and is
//! consumed by the run, which makes one-command-per-session a compile-time
//! property.

use russh::{ChannelMsg, Sig};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{BastionError, Result};
use crate::pool::TransportLease;

/// Output from a remote command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,

    /// Standard error from the command
    pub stderr: String,

    /// Exit code of the command (if reported)
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    /// Create a new empty CommandOutput
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the command succeeded (exit code 0 or no exit code reported)
    pub fn success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }

    /// Get combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// One remote command invocation on a borrowed transport
///
/// Created by [`TransportPool::open_exec`](crate::pool::TransportPool::open_exec).
/// Running (or closing) the session releases the transport; the transport
/// itself is never closed from here.
pub struct ExecSession {
    lease: TransportLease,
}

impl ExecSession {
    pub(crate) fn new(lease: TransportLease) -> Self {
        Self { lease }
    }

    /// Run the command and collect its combined output
    ///
    /// Blocks until the remote command completes or `cancel` fires. On
    /// cancellation a kill signal is sent to the remote process best-effort
    /// and `Cancelled` is returned carrying the output captured so far. A
    /// nonzero exit maps to `CommandFailed` carrying the output as detail.
    pub async fn run(self, command: &str, cancel: CancellationToken) -> Result<String> {
        debug!(command, "executing remote command");

        let mut channel = self.lease.transport().open_session_channel().await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| BastionError::connect(format!("failed to exec command: {e}")))?;

        let mut output = CommandOutput::new();

        loop {
            // The wait future is dropped once the select resolves, freeing
            // the channel for the kill signal on the cancellation path.
            let event = tokio::select! {
                _ = cancel.cancelled() => None,
                msg = channel.wait() => Some(msg),
            };

            let Some(msg) = event else {
                debug!("remote command cancelled, sending kill");
                let _ = channel.signal(Sig::KILL).await;
                return Err(BastionError::Cancelled(output.combined_output()));
            };

            match msg {
                Some(ChannelMsg::Data { data }) => {
                    output.stdout.push_str(&String::from_utf8_lossy(&data));
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext == 1 is stderr
                    if ext == 1 {
                        output.stderr.push_str(&String::from_utf8_lossy(&data));
                    } else {
                        output.stdout.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    output.exit_code = Some(exit_status);
                }
                // Exit status can arrive after EOF; only a closed channel
                // ends collection.
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => break,
                _ => {}
            }
        }

        debug!(
            exit_code = ?output.exit_code,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "remote command completed"
        );

        if output.success() {
            Ok(output.combined_output())
        } else {
            let detail = output.combined_output();
            if detail.is_empty() {
                Err(BastionError::CommandFailed(format!(
                    "exit code {}",
                    output.exit_code.unwrap_or_default()
                )))
            } else {
                Err(BastionError::CommandFailed(detail))
            }
        }
    }

    /// Release the borrowed transport without running a command
    ///
    /// Never closes the transport itself; dropping the session does the
    /// same.
    pub fn close(self) {
        self.lease.release();
    }
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession")
            .field("descriptor", &self.lease.transport().descriptor())
            .finish()
    }
}
