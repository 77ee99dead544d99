//! Shared fixtures for integration tests
//!
//! Hosts a minimal in-process SSH server so the pool, tunnel and exec paths
//! can be exercised end-to-end without a real bastion. The server accepts
//! any password, answers a tiny set of exec commands, and forwards
//! direct-tcpip channels to loopback targets.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::OsRng;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// An in-process SSH server bound to a loopback port
pub struct TestServer {
    addr: SocketAddr,
    auth_attempts: Arc<AtomicUsize>,
    sessions: Arc<Mutex<Vec<JoinHandle<()>>>>,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Start a server; it runs until [`stop`](Self::stop) or drop
    pub async fn start() -> Self {
        let key = russh::keys::PrivateKey::random(&mut OsRng, russh::keys::Algorithm::Ed25519)
            .expect("generate host key");

        let config = Arc::new(server::Config {
            keys: vec![key],
            ..Default::default()
        });

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("test server addr");

        let auth_attempts = Arc::new(AtomicUsize::new(0));
        let sessions: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let accept_task = {
            let auth_attempts = Arc::clone(&auth_attempts);
            let sessions = Arc::clone(&sessions);
            let cancel = cancel.clone();

            tokio::spawn(async move {
                loop {
                    let socket = tokio::select! {
                        _ = cancel.cancelled() => return,
                        accepted = listener.accept() => match accepted {
                            Ok((socket, _)) => socket,
                            Err(_) => continue,
                        },
                    };

                    let handler = TestHandler {
                        auth_attempts: Arc::clone(&auth_attempts),
                    };

                    let config = Arc::clone(&config);
                    let driver = tokio::spawn(async move {
                        if let Ok(session) = server::run_stream(config, socket, handler).await {
                            let _ = session.await;
                        }
                    });
                    sessions.lock().unwrap().push(driver);
                }
            })
        };

        Self {
            addr,
            auth_attempts,
            sessions,
            cancel,
            accept_task: Some(accept_task),
        }
    }

    /// `bastion://` descriptor reaching this server with password auth
    pub fn descriptor(&self) -> String {
        format!("bastion://tester:secret@{}", self.addr)
    }

    /// Number of authentication attempts the server has seen; one per
    /// established transport
    pub fn auth_attempts(&self) -> usize {
        self.auth_attempts.load(Ordering::SeqCst)
    }

    /// Stop accepting and kill every live connection
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for driver in self.sessions.lock().unwrap().drain(..) {
            driver.abort();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TestHandler {
    auth_attempts: Arc<AtomicUsize>,
}

impl server::Handler for TestHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, _user: &str, _password: &str) -> Result<Auth, Self::Error> {
        self.auth_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        let handle = session.handle();

        tokio::spawn(async move {
            match command.as_str() {
                // Never answers; exercises cancellation.
                "hang" => return,
                "false" => {
                    let _ = handle.exit_status_request(channel, 1).await;
                }
                cmd if cmd.starts_with("echo ") => {
                    let line = format!("{}\n", &cmd[5..]);
                    let _ = handle
                        .data(channel, CryptoVec::from_slice(line.as_bytes()))
                        .await;
                    let _ = handle.exit_status_request(channel, 0).await;
                }
                "stderr" => {
                    let _ = handle
                        .extended_data(channel, 1, CryptoVec::from_slice(b"boom\n"))
                        .await;
                    let _ = handle.exit_status_request(channel, 1).await;
                }
                other => {
                    let line = format!("unknown command: {other}\n");
                    let _ = handle
                        .extended_data(channel, 1, CryptoVec::from_slice(line.as_bytes()))
                        .await;
                    let _ = handle.exit_status_request(channel, 127).await;
                }
            }

            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });

        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let target = format!("{host_to_connect}:{port_to_connect}");

        // Confirm the channel only when the target is reachable; a refused
        // connect surfaces as a channel-open failure on the client side.
        match TcpStream::connect(&target).await {
            Ok(mut tcp) => {
                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut tcp).await;
                });
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

/// Plain TCP echo server; the tunnel's forwarding target
pub struct EchoServer {
    pub addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind echo server");
        let addr = listener.local_addr().expect("echo server addr");

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });

        Self { addr, accept_task }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Initialize test logging once; safe to call from every test
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
