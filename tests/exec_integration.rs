//! Remote command execution tests against an in-process SSH server

mod common;

use std::sync::Arc;
use std::time::Duration;

use bastion_relay::{BastionError, PoolConfig, TargetResolver, TransportPool};
use common::TestServer;
use tokio_util::sync::CancellationToken;

fn test_pool(config: PoolConfig) -> Arc<TransportPool> {
    TransportPool::with_config(TargetResolver::with_paths("/nonexistent", "/nonexistent"), config)
}

#[tokio::test]
async fn run_returns_command_output() {
    common::init_tracing();
    let server = TestServer::start().await;
    let pool = test_pool(PoolConfig::default());

    let output = pool
        .run_remote_command(&server.descriptor(), "echo hello", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(output, "hello\n");

    pool.shutdown().await;
}

#[tokio::test]
async fn failing_command_maps_to_command_failed() {
    let server = TestServer::start().await;
    let pool = test_pool(PoolConfig::default());

    let err = pool
        .run_remote_command(&server.descriptor(), "false", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BastionError::CommandFailed(_)));

    pool.shutdown().await;
}

#[tokio::test]
async fn failure_detail_carries_captured_output() {
    let server = TestServer::start().await;
    let pool = test_pool(PoolConfig::default());

    let err = pool
        .run_remote_command(&server.descriptor(), "stderr", CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        BastionError::CommandFailed(detail) => assert!(detail.contains("boom")),
        other => panic!("expected CommandFailed, got {other:?}"),
    }

    pool.shutdown().await;
}

#[tokio::test]
async fn cancellation_returns_within_bounded_time() {
    let server = TestServer::start().await;
    let pool = test_pool(PoolConfig::default());
    let cancel = CancellationToken::new();

    let run = {
        let pool = Arc::clone(&pool);
        let descriptor = server.descriptor();
        let cancel = cancel.clone();
        tokio::spawn(async move { pool.run_remote_command(&descriptor, "hang", cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("cancelled exec did not return in time")
        .unwrap();
    assert!(matches!(result, Err(BastionError::Cancelled(_))));

    pool.shutdown().await;
}

#[tokio::test]
async fn exec_sessions_reuse_one_transport() {
    let server = TestServer::start().await;
    let pool = test_pool(PoolConfig::default());
    let descriptor = server.descriptor();

    for i in 0..3 {
        let output = pool
            .run_remote_command(&descriptor, &format!("echo run-{i}"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, format!("run-{i}\n"));
    }

    // Three commands, one authenticated transport.
    assert_eq!(server.auth_attempts(), 1);
    assert_eq!(pool.len().await, 1);

    pool.shutdown().await;
}

#[tokio::test]
async fn exec_session_release_is_exact() {
    let server = TestServer::start().await;
    let pool = test_pool(PoolConfig::default());
    let descriptor = server.descriptor();

    // Pin the transport so ref counts are observable after the run.
    let pin = pool.borrow(&descriptor).await.unwrap();
    assert_eq!(pin.transport().ref_count(), 1);

    let session = pool.open_exec(&descriptor).await.unwrap();
    assert_eq!(pin.transport().ref_count(), 2);

    let output = session.run("echo done", CancellationToken::new()).await.unwrap();
    assert_eq!(output, "done\n");
    assert_eq!(pin.transport().ref_count(), 1);

    // Closing without running releases too.
    let session = pool.open_exec(&descriptor).await.unwrap();
    assert_eq!(pin.transport().ref_count(), 2);
    session.close();
    assert_eq!(pin.transport().ref_count(), 1);

    pool.shutdown().await;
}
