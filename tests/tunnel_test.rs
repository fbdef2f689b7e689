//! End-to-end tests for the tunnel over loopback sockets

use std::net::SocketAddr;
use std::sync::Arc;

use porttunnel::config::{Config, Endpoint};
use porttunnel::{Acceptor, SessionRegistry, SessionState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};

struct TestTunnel {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<porttunnel::Result<()>>,
}

async fn start_tunnel(target: SocketAddr) -> TestTunnel {
    let mut config = Config::default();
    config.listen = Endpoint::new("127.0.0.1", 0);
    config.target = Endpoint::new(target.ip().to_string(), target.port());
    config.relay.buffer_size = 4096;

    let acceptor = Acceptor::bind(Arc::new(config)).await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    let registry = acceptor.registry();
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move { acceptor.run(shutdown_rx).await });

    TestTunnel {
        addr,
        registry,
        shutdown_tx,
        handle,
    }
}

/// Echo every byte back until the peer closes
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// An address nothing listens on
async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn wait_for_sessions(registry: &SessionRegistry, count: usize) {
    timeout(Duration::from_secs(2), async {
        while registry.active_count() != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session count did not settle");
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_ping_through_echo_server() {
    let echo = spawn_echo_server().await;
    let tunnel = start_tunnel(echo).await;

    let mut client = TcpStream::connect(tunnel.addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    drop(client);
    assert!(tunnel.registry.wait_idle(Duration::from_secs(2)).await);

    tunnel.shutdown_tx.send(()).unwrap();
    assert!(tunnel.handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_client_close_closes_target_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    let (eof_tx, eof_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    received.extend_from_slice(&buf[..n]);
                    stream.write_all(&buf[..n]).await.unwrap();
                }
            }
        }
        let _ = eof_tx.send(received);
    });

    let tunnel = start_tunnel(target).await;
    let mut client = TcpStream::connect(tunnel.addr).await.unwrap();
    client.write_all(b"ping").await.unwrap();

    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    wait_for_sessions(&tunnel.registry, 1).await;
    drop(client);

    let received = timeout(Duration::from_secs(2), eof_rx)
        .await
        .expect("target connection was not closed")
        .unwrap();
    assert_eq!(received, b"ping");
    assert!(tunnel.registry.wait_idle(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_large_transfer_is_lossless() {
    let echo = spawn_echo_server().await;
    let tunnel = start_tunnel(echo).await;

    let payload = pattern(7, 1024 * 1024 + 123);
    let expected = payload.clone();

    let client = TcpStream::connect(tunnel.addr).await.unwrap();
    let (mut reader, mut writer) = client.into_split();

    let send = tokio::spawn(async move {
        for chunk in payload.chunks(10_000) {
            writer.write_all(chunk).await.unwrap();
        }
        writer
    });

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(10), reader.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    let _writer = send.await.unwrap();

    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_target_to_client_direction() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    let greeting = pattern(3, 50_000);
    let expected = greeting.clone();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_all(&greeting).await.unwrap();
        // hold the connection open so the client reads everything
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf).await;
    });

    let tunnel = start_tunnel(target).await;
    let mut client = TcpStream::connect(tunnel.addr).await.unwrap();

    let mut received = vec![0u8; expected.len()];
    timeout(Duration::from_secs(5), client.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, expected);

    let sessions = tunnel.registry.snapshot();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Relaying);
    assert_eq!(sessions[0].target_addr, Some(target));
    assert_eq!(sessions[0].bytes_up, 0);

    // the counter is bumped once the final chunk's write completes
    let registry = Arc::clone(&tunnel.registry);
    timeout(Duration::from_secs(2), async move {
        while registry.snapshot()[0].bytes_down != expected.len() as u64 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("bytes_down should match what the client received");
}

#[tokio::test]
async fn test_concurrent_sessions_do_not_intermix() {
    let echo = spawn_echo_server().await;
    let tunnel = start_tunnel(echo).await;

    let mut handles = Vec::new();
    for seed in 0..2u8 {
        let addr = tunnel.addr;
        handles.push(tokio::spawn(async move {
            let payload = pattern(seed.wrapping_mul(101).wrapping_add(1), 200_000);
            let client = TcpStream::connect(addr).await.unwrap();
            let (mut reader, mut writer) = client.into_split();

            let to_send = payload.clone();
            let send = tokio::spawn(async move {
                for chunk in to_send.chunks(1500) {
                    writer.write_all(chunk).await.unwrap();
                    tokio::task::yield_now().await;
                }
                writer
            });

            let mut received = vec![0u8; payload.len()];
            reader.read_exact(&mut received).await.unwrap();
            let _writer = send.await.unwrap();
            received == payload
        }));
    }

    for handle in handles {
        let ok = timeout(Duration::from_secs(10), handle).await.unwrap().unwrap();
        assert!(ok, "a session received bytes that were not its own");
    }
}

#[tokio::test]
async fn test_connect_failure_closes_client_and_keeps_accepting() {
    let tunnel = start_tunnel(refused_addr().await).await;

    for _ in 0..2 {
        let mut client = TcpStream::connect(tunnel.addr).await.unwrap();
        let mut buf = [0u8; 16];
        let read = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("client should be closed after a failed connect");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    assert!(tunnel.registry.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(tunnel.registry.total_accepted(), 2);
    assert!(!tunnel.handle.is_finished());
}

#[tokio::test]
async fn test_closing_session_twice_is_harmless() {
    let echo = spawn_echo_server().await;
    let tunnel = start_tunnel(echo).await;

    let mut client = TcpStream::connect(tunnel.addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();

    wait_for_sessions(&tunnel.registry, 1).await;

    // only the first close takes effect
    assert_eq!(tunnel.registry.close_all(), 1);
    assert_eq!(tunnel.registry.close_all(), 0);

    let mut rest = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .expect("client should see the close")
        .ok();
    assert!(rest.is_empty());

    assert!(tunnel.registry.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(tunnel.registry.close_all(), 0);
}

#[tokio::test]
async fn test_shutdown_with_live_sessions() {
    let echo = spawn_echo_server().await;
    let tunnel = start_tunnel(echo).await;

    let mut client = TcpStream::connect(tunnel.addr).await.unwrap();
    client.write_all(b"x").await.unwrap();
    let mut buf = [0u8; 1];
    client.read_exact(&mut buf).await.unwrap();
    wait_for_sessions(&tunnel.registry, 1).await;

    let coordinator = porttunnel::ShutdownCoordinator::new(Duration::from_secs(2));
    tunnel.shutdown_tx.send(()).unwrap();
    assert!(tunnel.handle.await.unwrap().is_ok());

    assert!(coordinator.drain(&tunnel.registry).await);
    assert_eq!(tunnel.registry.active_count(), 0);
}
