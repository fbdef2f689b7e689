//! Acceptor
//!
//! Owns the listening socket and the resolved target. Every accepted
//! connection becomes its own session task; the accept loop never waits on
//! a session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::registry::SessionRegistry;
use crate::config::Config;
use crate::error::{Result, TunnelError};
use crate::relay::Session;

/// Accepts client connections and hands each one to a new session
pub struct Acceptor {
    listener: TcpListener,
    config: Arc<Config>,
    targets: Arc<[SocketAddr]>,
    registry: Arc<SessionRegistry>,
}

impl Acceptor {
    /// Resolve the target and bind the listener.
    ///
    /// Both steps are fatal on failure; neither is retried.
    pub async fn bind(config: Arc<Config>) -> Result<Self> {
        config.validate()?;

        let targets: Arc<[SocketAddr]> = config.target.resolve().await?.into();
        debug!("Target {} resolved to {:?}", config.target, targets);

        let listen_addrs = config.listen.resolve().await?;

        info!("Binding TCP listener to {}", config.listen);
        let listener = TcpListener::bind(&listen_addrs[..])
            .await
            .map_err(|source| TunnelError::Bind {
                addr: config.listen.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            config,
            targets,
            registry: Arc::new(SessionRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(TunnelError::Listener)
    }

    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Main connection acceptance loop.
    ///
    /// Returns `Ok(())` when a shutdown signal arrives and
    /// `Err(TunnelError::Listener)` when the listening socket fails.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            "Forwarding {} -> {} ({:?})",
            self.local_addr()?,
            self.config.target,
            self.targets()
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_session(stream, addr),
                    Err(e) if is_transient_accept_error(&e) => {
                        error!("{}", TunnelError::Accept(e));
                        tokio::time::sleep(self.config.server.accept_backoff).await;
                    }
                    Err(e) => {
                        error!("Listener failed, stopping accept loop: {}", e);
                        return Err(TunnelError::Listener(e));
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break;
                }
            }
        }

        info!("Connection acceptance loop stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, addr: SocketAddr) {
        info!("Accepted connection from {}", addr);

        let session = Session::new(
            stream,
            addr,
            Arc::clone(&self.targets),
            self.config.relay.buffer_size,
        );
        let guard = self.registry.register(session.control());

        tokio::spawn(async move {
            let _guard = guard;
            let report = session.run().await;
            report.log_stats();
        });
    }
}

/// Errors that concern one pending connection or a momentary resource
/// shortage rather than the listening socket itself
fn is_transient_accept_error(e: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        e.kind(),
        ConnectionAborted | ConnectionReset | ConnectionRefused | Interrupted | TimedOut | WouldBlock
    ) {
        return true;
    }

    // EMFILE, ENFILE, ENOMEM
    #[cfg(unix)]
    {
        if matches!(e.raw_os_error(), Some(24) | Some(23) | Some(12)) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;

    fn loopback_config(target_port: u16) -> Config {
        let mut config = Config::default();
        config.listen = Endpoint::new("127.0.0.1", 0);
        config.target = Endpoint::new("127.0.0.1", target_port);
        config
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient_accept_error(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient_accept_error(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_is_transient() {
        assert!(is_transient_accept_error(&io::Error::from_raw_os_error(24)));
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let acceptor = Acceptor::bind(Arc::new(loopback_config(9100))).await.unwrap();
        let addr = acceptor.local_addr().unwrap();

        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        assert_eq!(acceptor.targets(), &["127.0.0.1:9100".parse::<SocketAddr>().unwrap()]);
        assert_eq!(acceptor.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let first = Acceptor::bind(Arc::new(loopback_config(9100))).await.unwrap();
        let taken = first.local_addr().unwrap();

        let mut config = loopback_config(9100);
        config.listen.port = taken.port();
        let err = Acceptor::bind(Arc::new(config)).await.err().unwrap();

        assert!(matches!(err, TunnelError::Bind { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = loopback_config(9100);
        config.relay.buffer_size = 0;
        let err = Acceptor::bind(Arc::new(config)).await.err().unwrap();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let acceptor = Acceptor::bind(Arc::new(loopback_config(9100))).await.unwrap();
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(async move { acceptor.run(rx).await });
        tx.send(()).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
