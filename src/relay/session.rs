//! Relay Session
//!
//! A session pairs one accepted client connection with one outbound
//! connection to the target and runs both relay directions until either
//! side finishes. The task running [`Session::run`] owns both sockets; the
//! shared [`SessionControl`] is what the rest of the process sees.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::pipe::{relay_chunks, Direction, RelayEnd};
use crate::error::TunnelError;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Relaying = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Relaying,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// State shared between a running session and its observers
#[derive(Debug)]
pub struct SessionControl {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub start_time: Instant,
    target_addr: OnceLock<SocketAddr>,
    state: AtomicU8,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
    close_tx: watch::Sender<bool>,
}

impl SessionControl {
    pub fn new(client_addr: SocketAddr) -> Self {
        let (close_tx, _) = watch::channel(false);
        Self {
            session_id: Uuid::new_v4().to_string(),
            client_addr,
            start_time: Instant::now(),
            target_addr: OnceLock::new(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            close_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Target address once the outbound connect has succeeded
    pub fn target_addr(&self) -> Option<SocketAddr> {
        self.target_addr.get().copied()
    }

    /// Bytes forwarded client -> server
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes forwarded server -> client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Move the session into `Closing` and wake every pending relay.
    ///
    /// Returns `true` only for the call that actually performed the
    /// transition; any later call is a no-op.
    pub fn close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        info!(session_id = %self.session_id, client_addr = %self.client_addr, "Closing session");
        self.close_tx.send_replace(true);
        true
    }

    /// Resolves once [`close`](Self::close) has been called
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn begin_relaying(&self, target_addr: SocketAddr) -> bool {
        let _ = self.target_addr.set(target_addr);
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Relaying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn finish(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
        // wake anyone still waiting on a session that never reached Closing
        self.close_tx.send_replace(true);
    }
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Both directions ran and the session was torn down
    Completed {
        client_to_server: RelayEnd,
        server_to_client: RelayEnd,
    },
    /// The target could not be reached; nothing was relayed
    ConnectFailed(TunnelError),
    /// The session was closed before the target connection was up
    Aborted,
}

/// Final report for a session that reached `Closed`
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub client_addr: SocketAddr,
    pub target_addr: Option<SocketAddr>,
    pub state: SessionState,
    pub duration: Duration,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub outcome: SessionOutcome,
}

impl SessionReport {
    fn from_control(control: &SessionControl, outcome: SessionOutcome) -> Self {
        Self {
            session_id: control.session_id.clone(),
            client_addr: control.client_addr,
            target_addr: control.target_addr(),
            state: control.state(),
            duration: control.duration(),
            bytes_up: control.bytes_up(),
            bytes_down: control.bytes_down(),
            outcome,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        let target = self
            .target_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "-".to_string());

        info!(
            session_id = %self.session_id,
            client_addr = %self.client_addr,
            target_addr = %target,
            duration_ms = self.duration.as_millis() as u64,
            bytes_up = self.bytes_up,
            bytes_down = self.bytes_down,
            total_bytes = self.total_bytes(),
            "Session closed"
        );
    }
}

/// One client connection waiting to be tunneled to the target
pub struct Session {
    control: Arc<SessionControl>,
    client: TcpStream,
    targets: Arc<[SocketAddr]>,
    buffer_size: usize,
}

impl Session {
    pub fn new(
        client: TcpStream,
        client_addr: SocketAddr,
        targets: Arc<[SocketAddr]>,
        buffer_size: usize,
    ) -> Self {
        let control = Arc::new(SessionControl::new(client_addr));
        debug!(session_id = %control.session_id, "Creating session for {}", client_addr);

        Self {
            control,
            client,
            targets,
            buffer_size,
        }
    }

    pub fn control(&self) -> Arc<SessionControl> {
        Arc::clone(&self.control)
    }

    /// Drive the session from `Connecting` to `Closed`
    #[instrument(skip(self), fields(session_id = %self.control.session_id, client_addr = %self.control.client_addr))]
    pub async fn run(self) -> SessionReport {
        let Session {
            control,
            mut client,
            targets,
            buffer_size,
        } = self;

        info!("Connecting session to target {:?}", targets);

        let connected = tokio::select! {
            biased;
            _ = control.closed() => None,
            result = connect_to_target(&targets) => Some(result),
        };

        let (mut server, target_addr) = match connected {
            Some(Ok(conn)) => conn,
            Some(Err(e)) => {
                warn!("Connect error: {}", e);
                drop(client);
                control.finish();
                return SessionReport::from_control(&control, SessionOutcome::ConnectFailed(e));
            }
            None => {
                debug!("Session closed while connecting");
                drop(client);
                control.finish();
                return SessionReport::from_control(&control, SessionOutcome::Aborted);
            }
        };

        if !control.begin_relaying(target_addr) {
            debug!("Session closed before relaying started");
            drop(server);
            drop(client);
            control.finish();
            return SessionReport::from_control(&control, SessionOutcome::Aborted);
        }

        info!("Session relaying {} <-> {}", control.client_addr, target_addr);

        let (mut client_read, mut client_write) = client.split();
        let (mut server_read, mut server_write) = server.split();
        let mut up_buf = vec![0u8; buffer_size];
        let mut down_buf = vec![0u8; buffer_size];

        let (client_to_server, server_to_client) = tokio::join!(
            run_direction(
                &control,
                Direction::ClientToServer,
                &mut client_read,
                &mut server_write,
                &mut up_buf,
                &control.bytes_up,
            ),
            run_direction(
                &control,
                Direction::ServerToClient,
                &mut server_read,
                &mut client_write,
                &mut down_buf,
                &control.bytes_down,
            ),
        );

        // Closing: both sockets go down together
        let _ = server_write.shutdown().await;
        let _ = client_write.shutdown().await;
        drop(server);
        drop(client);
        control.finish();

        SessionReport::from_control(
            &control,
            SessionOutcome::Completed {
                client_to_server,
                server_to_client,
            },
        )
    }
}

/// Run one direction until it ends on its own or the session is closed,
/// then close the session so the other direction stops too
async fn run_direction<R, W>(
    control: &SessionControl,
    direction: Direction,
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    counter: &AtomicU64,
) -> RelayEnd
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let end = tokio::select! {
        end = relay_chunks(reader, writer, buf, counter) => end,
        _ = control.closed() => RelayEnd::Cancelled,
    };

    match &end {
        RelayEnd::Eof { bytes } => {
            debug!(%direction, bytes, "Peer closed the stream");
        }
        RelayEnd::Failed { bytes, error } => {
            warn!(%direction, bytes, "Relay error: {}", error);
        }
        RelayEnd::Cancelled => {
            debug!(%direction, "Relay cancelled by session close");
        }
    }

    control.close();
    end
}

/// Try each resolved target address in order
async fn connect_to_target(targets: &[SocketAddr]) -> Result<(TcpStream, SocketAddr), TunnelError> {
    let mut last_error = None;

    for &addr in targets {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!("Connected to target {}", addr);
                return Ok((stream, addr));
            }
            Err(e) => {
                debug!("Failed to connect to {}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    let source = last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no target addresses")
    });
    Err(TunnelError::connect(targets, source))
}
