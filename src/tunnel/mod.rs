//! Tunnel Module
//!
//! Listener side of the tunnel: the accept loop and live-session tracking.

pub mod acceptor;
pub mod registry;

pub use acceptor::Acceptor;
pub use registry::{SessionGuard, SessionInfo, SessionRegistry};
