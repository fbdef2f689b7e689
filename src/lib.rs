//! porttunnel
//!
//! Asynchronous TCP port-forwarding tunnel. Connections accepted on a local
//! endpoint are paired with a fresh connection to a fixed target, and bytes
//! are relayed opaquely in both directions until either side closes.

pub mod config;
pub mod error;
pub mod relay;
pub mod shutdown;
pub mod tunnel;

pub use config::{Config, Endpoint};
pub use error::{Result, TunnelError};
pub use relay::{Session, SessionControl, SessionReport, SessionState};
pub use shutdown::ShutdownCoordinator;
pub use tunnel::{Acceptor, SessionRegistry};
