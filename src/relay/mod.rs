//! Data Relay Module
//!
//! Handles bidirectional data relay between client and target.

pub mod pipe;
pub mod session;

pub use pipe::{relay_chunks, Direction, RelayEnd};
pub use session::{Session, SessionControl, SessionOutcome, SessionReport, SessionState};
