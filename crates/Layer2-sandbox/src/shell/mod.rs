//! Interactive shell subsystem
//!
//! - `ShellSession` - one persistent pty-backed shell per (session, user)
//! - `ShellSessionManager` - registry enforcing one shell per user and one
//!   user per collaborative session

pub mod manager;
pub mod session;
pub mod state;

pub use manager::{ShellOpenError, ShellSessionManager};
pub use session::{OutputSink, ShellOutput, ShellSession};
pub use state::ShellState;
