//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod backoff;
pub mod shutdown;

pub use backoff::{Backoff, LinkState, ReconnectMachine};
pub use shutdown::{shutdown_signal, SessionGuard, ShutdownController};
