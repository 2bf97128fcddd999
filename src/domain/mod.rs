//! Domain Layer
//!
//! Synchronized entities and the outbound ports the sync core depends on.

pub mod entities;
pub mod ports;
