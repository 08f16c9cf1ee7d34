//! The protocol engine and its supporting services.

pub mod cheating;
pub mod enforcement;
pub mod engine;
pub mod reconnect;
pub mod runtime;
pub mod snapshot;
pub mod wire;
