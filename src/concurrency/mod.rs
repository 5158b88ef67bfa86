//! Concurrency primitives shared by the relay.

pub mod gate;

pub use gate::{AdmissionGate, AdmissionPermit};

/// Default number of history fetches allowed in flight during a reload.
pub const DEFAULT_RELOAD_CONCURRENCY: usize = 3;
