pub mod schema;

pub use schema::{Config, RelayConfig, ReliabilityConfig};
