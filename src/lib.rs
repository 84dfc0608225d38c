//! Rosterline offline-first client core
//!
//! Re-exports the storage, networking and sync-engine crates under one roof
//! and provides logging setup for hosting applications.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use networking;
pub use storage;
pub use sync_engine;

pub use sync_engine::{Engine, EngineConfig, EngineError, EngineEvent};

/// Logging setup
pub mod logging {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    /// Install a stderr subscriber filtered by `RUST_LOG`, or by
    /// `default_filter` when the variable is unset
    ///
    /// Returns `false` if a global subscriber was already installed.
    pub fn init(default_filter: &str) -> bool {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
            .is_ok()
    }

}
