//! Protocol engine for Unfolded Circle remote integration drivers.
//!
//! A driver binary implements [`Driver`] and hands it to [`app::run`]; the
//! engine serves the remote's WebSocket API, keeps the configured devices in
//! `configured_entities.json` and calls back into the driver for anything
//! device-specific.

pub mod app;
pub mod command;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod handler;
pub mod identifier;
pub mod model;
pub mod protocol;
pub mod server;
pub mod session;
pub mod setup;
pub mod store;
pub mod subscription;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use context::IntegrationContext;
pub use driver::{Driver, DriverResult, EntityCommandResult, SetupOutcome};
pub use error::{BridgeError, DriverError};
pub use session::Connection;
pub use store::{ConfigurationItem, ConfigurationService, IntegrationConfiguration};

/// Installs the fmt subscriber, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
