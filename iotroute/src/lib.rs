#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # Overall Example
//! ```rust,no_run
//!
//! use std::sync::Arc;
//!
//! use iotroute::conf::Settings;
//! use iotroute::context::RouterContext;
//! use iotroute::outbound::Publisher;
//! use iotroute::repository::FileRepository;
//! use iotroute::signing::Sha256Signer;
//!
//! async fn run(settings: Settings, publisher: Arc<dyn Publisher>) -> iotroute::Result<()> {
//!     let repository = Arc::new(FileRepository::new(&settings.repository.data_dir));
//!     let ctx = RouterContext::new(settings, publisher, repository, Arc::new(Sha256Signer));
//!     ctx.start();
//!     tokio::signal::ctrl_c().await?;
//!     ctx.shutdown().await
//! }
//! ```

/// Caching
pub mod cache; // Bounded TTL cache
pub mod routing_cache; // Sensors, accounts, API keys and live data subscriptions

/// Routing
pub mod message; // Messages and network events
pub mod router; // Router chain and composite router
pub mod signing; // Control message signatures
pub mod types; // Identifiers and routing data

/// Input and output
pub mod command; // Inbound commands and live data sync lists
pub mod ingress; // Submission validation
pub mod outbound; // Outbound publish queues
pub mod queue; // Bounded lock-free queue
pub mod topic; // Topic templates

/// Runtime
pub mod context; // Shared engine context
pub mod logger; // slog bridge for the log facade
pub mod metrics; // Routing counters
pub mod repository; // System of record
pub mod service; // Background jobs

mod error;
#[cfg(test)]
mod test_util;

pub use error::{Error, Result};
pub use iotroute_conf as conf;
pub use iotroute_utils as utils;

/// Re-exports for the executable
pub use anyhow;
pub use log;
pub use serde_json;
pub use structopt;
pub use tokio;
