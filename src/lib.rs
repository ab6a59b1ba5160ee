//! CSP Collector Library
//!
//! Receives Content-Security-Policy violation reports for a set of
//! whitelisted domains, buffers them per domain, rotates the buffers into
//! zip archives on disk and forwards each raw report to a syslog collector.
//!
//! - **config**: Environment-based configuration
//! - **report**: Violation report wire types
//! - **archive**: Archive naming, collision-free writes, listing
//! - **aggregator**: Per-domain buffer and archive rotation
//! - **scheduler**: Daily sequence reset and stale flush
//! - **forwarder**: Best-effort syslog client with a bounded queue
//! - **policy**: Nonce and policy header rendering
//! - **context**: Application context built at startup
//! - **server**: Ingestion endpoint and operator API
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use csp_collector::aggregator::SystemClock;
//! use csp_collector::config::Config;
//! use csp_collector::context::AppContext;
//! use csp_collector::server::ingest_router;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let ctx = Arc::new(
//!         AppContext::new(&config, Arc::new(SystemClock), None).expect("Failed to build context"),
//!     );
//!
//!     let listener = tokio::net::TcpListener::bind(&config.report_addr).await.unwrap();
//!     axum::serve(listener, ingest_router(ctx)).await.unwrap();
//! }
//! ```

pub mod aggregator;
pub mod archive;
pub mod config;
pub mod context;
pub mod forwarder;
pub mod policy;
pub mod report;
pub mod scheduler;
pub mod server;

pub use aggregator::{Clock, DomainAggregator, FlushResult, ManualClock, SystemClock};
pub use archive::{ArchiveError, ArchiveInfo};
pub use config::{Config, ConfigError};
pub use context::AppContext;
pub use forwarder::{Forwarder, ForwarderConfig, ForwarderError, ForwarderSender, Transport};
pub use report::{CspReport, ViolationReport};
