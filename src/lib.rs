//! Client-side discovery, upload and liveness maintenance for a
//! control-system record-catalog announcement protocol.
//!
//! A long-running process periodically advertises the records (named
//! data points) and environment metadata it hosts to a catalog server
//! discovered on the local network. The server isn't known in advance;
//! it announces itself with periodic UDP broadcasts. Once found, the
//! client opens a TCP connection, uploads its catalog, then holds the
//! connection open answering liveness pings until it drops, at which
//! point it searches again.
//!
//! ```no_run
//! use reccaster_client::{Driver, DriverConfig};
//!
//! let driver = Driver::builder()
//!     .driver_config(DriverConfig::default())
//!     .add_env_vars(["BEAMLINE"])
//!     .add_exclude_patterns(["*:_internal"])
//!     .get_records(|uploader, config| {
//!         if !config.is_excluded("X:1") {
//!             let rid = uploader.send_record("ai", "X:1")?;
//!             uploader.send_alias(rid, "X:1:alias")?;
//!         }
//!         Ok(())
//!     })
//!     .start()?;
//!
//! // ... later, from the owning thread:
//! drop(driver); // requests shutdown and joins the worker thread
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! This crate only emits through the `log` facade; install a subscriber
//! (`env_logger`, `tracing-log`, etc.) in the host process to see output.

pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod socket;
pub mod wire;

pub use catalog::CatalogUploader;
pub use config::Config;
pub use driver::{Driver, DriverBuilder, DriverConfig, Handlers, Phase, TestStage};
pub use error::{RecvOutcome, SendOutcome};
