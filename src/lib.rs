//! iovet - concurrent data-integrity tester
//!
//! iovet writes deterministic patterns to disks, files, and removable media,
//! reads them back, and reports every block that does not come back the way
//! it was written.
//!
//! # Architecture
//!
//! - **I/O contexts**: per-worker state (device handle, buffers, pattern,
//!   address sequence, statistics), cloned from one template per job
//! - **Jobs**: groups of worker threads under a cancellation token, managed
//!   through [`state::ProcessState`]
//! - **Loops**: exercise (write then verify), copy, and mirror
//! - **Monitor**: keepalive, no-progress detection and escalation, runtime
//!   limits, grace-period force-cancel, adaptive rate control

pub mod config;
pub mod context;
pub mod device;
pub mod distribution;
pub mod job;
pub mod logging;
pub mod monitor;
pub mod output;
pub mod pattern;
pub mod state;
pub mod stats;
pub mod util;
pub mod worker;

pub use config::Config;
pub use context::IoContext;
pub use state::ProcessState;

/// Result type used throughout iovet
pub type Result<T> = anyhow::Result<T>;
