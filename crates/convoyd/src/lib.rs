//! convoy replica daemon (convoyd)
//!
//! Wires one control-plane replica: coordination context, background
//! controllers, and the health/metrics HTTP endpoints.
//!
//! ## Quick Start
//!
//! ```bash
//! # Single replica, in-memory tables
//! convoyd
//!
//! # Replica of a fleet sharing one database
//! convoyd --storage postgres \
//!   --database-url "host=db user=convoy dbname=convoy" \
//!   --instance-id convoy-0 --subscription-mode broadcast
//! ```

pub mod cli;
pub mod http;

pub use cli::{Cli, LogFormat, StorageBackend};
pub use http::{create_router, serve, HttpState};
