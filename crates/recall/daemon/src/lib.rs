//! Recall daemon library
//!
//! This module provides the core components for `recalld`:
//! - Layered configuration
//! - Storage and embedder wiring
//! - The stdio request loop and lifecycle management

pub mod backend;
pub mod config;
pub mod error;
pub mod server;

pub use backend::{build_coordinator, build_embedder};
pub use config::DaemonConfig;
pub use error::{DaemonError, DaemonResult};
pub use server::Server;
