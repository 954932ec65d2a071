//! # porto-core
//!
//! Daemon configuration and the runtime context.
//!
//! The [`Runtime`] is built once at daemon start and threaded through
//! every RPC handler: it owns the cgroup registry, the network binding
//! and the mutex-guarded daemon state (container holder and volume
//! holder). There are no process-wide singletons.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod runtime;

pub use config::Config;
pub use runtime::{DaemonState, Runtime};
