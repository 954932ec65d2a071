//! # porto-rpc
//!
//! The daemon's RPC surface: wire messages, varint framing, the
//! request dispatcher and the unix-socket connection server.
//!
//! Every message travels as `varint(size) || bytes(size)`; the bytes
//! are protobuf, so unknown fields from newer clients are skipped and
//! the schema stays forward compatible.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod dispatcher;
pub mod framing;
pub mod protocol;
pub mod server;

pub use dispatcher::{ConnHandle, Dispatcher};
pub use server::Server;
