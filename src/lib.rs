#![deny(missing_docs)]
//! A small bidirectional TCP messaging library that shares named string values between a
//! client and a server over persistent connections.
//!
//! This crate provides the [`VarsClient`] and [`VarsServer`] types, as well as a
//! [`tcpvars-client`] and [`tcpvars-server`] executable that demonstrate them.
//!
//! ## Named values
//! Both sides keep a [`CommandStore`], a concurrent map of names to their latest value.
//! Two operations work on it:
//!
//! - `write` a value under a name (an upsert)
//! - `read` a name, which looks up its value and *delivers* it over the network: the client
//! sends it to the server, the server broadcasts it to every connected client
//!
//! Reading a name that was never written (or holds an empty value) is not an error, the miss
//! is reported to the [`Logger`] and nothing is sent.
//!
//! ## Connections
//! Every live socket is wrapped in a [`Connection`]. It owns a lock that serializes writes, and
//! a [`CancelToken`] that tells the background threads servicing it to stop. Disposing a
//! connection is idempotent and may race from several threads.
//!
//! The client connects on demand, retrying `reconnect_count` times, and runs a reader thread
//! and a liveness checker. When the checker finds the connection dropped the client becomes
//! *timed out*, and operations fail until [`VarsClient::connect`] is called again.
//!
//! The server keeps a registry of peers keyed by their remote address. An accept loop adds
//! peers, each peer's reader thread removes it when the peer goes away, and a periodic sweep
//! removes any peer whose connection died silently.
//!
//! ## Wire format
//! Values are sent as raw UTF-8 bytes with no framing. Whatever a single socket read returns
//! is treated as one message, so messages sent in quick succession may arrive merged, and
//! large messages may arrive split.
//!
//! ## Logging
//! Connection events, inbound traffic and recoverable failures are reported to the [`Logger`]
//! given at construction. [`TracingLogger`] forwards them to the [`tracing`] crate. Internal
//! diagnostics are emitted as `tracing` debug events.
//!
//! [`tcpvars-server`]: ./tcpvars-server.rs
//! [`tcpvars-client`]: ./tcpvars-client.rs
//! [`tracing`]: https://docs.rs/tracing

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use cancel::CancelToken;
pub use client::VarsClient;
pub use connection::Connection;
pub use error::{Result, VarsError};
pub use logger::{Logger, TracingLogger};
pub use server::VarsServer;
pub use settings::Settings;
pub use store::CommandStore;

mod cancel;
mod client;
mod connection;
mod error;
mod logger;
mod server;
mod settings;
mod store;

/// locks `mutex`, recovering the guard if a thread panicked while holding it. The guarded
/// state in this crate stays consistent across a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
