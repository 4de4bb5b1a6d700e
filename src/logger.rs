//! The [`Logger`] collaborator receives the human readable lines the client and server emit:
//! connection events, inbound traffic, and recoverable failures.
//!
//! A logger is handed to each [`VarsClient`] and [`VarsServer`] when it is constructed.
//! [`TracingLogger`] is the default and forwards everything to the [`tracing`] crate.
//!
//! [`VarsClient`]: ../struct.VarsClient.html
//! [`VarsServer`]: ../struct.VarsServer.html
//! [`tracing`]: https://docs.rs/tracing
use std::error::Error;
use tracing::{error, info};

/// A sink for trace and error lines. Implementations must be callable from any thread.
pub trait Logger: Send + Sync {
    /// records an informational message
    fn message(&self, message: &str);

    /// records an error
    fn error(&self, error: &dyn Error);
}

/// A [`Logger`] that emits `info` events for messages and `error` events for errors
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn message(&self, message: &str) {
        info!("{}", message);
    }

    fn error(&self, error: &dyn Error) {
        error!("{}", error);
    }
}
