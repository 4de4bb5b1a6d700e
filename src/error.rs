use std::io;
use thiserror::Error;

/// type alias for all operations in this crate that could fail with a [`VarsError`]
pub type Result<T> = std::result::Result<T, VarsError>;

/// The Error variants used by [`VarsClient`] and [`VarsServer`].
///
/// [`VarsClient`]: ./struct.VarsClient.html
/// [`VarsServer`]: ./struct.VarsServer.html
#[derive(Error, Debug)]
pub enum VarsError {
    /// connect attempts were exhausted, or an operation was attempted on a client that
    /// previously timed out
    #[error("{0}")]
    Timeout(String),

    /// a named value was never written, or was written with an empty value
    #[error("The {name} command not found or not available.")]
    NotFound {
        /// the name that was looked up
        name: String,
    },

    /// a caller passed an empty or otherwise unusable argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `start` was called on a server that is already listening
    #[error("The server is already running.")]
    AlreadyRunning,

    /// an address or option could not be parsed
    #[error("parsing error: {0}")]
    Parsing(String),

    /// variant for errors caused by socket IO
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl VarsError {
    /// returns `true` if this error is an I/O failure that is expected while a connection is
    /// being torn down (closed stream, reset socket, interrupted read). Reader loops swallow
    /// these silently.
    pub fn is_transient(&self) -> bool {
        match self {
            VarsError::Io(e) => is_transient_io(e),
            _ => false,
        }
    }
}

/// classifies the io error kinds that show up when the other side of a socket, or another
/// thread of ours, closes the connection
pub(crate) fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    )
}
