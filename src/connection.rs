use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::cancel::CancelToken;
use crate::error::is_transient_io;
use crate::{lock, Result};

/// One live TCP connection: the socket, a lock that serializes writers, and the cancellation
/// token of the threads servicing it.
///
/// Reads go straight to the socket and are not serialized against writes, so a reader thread
/// can block in [`Connection::read_chunk`] while other threads [`Connection::send`].
///
/// [`Connection::dispose`] tears the connection down: it cancels the token and shuts the
/// socket down in both directions, which also unblocks a pending read. Only the first call
/// does anything, so it may race freely from the reader, the liveness checker and explicit
/// disconnects.
#[derive(Debug)]
pub struct Connection {
    /// remote address of the socket, used as the server registry key
    peer: String,
    /// handle used by the reader thread and for liveness checks
    stream: TcpStream,
    /// second handle to the same socket, only ever used while the lock is held
    writer: Mutex<TcpStream>,
    cancel: CancelToken,
    /// cleared once the peer closed its side or the socket failed, never by `dispose`
    open: AtomicBool,
    disposed: AtomicBool,
}

impl Connection {
    /// wraps `stream`. Reads block for at most `read_timeout` (a zero timeout blocks until
    /// data arrives or the connection is torn down).
    ///
    /// # Errors
    /// returns an IO error if the socket has no peer address or cannot be cloned
    pub fn new(stream: TcpStream, cancel: CancelToken, read_timeout: Duration) -> Result<Self> {
        let peer = stream.peer_addr()?.to_string();
        let read_timeout = if read_timeout.is_zero() {
            None
        } else {
            Some(read_timeout)
        };
        stream.set_read_timeout(read_timeout)?;
        let writer = stream.try_clone()?;

        Ok(Connection {
            peer,
            stream,
            writer: Mutex::new(writer),
            cancel,
            open: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
        })
    }

    /// the remote address, formatted as `ip:port`
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// the token shared by the threads servicing this connection
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// returns `true` while the connection has not been disposed, the peer has not closed its
    /// side, and the socket reports no pending error
    pub fn is_connected(&self) -> bool {
        !self.is_disposed() && !self.is_dropped()
    }

    /// returns `true` if the connection was lost from the outside: the peer closed its side or
    /// the socket failed. A connection we disposed ourselves is not dropped.
    pub fn is_dropped(&self) -> bool {
        if !matches!(self.stream.take_error(), Ok(None)) {
            self.mark_closed();
        }
        !self.open.load(Ordering::SeqCst)
    }

    /// returns `true` once [`Connection::dispose`] ran
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        // our own shutdown makes reads and writes fail too, that is not a drop
        if self.is_disposed() {
            return;
        }
        if self.open.swap(false, Ordering::SeqCst) {
            debug!("connection to {} closed", &self.peer);
        }
    }

    /// performs a single read of at most `buffer_size` bytes.
    ///
    /// Whatever one read returns is one message, there is no framing.
    ///
    /// ## Returns
    /// `Ok(Some(bytes))` if data arrived.
    /// `Ok(None)` if nothing arrived before the read timeout, or the peer closed its side (the
    /// connection is then marked as no longer connected).
    ///
    /// # Errors
    /// any socket error. Transient ones also mark the connection as closed.
    pub fn read_chunk(&self, buffer_size: usize) -> Result<Option<Vec<u8>>> {
        let mut buffer = vec![0_u8; buffer_size];
        match (&self.stream).read(&mut buffer) {
            Ok(0) => {
                self.mark_closed();
                Ok(None)
            }
            Ok(read) => {
                buffer.truncate(read);
                Ok(Some(buffer))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => {
                if is_transient_io(&e) {
                    self.mark_closed();
                }
                Err(e.into())
            }
        }
    }

    /// writes all of `data` in chunks of at most `buffer_size` bytes, then flushes.
    /// The write lock is held for the whole message so concurrent senders never interleave.
    ///
    /// # Errors
    /// returns the IO error of the first failed write; the connection is then marked as
    /// no longer connected
    pub fn send(&self, data: &[u8], buffer_size: usize) -> Result<()> {
        let mut writer = lock(&self.writer);

        let written = write_chunks(&mut *writer, data, buffer_size);
        if written.is_err() {
            self.mark_closed();
        }
        let chunks = written?;
        debug!("sent {} bytes in {} chunk(s) to {}", data.len(), chunks, &self.peer);
        Ok(())
    }

    /// tears the connection down: cancel the token, close the stream, close the socket.
    ///
    /// Returns `true` for the call that performed the teardown, `false` for every later call.
    #[instrument(skip(self), fields(peer = %self.peer))]
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();

        // the peer may already have reset the socket
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown after close: {}", e);
        }
        debug!("connection disposed");
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// writes `data` to `writer` in `buffer_size` pieces and flushes, returning the number of
/// pieces written
fn write_chunks<W: Write>(writer: &mut W, data: &[u8], buffer_size: usize) -> io::Result<usize> {
    let mut chunks = 0;
    for chunk in data.chunks(buffer_size.max(1)) {
        writer.write_all(chunk)?;
        chunks += 1;
    }
    writer.flush()?;
    Ok(chunks)
}
