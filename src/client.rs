use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::cancel::CancelToken;
use crate::connection::Connection;
use crate::logger::{Logger, TracingLogger};
use crate::{lock, CommandStore, Result, Settings, VarsError};

const CONNECT_TIMEOUT_MSG: &str = "Failed connecting to the server. Timeout!";
const RECONNECT_REQUIRED_MSG: &str = "Timeout connecting to the server. Please reconnect again.";

/// the client's current connection, shared with the liveness checker of that connection
type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

/// `VarsClient` keeps one connection to a [`VarsServer`] alive and sends it named values.
///
/// Values are written into a local [`CommandStore`] with [`VarsClient::write`] and pushed to
/// the server with [`VarsClient::read`]. Both operations connect on demand.
///
/// While connected, two background threads service the connection:
/// - a reader that logs everything the server sends
/// - a liveness checker that, every `check_time_ms`, looks for a dropped connection. When it
/// finds one the client is marked as timed out, and every operation fails with
/// [`VarsError::Timeout`] until [`VarsClient::connect`] is called again.
///
/// # Example
/// ```rust,no_run
/// use std::sync::Arc;
/// use tcpvars::{Settings, TracingLogger, VarsClient};
/// # fn main() -> tcpvars::Result<()> {
/// let client = VarsClient::new(Settings::new("127.0.0.1", 13005), Arc::new(TracingLogger))?;
/// client.connect()?;
/// client.write("speed", "42")?;
/// client.read("speed")?; // sends "42" to the server
/// # Ok(())
/// # }
/// ```
///
/// [`VarsServer`]: ./struct.VarsServer.html
pub struct VarsClient {
    settings: Settings,
    logger: Arc<dyn Logger>,
    commands: CommandStore,
    /// serializes `write` and `read`, so a store update and its send never interleave
    op_lock: Mutex<()>,
    /// the current connection, replaced whole on reconnect
    connection: Slot,
    /// set when connecting failed or the liveness checker found a dropped connection
    timed_out: Arc<AtomicBool>,
}

impl VarsClient {
    /// creates a disconnected client that will use the given `settings` and report to `logger`
    ///
    /// # Errors
    /// returns [`VarsError::InvalidArgument`] if the settings are unusable
    pub fn new(settings: Settings, logger: Arc<dyn Logger>) -> Result<Self> {
        settings.validate()?;
        Ok(VarsClient {
            settings,
            logger,
            commands: CommandStore::new(),
            op_lock: Mutex::new(()),
            connection: Arc::new(Mutex::new(None)),
            timed_out: Arc::new(AtomicBool::new(false)),
        })
    }

    /// creates a client for `ip_address:port` with default settings and a [`TracingLogger`]
    pub fn create(ip_address: &str, port: u16) -> Result<Self> {
        VarsClient::new(Settings::new(ip_address, port), Arc::new(TracingLogger))
    }

    /// the settings this client was created with
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// returns `true` if a live connection to the server exists
    pub fn is_connected(&self) -> bool {
        lock(&self.connection)
            .as_ref()
            .map_or(false, |conn| conn.is_connected())
    }

    /// returns `true` if the last connect failed, or the connection was found dropped.
    /// Cleared by a successful [`VarsClient::connect`].
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// connects to the server, unless already connected.
    ///
    /// Makes up to `reconnect_count + 1` attempts, each bounded by `timeout_ms`. If none of them
    /// succeeds the client is marked as timed out and the timeout is logged, but not returned.
    ///
    /// # Errors
    /// any failure other than a timeout, for example an address that does not resolve
    pub fn connect(&self) -> Result<()> {
        match self.open_connection() {
            Ok(_) => Ok(()),
            Err(e @ VarsError::Timeout(_)) => {
                self.logger.message(&e.to_string());
                Ok(())
            }
            Err(e) => {
                self.logger.error(&e);
                Err(e)
            }
        }
    }

    /// asks the background threads to stop and closes the socket, without waiting for them
    pub fn disconnect(&self) {
        if let Some(conn) = lock(&self.connection).as_ref() {
            conn.dispose();
        }
    }

    /// closes the connection, if any. Safe to call any number of times.
    pub fn dispose(&self) {
        if let Some(conn) = lock(&self.connection).take() {
            conn.dispose();
        }
    }

    /// sets the value of `name`, connecting first if needed
    ///
    /// # Errors
    /// returns [`VarsError::Timeout`] if the client is timed out or cannot connect
    pub fn write(&self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let _guard = lock(&self.op_lock);

        if let Err(e) = self.ensure_connected() {
            self.logger.error(&e);
            return Err(e);
        }
        self.commands.write(name.into(), value.into());
        Ok(())
    }

    /// sends the current value of `name` to the server, connecting first if needed
    ///
    /// ## Returns
    /// `Ok(Some(value))` with the value that was sent.
    /// `Ok(None)` if `name` has no value. The miss is logged and nothing is sent.
    ///
    /// # Errors
    /// returns [`VarsError::Timeout`] if the client is timed out or cannot connect, and an IO
    /// error if sending failed
    pub fn read(&self, name: &str) -> Result<Option<String>> {
        let _guard = lock(&self.op_lock);

        let conn = match self.ensure_connected() {
            Ok(conn) => conn,
            Err(e) => {
                self.logger.error(&e);
                return Err(e);
            }
        };

        let value = match self.commands.read(name) {
            Ok(value) => value,
            Err(e @ VarsError::NotFound { .. }) => {
                self.logger.error(&e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = conn.send(value.as_bytes(), self.settings.buffer_size) {
            self.logger.error(&e);
            return Err(e);
        }
        Ok(Some(value))
    }

    /// fails fast if timed out, otherwise returns the live connection, connecting if needed
    fn ensure_connected(&self) -> Result<Arc<Connection>> {
        if self.is_timed_out() {
            return Err(VarsError::Timeout(RECONNECT_REQUIRED_MSG.to_string()));
        }
        self.open_connection()
    }

    /// returns the current connection if it is live, otherwise replaces it with a new one and
    /// starts its reader and checker threads
    #[instrument(skip(self), fields(ip = %self.settings.ip_address, port = self.settings.port))]
    fn open_connection(&self) -> Result<Arc<Connection>> {
        let mut slot = lock(&self.connection);
        if let Some(conn) = slot.as_ref() {
            if conn.is_connected() {
                return Ok(Arc::clone(conn));
            }
        }
        if let Some(stale) = slot.take() {
            stale.dispose();
        }

        let addr = self.settings.socket_addr()?;
        let timeout = self.settings.timeout();
        let reconnect_count = self.settings.reconnect_count;
        let stream = match connect_with_retry(&addr, timeout, reconnect_count, connect_once) {
            Some(stream) => stream,
            None => {
                self.timed_out.store(true, Ordering::SeqCst);
                return Err(VarsError::Timeout(CONNECT_TIMEOUT_MSG.to_string()));
            }
        };

        let conn = Arc::new(Connection::new(stream, CancelToken::new(), timeout)?);
        self.timed_out.store(false, Ordering::SeqCst);
        self.spawn_workers(&conn)?;
        *slot = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// starts the reader and liveness checker of `conn`. Both share its cancellation token.
    fn spawn_workers(&self, conn: &Arc<Connection>) -> Result<()> {
        let reader = {
            let conn = Arc::clone(conn);
            let logger = Arc::clone(&self.logger);
            let buffer_size = self.settings.buffer_size;
            let backoff = self.settings.timeout();
            move || read_from_server(conn, logger, buffer_size, backoff)
        };
        let checker = {
            let conn = Arc::clone(conn);
            let slot = Arc::clone(&self.connection);
            let timed_out = Arc::clone(&self.timed_out);
            let check_time = self.settings.check_time();
            move || check_server_connection(conn, slot, timed_out, check_time)
        };

        let spawned = thread::Builder::new()
            .name("tcpvars-client-reader".into())
            .spawn(reader)
            .and_then(|_| {
                thread::Builder::new()
                    .name("tcpvars-client-checker".into())
                    .spawn(checker)
            });
        if let Err(e) = spawned {
            conn.dispose();
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for VarsClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// makes up to `reconnect_count + 1` calls to `connect`, returning the first stream it opens
fn connect_with_retry<F>(
    addr: &SocketAddr,
    timeout: Duration,
    reconnect_count: u32,
    mut connect: F,
) -> Option<TcpStream>
where
    F: FnMut(&SocketAddr, Duration) -> io::Result<TcpStream>,
{
    for attempt in 0..=reconnect_count {
        match connect(addr, timeout) {
            Ok(stream) => {
                debug!(attempt, "connected to {}", addr);
                return Some(stream);
            }
            Err(e) => debug!(attempt, "connect to {} failed: {}", addr, e),
        }
    }
    None
}

fn connect_once(addr: &SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    if timeout.is_zero() {
        TcpStream::connect(addr)
    } else {
        TcpStream::connect_timeout(addr, timeout)
    }
}

/// drains whatever the server sends and logs it, until the connection is cancelled or drops.
///
/// An empty read backs off for `backoff` before trying again. Transient IO errors end the
/// loop quietly; anything else is logged and returned, which ends this thread without
/// tearing the connection down.
fn read_from_server(
    conn: Arc<Connection>,
    logger: Arc<dyn Logger>,
    buffer_size: usize,
    backoff: Duration,
) -> Result<()> {
    let token = conn.cancel_token().clone();
    debug!("reader started for {}", conn.peer());

    loop {
        if token.is_cancelled() {
            logger.message("Server is disconnected.");
            break;
        }
        if !conn.is_connected() {
            break;
        }

        match conn.read_chunk(buffer_size) {
            Ok(Some(data)) => {
                logger.message(&format!("From Server: {}", String::from_utf8_lossy(&data)));
            }
            Ok(None) => {
                token.sleep(backoff);
            }
            Err(e) if e.is_transient() => break,
            Err(e) => {
                logger.error(&e);
                return Err(e);
            }
        }
    }

    conn.dispose();
    debug!("reader stopped for {}", conn.peer());
    Ok(())
}

/// wakes every `check_time` and, if the connection was dropped by the other side, cancels it
/// and marks the client as timed out.
///
/// The flag is only set while `conn` is still the client's current connection. The check runs
/// under the slot lock, the same lock a reconnect holds while it swaps connections, so a
/// checker that outlives its connection can never time out the one that replaced it.
fn check_server_connection(
    conn: Arc<Connection>,
    slot: Slot,
    timed_out: Arc<AtomicBool>,
    check_time: Duration,
) {
    let token = conn.cancel_token().clone();
    loop {
        let slept = token.sleep(check_time);
        if conn.is_dropped() {
            token.cancel();
            let current = lock(&slot);
            if current.as_ref().map_or(false, |c| Arc::ptr_eq(c, &conn)) {
                timed_out.store(true, Ordering::SeqCst);
                debug!("connection to {} dropped", conn.peer());
            } else {
                debug!("replaced connection to {} dropped", conn.peer());
            }
            break;
        }
        if !slept {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    struct Silent;

    impl Logger for Silent {
        fn message(&self, _message: &str) {}
        fn error(&self, _error: &dyn std::error::Error) {}
    }

    fn unused_port() -> u16 {
        // bind then drop, leaving a port nobody listens on
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn settings(port: u16) -> Settings {
        Settings {
            timeout_ms: 50,
            check_time_ms: 20,
            reconnect_count: 1,
            ..Settings::new("127.0.0.1", port)
        }
    }

    #[test]
    fn new_client_is_disconnected() {
        let client = VarsClient::new(settings(1), Arc::new(Silent)).unwrap();
        assert!(!client.is_connected());
        assert!(!client.is_timed_out());
    }

    #[test]
    fn connect_failure_marks_timed_out_without_erroring() {
        let client = VarsClient::new(settings(unused_port()), Arc::new(Silent)).unwrap();
        client.connect().unwrap();
        assert!(client.is_timed_out());
        assert!(!client.is_connected());
    }

    #[test]
    fn operations_fail_fast_after_timeout() {
        let client = VarsClient::new(settings(unused_port()), Arc::new(Silent)).unwrap();
        client.connect().unwrap();

        assert!(matches!(client.write("k", "v"), Err(VarsError::Timeout(_))));
        assert!(matches!(client.read("k"), Err(VarsError::Timeout(_))));
    }

    #[test]
    fn unresolvable_address_is_returned() {
        let client =
            VarsClient::new(Settings::new("no such host", 1), Arc::new(Silent)).unwrap();
        assert!(matches!(client.connect(), Err(VarsError::Parsing(_))));
    }

    #[test]
    fn zero_buffer_size_is_rejected() {
        let settings = Settings {
            buffer_size: 0,
            ..settings(1)
        };
        assert!(VarsClient::new(settings, Arc::new(Silent)).is_err());
    }

    #[test]
    fn connect_makes_one_attempt_plus_reconnect_count() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let timeout = Duration::from_millis(40);
        let mut attempts = 0;

        let start = Instant::now();
        let stream = connect_with_retry(&addr, timeout, 2, |_, timeout| {
            attempts += 1;
            thread::sleep(timeout);
            Err(io::Error::from(io::ErrorKind::TimedOut))
        });

        assert!(stream.is_none());
        assert_eq!(attempts, 3);
        assert!(start.elapsed() >= timeout * 3);
    }

    #[test]
    fn connect_stops_retrying_once_an_attempt_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut attempts = 0;

        let stream = connect_with_retry(&addr, Duration::from_millis(50), 5, |addr, timeout| {
            attempts += 1;
            if attempts < 3 {
                Err(io::Error::from(io::ErrorKind::ConnectionRefused))
            } else {
                connect_once(addr, timeout)
            }
        });

        assert!(stream.is_some());
        assert_eq!(attempts, 3);
    }

    #[test]
    fn zero_reconnect_count_still_makes_one_attempt() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let mut attempts = 0;
        let stream = connect_with_retry(&addr, Duration::from_millis(10), 0, |_, _| {
            attempts += 1;
            Err(io::Error::from(io::ErrorKind::ConnectionRefused))
        });
        assert!(stream.is_none());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn dispose_is_idempotent() {
        let client = VarsClient::new(settings(1), Arc::new(Silent)).unwrap();
        client.dispose();
        client.dispose();
        client.disconnect();
    }
}
