use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, instrument};

use crate::cancel::CancelToken;
use crate::connection::Connection;
use crate::logger::{Logger, TracingLogger};
use crate::{lock, CommandStore, Result, Settings, VarsError};

// how long the accept loop waits before polling the listener again
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A TCP server that shares named values with every connected client.
///
/// [`VarsServer::start`] binds the listener from the [`Settings`] and starts two background
/// threads:
/// - an accept loop, which registers every new peer under its remote address and starts a
/// reader thread for it
/// - a liveness sweep, which every `check_time_ms` removes and disposes peers whose
/// connection is gone
///
/// Values written with [`VarsServer::write`] go into a single [`CommandStore`].
/// [`VarsServer::read`] broadcasts the current value of a name to every registered peer.
///
/// # Example
/// ```rust,no_run
/// use tcpvars::VarsServer;
/// # fn main() -> tcpvars::Result<()> {
/// let server = VarsServer::create("127.0.0.1", 13005)?;
/// server.start()?;
/// server.write("speed", "42")?;
/// server.read("speed")?; // every connected client receives "42"
/// server.stop();
/// # Ok(())
/// # }
/// ```
pub struct VarsServer {
    commands: CommandStore,
    ctx: Arc<Context>,
    run: Mutex<Option<RunState>>,
}

/// state shared with the background threads
struct Context {
    settings: Settings,
    logger: Arc<dyn Logger>,
    /// registered peers, keyed by remote address
    peers: DashMap<String, Arc<Connection>>,
}

/// one start/stop cycle of the server
struct RunState {
    cancel: CancelToken,
    /// cleared by `stop`, `dispose`, or the accept loop when it exits
    listening: Arc<AtomicBool>,
    local_addr: SocketAddr,
    accept: Option<JoinHandle<()>>,
}

impl VarsServer {
    /// creates a stopped server that will use the given `settings` and report to `logger`
    ///
    /// # Errors
    /// returns [`VarsError::InvalidArgument`] if the settings are unusable
    pub fn new(settings: Settings, logger: Arc<dyn Logger>) -> Result<Self> {
        settings.validate()?;
        Ok(VarsServer {
            commands: CommandStore::new(),
            ctx: Arc::new(Context {
                settings,
                logger,
                peers: DashMap::new(),
            }),
            run: Mutex::new(None),
        })
    }

    /// creates a server for `ip_address:port` with default settings and a [`TracingLogger`]
    pub fn create(ip_address: &str, port: u16) -> Result<Self> {
        VarsServer::new(Settings::new(ip_address, port), Arc::new(TracingLogger))
    }

    /// the settings this server was created with
    pub fn settings(&self) -> &Settings {
        &self.ctx.settings
    }

    /// returns `true` between a successful [`VarsServer::start`] and the next stop
    pub fn is_listening(&self) -> bool {
        lock(&self.run)
            .as_ref()
            .map_or(false, |run| run.listening.load(Ordering::SeqCst))
    }

    /// the address the listener is bound to, `None` while stopped. Useful when the settings
    /// ask for port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.run)
            .as_ref()
            .filter(|run| run.listening.load(Ordering::SeqCst))
            .map(|run| run.local_addr)
    }

    /// number of currently registered peers
    pub fn peer_count(&self) -> usize {
        self.ctx.peers.len()
    }

    /// snapshot of the remote addresses of all registered peers
    pub fn peers(&self) -> Vec<String> {
        self.ctx.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// binds the listener and starts the accept loop and the liveness sweep
    ///
    /// # Errors
    /// returns [`VarsError::AlreadyRunning`] if the server is listening, or an IO error if
    /// the listener could not be bound
    #[instrument(skip(self), fields(ip = %self.ctx.settings.ip_address, port = self.ctx.settings.port))]
    pub fn start(&self) -> Result<()> {
        let mut run = lock(&self.run);
        if let Some(previous) = run.as_mut() {
            if previous.listening.load(Ordering::SeqCst) {
                return Err(VarsError::AlreadyRunning);
            }
            // the old accept loop owns the old listener, wait for it to let go of the port
            if let Some(accept) = previous.accept.take() {
                let _ = accept.join();
            }
        }

        let listener = TcpListener::bind(self.ctx.settings.socket_addr()?)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let cancel = CancelToken::new();
        let listening = Arc::new(AtomicBool::new(true));

        let sweep = {
            let ctx = Arc::clone(&self.ctx);
            let cancel = cancel.clone();
            move || check_peer_connections(ctx, cancel)
        };
        let accept = {
            let ctx = Arc::clone(&self.ctx);
            let cancel = cancel.clone();
            let listening = Arc::clone(&listening);
            move || accept_connections(ctx, listener, cancel, listening)
        };

        let spawned = thread::Builder::new()
            .name("tcpvars-server-sweep".into())
            .spawn(sweep)
            .and_then(|_| {
                thread::Builder::new()
                    .name("tcpvars-server-accept".into())
                    .spawn(accept)
            });
        let accept = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };

        debug!("listening on {}", local_addr);
        *run = Some(RunState {
            cancel,
            listening,
            local_addr,
            accept: Some(accept),
        });
        Ok(())
    }

    /// stops accepting connections and cancels all background threads, without waiting for
    /// them. The listener is closed as soon as the accept loop notices. Peer readers see the
    /// cancellation and drop their peers.
    pub fn stop(&self) {
        let run = lock(&self.run);
        match run.as_ref() {
            Some(run) if run.listening.load(Ordering::SeqCst) => {
                run.listening.store(false, Ordering::SeqCst);
                run.cancel.cancel();
            }
            _ => self.ctx.logger.message("The server isn't running."),
        }
    }

    /// cancels everything, disconnects every registered peer and closes the listener.
    /// Safe to call any number of times.
    pub fn dispose(&self) {
        let accept = {
            let mut run = lock(&self.run);
            run.as_mut().and_then(|run| {
                run.listening.store(false, Ordering::SeqCst);
                run.cancel.cancel();
                run.accept.take()
            })
        };

        let peers: Vec<Arc<Connection>> = self
            .ctx
            .peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in peers {
            self.ctx.disconnect_peer(&conn);
        }

        if let Some(accept) = accept {
            let _ = accept.join();
        }
    }

    /// sets the value of `name`
    ///
    /// # Errors
    /// returns [`VarsError::InvalidArgument`] when `value` is empty and `name` already has a
    /// value. An empty value for a new name is accepted.
    pub fn write(&self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.commands.write_non_empty(name.into(), value.into())
    }

    /// broadcasts the current value of `name` to every registered peer, one after another.
    /// A peer that fails to receive it is logged and skipped.
    ///
    /// ## Returns
    /// `Ok(Some(value))` with the value that was broadcast.
    /// `Ok(None)` if `name` has no value. The miss is logged and nothing is sent.
    pub fn read(&self, name: &str) -> Result<Option<String>> {
        let value = match self.commands.read(name) {
            Ok(value) => value,
            Err(e @ VarsError::NotFound { .. }) => {
                self.ctx.logger.error(&e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        for address in self.peers() {
            if let Err(e) = self.send_to(&address, &value) {
                self.ctx.logger.error(&e);
            }
        }
        Ok(Some(value))
    }

    /// sends `data` to the peer registered under `address`. Nothing is sent, and no error is
    /// returned, if no such peer is registered.
    ///
    /// # Errors
    /// returns [`VarsError::InvalidArgument`] if `address` or `data` is empty, or an IO error
    /// if writing to the peer failed
    pub fn send_to(&self, address: &str, data: &str) -> Result<()> {
        if address.is_empty() {
            return Err(VarsError::InvalidArgument("address must not be empty".to_string()));
        }
        if data.is_empty() {
            return Err(VarsError::InvalidArgument("data must not be empty".to_string()));
        }

        // clone out of the map so the shard lock is not held while writing
        let conn = match self.ctx.peers.get(address) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(()),
        };
        conn.send(data.as_bytes(), self.ctx.settings.buffer_size)
    }
}

impl Drop for VarsServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Context {
    /// unregisters `conn` (unless the address was already taken over by a newer connection)
    /// and disposes it. Only the caller that actually tore it down logs the disconnection.
    fn disconnect_peer(&self, conn: &Arc<Connection>) -> bool {
        self.peers
            .remove_if(conn.peer(), |_, registered| Arc::ptr_eq(registered, conn));
        if conn.dispose() {
            self.logger.message(&format!("{} is disconnected.", conn.peer()));
            true
        } else {
            false
        }
    }

    /// wraps an accepted socket, registers it, and starts its reader thread
    fn register_peer(self: &Arc<Self>, stream: TcpStream, server_cancel: &CancelToken) -> Result<()> {
        stream.set_nonblocking(false)?;
        let conn = Arc::new(Connection::new(
            stream,
            server_cancel.child(),
            self.settings.timeout(),
        )?);
        let address = conn.peer().to_string();

        if let Some(replaced) = self.peers.insert(address.clone(), Arc::clone(&conn)) {
            if replaced.dispose() {
                self.logger.message(&format!("{} is disconnected.", &address));
            }
        }
        self.logger.message(&format!("{} is connected.", &address));

        let reader = {
            let ctx = Arc::clone(self);
            let conn = Arc::clone(&conn);
            move || read_from_client(ctx, conn)
        };
        if let Err(e) = thread::Builder::new()
            .name(format!("tcpvars-peer-{}", &address))
            .spawn(reader)
        {
            self.disconnect_peer(&conn);
            return Err(e.into());
        }
        Ok(())
    }
}

/// accepts connections until `cancel` fires, then closes the listener and clears `listening`.
/// Accept failures are logged and do not stop the loop.
fn accept_connections(
    ctx: Arc<Context>,
    listener: TcpListener,
    cancel: CancelToken,
    listening: Arc<AtomicBool>,
) {
    while !cancel.is_cancelled() {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("accepted connection from {}", addr);
                if let Err(e) = ctx.register_peer(stream, &cancel) {
                    ctx.logger.error(&e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                cancel.sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                ctx.logger.error(&e);
                cancel.sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    drop(listener);
    listening.store(false, Ordering::SeqCst);
    debug!("accept loop stopped");
}

/// logs whatever the peer sends until the peer, or the whole server, is cancelled or the
/// connection drops. On the way out the peer is unregistered and disposed.
fn read_from_client(ctx: Arc<Context>, conn: Arc<Connection>) {
    let token = conn.cancel_token().clone();
    let buffer_size = ctx.settings.buffer_size;
    let backoff = ctx.settings.timeout();

    loop {
        if token.is_cancelled() || !conn.is_connected() {
            break;
        }

        match conn.read_chunk(buffer_size) {
            Ok(Some(data)) => {
                ctx.logger
                    .message(&format!("From Client: {}", String::from_utf8_lossy(&data)));
            }
            Ok(None) => {
                token.sleep(backoff);
            }
            Err(e) if e.is_transient() => break,
            Err(e) => {
                ctx.logger.error(&e);
                break;
            }
        }
    }

    ctx.disconnect_peer(&conn);
}

/// every `check_time`, disconnects the registered peers whose connection is gone
fn check_peer_connections(ctx: Arc<Context>, cancel: CancelToken) {
    while cancel.sleep(ctx.settings.check_time()) {
        let dead: Vec<Arc<Connection>> = ctx
            .peers
            .iter()
            .filter(|entry| !entry.value().is_connected())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for conn in dead {
            ctx.disconnect_peer(&conn);
        }
    }
    debug!("liveness sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        lines: StdMutex<Vec<String>>,
    }

    impl Logger for Recorder {
        fn message(&self, message: &str) {
            self.lines.lock().unwrap().push(message.to_string());
        }
        fn error(&self, error: &dyn std::error::Error) {
            self.lines.lock().unwrap().push(error.to_string());
        }
    }

    fn server() -> (VarsServer, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let settings = Settings {
            timeout_ms: 100,
            check_time_ms: 20,
            ..Settings::new("127.0.0.1", 0)
        };
        let server = VarsServer::new(settings, recorder.clone()).unwrap();
        (server, recorder)
    }

    #[test]
    fn empty_value_for_existing_name_is_rejected() {
        let (server, _) = server();
        server.write("k", "v").unwrap();
        assert!(matches!(server.write("k", ""), Err(VarsError::InvalidArgument(_))));
        server.write("fresh", "").unwrap();
    }

    #[test]
    fn read_of_missing_name_logs_and_returns_none() {
        let (server, recorder) = server();
        assert!(server.read("missing").unwrap().is_none());
        let lines = recorder.lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("missing command not found")));
    }

    #[test]
    fn read_without_peers_returns_value() {
        let (server, _) = server();
        server.write("k", "v").unwrap();
        assert_eq!(server.read("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn send_to_validates_arguments() {
        let (server, _) = server();
        assert!(matches!(server.send_to("", "x"), Err(VarsError::InvalidArgument(_))));
        assert!(matches!(server.send_to("127.0.0.1:1", ""), Err(VarsError::InvalidArgument(_))));
    }

    #[test]
    fn send_to_unknown_peer_is_skipped() {
        let (server, _) = server();
        server.send_to("127.0.0.1:1", "hello").unwrap();
    }

    #[test]
    fn second_start_fails_with_already_running() {
        let (server, _) = server();
        server.start().unwrap();
        assert!(server.is_listening());
        assert!(matches!(server.start(), Err(VarsError::AlreadyRunning)));
        server.dispose();
        assert!(!server.is_listening());
    }

    #[test]
    fn stop_on_stopped_server_is_logged() {
        let (server, recorder) = server();
        server.stop();
        let lines = recorder.lines.lock().unwrap();
        assert_eq!(*lines, vec!["The server isn't running.".to_string()]);
    }

    fn context() -> (Arc<Context>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let ctx = Arc::new(Context {
            settings: Settings {
                timeout_ms: 100,
                ..Settings::new("127.0.0.1", 0)
            },
            logger: recorder.clone(),
            peers: DashMap::new(),
        });
        (ctx, recorder)
    }

    /// returns the accepted (server side) and connecting (client side) ends of a loopback socket
    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        (accepted, client)
    }

    fn disconnections(recorder: &Recorder) -> usize {
        recorder
            .lines
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.ends_with("is disconnected."))
            .count()
    }

    #[test]
    fn concurrent_disconnect_of_a_peer_happens_once() {
        let (ctx, recorder) = context();
        let (accepted, _client) = socket_pair();
        let conn = Arc::new(
            Connection::new(accepted, CancelToken::new(), Duration::from_millis(100)).unwrap(),
        );
        ctx.peers.insert(conn.peer().to_string(), Arc::clone(&conn));

        let performed = crossbeam_utils::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|_| s.spawn(|_| ctx.disconnect_peer(&conn)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|did_teardown| *did_teardown)
                .count()
        })
        .unwrap();

        assert_eq!(performed, 1);
        assert!(ctx.peers.is_empty());
        assert_eq!(disconnections(&recorder), 1);
    }

    #[test]
    fn stale_disconnect_leaves_the_newer_peer_registered() {
        let (ctx, _) = context();
        let (first, _first_client) = socket_pair();
        let (second, _second_client) = socket_pair();
        let stale = Arc::new(Connection::new(first, CancelToken::new(), Duration::ZERO).unwrap());
        let current =
            Arc::new(Connection::new(second, CancelToken::new(), Duration::ZERO).unwrap());
        // the newer connection took over the stale one's address
        ctx.peers.insert(stale.peer().to_string(), Arc::clone(&current));

        assert!(ctx.disconnect_peer(&stale));
        assert_eq!(ctx.peers.len(), 1);
        assert!(current.is_connected());
    }

    #[test]
    fn replaced_peer_is_disposed_and_logged() {
        let (ctx, recorder) = context();
        let (accepted, _client) = socket_pair();
        let address = accepted.peer_addr().unwrap().to_string();

        let (other, _other_client) = socket_pair();
        let replaced =
            Arc::new(Connection::new(other, CancelToken::new(), Duration::ZERO).unwrap());
        ctx.peers.insert(address.clone(), Arc::clone(&replaced));

        let server_cancel = CancelToken::new();
        ctx.register_peer(accepted, &server_cancel).unwrap();

        assert!(replaced.is_disposed());
        assert_eq!(ctx.peers.len(), 1);
        let registered = Arc::clone(ctx.peers.get(&address).unwrap().value());
        assert!(!Arc::ptr_eq(&registered, &replaced));
        let lines = recorder.lines.lock().unwrap().clone();
        let disconnected = lines
            .iter()
            .position(|line| line == &format!("{} is disconnected.", address));
        let connected = lines
            .iter()
            .position(|line| line == &format!("{} is connected.", address));
        assert!(disconnected.is_some());
        assert!(disconnected < connected);

        server_cancel.cancel();
    }

    #[test]
    fn server_can_restart_after_stop() {
        let (server, _) = server();
        server.start().unwrap();
        server.stop();
        assert!(!server.is_listening());
        assert!(server.local_addr().is_none());
        server.start().unwrap();
        assert!(server.is_listening());
    }
}
