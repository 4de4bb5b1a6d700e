use std::error::Error;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tcpvars::{Logger, Settings, VarsClient, VarsServer};

/// a [`Logger`] that keeps every line it receives
#[derive(Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<String>>,
}

impl RecordingLogger {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl Logger for RecordingLogger {
    fn message(&self, message: &str) {
        self.lines.lock().unwrap().push(message.to_string());
    }

    fn error(&self, error: &dyn Error) {
        self.lines.lock().unwrap().push(error.to_string());
    }
}

/// settings with short timeouts so the background loops react quickly
pub fn fast_settings(port: u16) -> Settings {
    Settings {
        timeout_ms: 200,
        check_time_ms: 20,
        reconnect_count: 2,
        ..Settings::new("127.0.0.1", port)
    }
}

/// starts a server on `port` (0 picks a free one)
pub fn start_server(port: u16) -> (VarsServer, Arc<RecordingLogger>) {
    let logger = Arc::new(RecordingLogger::default());
    let server = VarsServer::new(fast_settings(port), logger.clone()).unwrap();
    server.start().unwrap();
    (server, logger)
}

/// creates a client for the running `server`
pub fn client_for(server: &VarsServer) -> (VarsClient, Arc<RecordingLogger>) {
    let port = server.local_addr().unwrap().port();
    let logger = Arc::new(RecordingLogger::default());
    let client = VarsClient::new(fast_settings(port), logger.clone()).unwrap();
    (client, logger)
}

/// polls `condition` until it holds or five seconds pass
pub fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
