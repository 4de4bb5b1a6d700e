//! The tcpvars-client executable connects to a tcpvars server and runs a short demo:
//!
//! `tcpvars-client [--addr IP-PORT] [--timeout MS] [--reconnect N]`
//!
//!     Writes two names and sends them to the server, then disconnects and waits for Enter.
//!     --addr accepts an IP address, either v4 or v6, and a port number, with the format IP:PORT. If --addr is not specified then connect on 127.0.0.1:13005.
//!     --timeout is how long each connect attempt may take, --reconnect how many times to retry.
//!     Print an error and return a non-zero exit code if an operation fails, or if IP-PORT does not parse as an address.
//!
//! `tcpvars-client -V`
//!
//!     Print the version.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{crate_version, App, Arg, ArgMatches};
use tcpvars::{Result, Settings, TracingLogger, VarsClient, VarsError};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:13005";

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    /// the server's ip:port
    addr: SocketAddr,
    timeout_ms: Option<u64>,
    reconnect_count: Option<u32>,
}

impl Opt {
    /// converts the options into client [`Settings`], keeping the defaults for anything that
    /// was not given
    fn settings(&self) -> Settings {
        let mut settings = Settings::new(self.addr.ip().to_string(), self.addr.port());
        if let Some(timeout_ms) = self.timeout_ms {
            settings.timeout_ms = timeout_ms;
        }
        if let Some(reconnect_count) = self.reconnect_count {
            settings.reconnect_count = reconnect_count;
        }
        settings
    }
}

fn main() {
    // configure a subscriber that will log messages to STDERR
    subscriber_config();

    let matches = App::new("tcpvars-client")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("sends named values to a tcpvars server")
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help("sets the IP_ADDR:PORT of the server to connect to")
                .default_value(DEFAULT_ADDRESS),
        )
        .arg(
            Arg::with_name("timeout")
                .long("timeout")
                .value_name("MS")
                .help("milliseconds a single connect attempt may take"),
        )
        .arg(
            Arg::with_name("reconnect")
                .long("reconnect")
                .value_name("N")
                .help("number of connect retries"),
        )
        .get_matches();

    let result = parse_options(&matches).and_then(run);
    if let Err(e) = result {
        eprintln!("{}", e);
        exit(1);
    }
}

/// runs the demo sequence against the server described by `opt`
fn run(opt: Opt) -> Result<()> {
    let client = VarsClient::new(opt.settings(), Arc::new(TracingLogger))?;
    thread::sleep(Duration::from_millis(100));

    client.connect()?;
    client.write("test", "Test_From_Client.")?;
    client.read("test")?;
    // never written, logs a miss
    client.read("test1")?;
    thread::sleep(Duration::from_millis(300));
    client.write("test1", "Second_Tect_From_Client.")?;
    client.read("test1")?;
    client.disconnect();
    thread::sleep(Duration::from_millis(1000));

    println!("Press Enter for exit.");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

/// parses the matches from the command line into an [`Opt`] struct
fn parse_options(matches: &ArgMatches) -> Result<Opt> {
    let addr = matches.value_of("addr").unwrap_or(DEFAULT_ADDRESS);
    let addr: SocketAddr = addr.parse().map_err(|_| {
        VarsError::Parsing(format!("could not parse {} into an IP address and port", &addr))
    })?;

    let timeout_ms = match matches.value_of("timeout") {
        Some(ms) => Some(ms.parse::<u64>().map_err(|_| {
            VarsError::Parsing(format!("timeout must be a number of milliseconds, got {}", ms))
        })?),
        None => None,
    };
    let reconnect_count = match matches.value_of("reconnect") {
        Some(n) => Some(n.parse::<u32>().map_err(|_| {
            VarsError::Parsing(format!("reconnect must be a number, got {}", n))
        })?),
        None => None,
    };

    Ok(Opt {
        addr,
        timeout_ms,
        reconnect_count,
    })
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than TRACE (e.g, debug, info, warn, etc.)
        // will be written to stderr.
        .with_max_level(Level::TRACE)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting tracing default subscriber failed: {}", e);
    }
}
