//! this binary starts a tcpvars server and runs a short demo against whoever connects
//! to see the list of options, type: `tcpvars-server --help`
//!
//! The demo writes two names and broadcasts them to every connected client, then waits for
//! Enter before shutting the server down.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{crate_version, App, Arg};
use tcpvars::{Result, Settings, TracingLogger, VarsError, VarsServer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_ADDRESS: &str = "127.0.0.1:13005";

/// ['Opt'] holds parsed and validated options from the command line
#[derive(Debug)]
struct Opt {
    addr: SocketAddr,
}

impl Opt {
    /// validates the `addr` parameter is a valid IP address and PORT
    /// # Errors
    /// returns [`VarsError::Parsing`] if the address is invalid
    fn build(addr: &str) -> Result<Opt> {
        let addr: SocketAddr = addr.parse().map_err(|_| {
            VarsError::Parsing(format!("could not parse {} into an IP address and port", &addr))
        })?;
        Ok(Opt { addr })
    }
}

fn main() {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    let matches = App::new("tcpvars-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("shares named values with connected tcpvars clients")
        .arg(
            Arg::with_name("addr")
                .long("addr")
                .value_name("IP_ADDR:PORT")
                .help("sets the IP_ADDR:PORT that the server listens on")
                .default_value(DEFAULT_ADDRESS),
        )
        .get_matches();

    let addr = matches.value_of("addr").unwrap_or(DEFAULT_ADDRESS);
    let opt = match Opt::build(addr) {
        Ok(opt) => opt,
        Err(err) => {
            eprintln!("{}", err);
            exit(1);
        }
    };

    if let Err(e) = run(opt) {
        eprintln!("{}", e);
        exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    info!("tcpvars-server {}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", opt.addr);

    let settings = Settings::new(opt.addr.ip().to_string(), opt.addr.port());
    let server = VarsServer::new(settings, Arc::new(TracingLogger))?;
    server.start()?;

    // nothing written yet, logs a miss
    server.read("test")?;
    thread::sleep(Duration::from_millis(300));
    server.write("test", "Test_From_Server.")?;
    server.read("test")?;
    server.read("test1")?;
    server.write("test1", "Second_From_Server.")?;
    server.read("test1")?;
    thread::sleep(Duration::from_millis(1000));

    println!("Press Enter for exit.");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;

    server.dispose();
    Ok(())
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
