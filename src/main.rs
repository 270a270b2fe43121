//! MRC gateway server binary
//!
//! Connects to the MRC through a serial port or a TCP serial-device server
//! and serves the framed client protocol on the listen endpoint. Shutdown
//! is signal driven; exit codes distinguish the common startup failures so
//! supervisors can react to them.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use mrcsrv::core::config::{GatewayConfig, ListenConfig};
use mrcsrv::core::transport::serial::{SerialConfig, SerialTransport};
use mrcsrv::core::transport::tcp::{TcpConfig, TcpTransport};
use mrcsrv::core::transport::traits::MrcTransport;
use mrcsrv::server::acceptor;

const EXIT_SUCCESS: u8 = 0;
const EXIT_OPTIONS_ERROR: u8 = 1;
const EXIT_ADDRESS_IN_USE: u8 = 2;
const EXIT_ADDRESS_NOT_AVAILABLE: u8 = 3;
const EXIT_PERMISSION_DENIED: u8 = 4;
const EXIT_BAD_LISTEN_ADDRESS: u8 = 5;
const EXIT_UNKNOWN_ERROR: u8 = 127;

/// Command line options
#[derive(Parser, Debug)]
#[command(
    name = "mrcsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Gateway server multiplexing clients onto one MRC remote control unit",
    after_help = "Examples:\n  \
        mrcsrv --mrc-serial-port /dev/ttyUSB0\n      \
        Use the first USB serial port and auto-detect the baud rate.\n  \
        mrcsrv --mrc-host example.com --mrc-port 8192\n      \
        Connect to the serial server listening on example.com:8192.\n  \
        mrcsrv --mrc-serial-port /dev/ttyUSB0 --listen-address 127.0.0.1\n      \
        Serial connection, serving clients on the loopback device only."
)]
struct Args {
    /// Connect to the MRC using this serial port (conflicts with --mrc-host)
    #[arg(long, conflicts_with = "mrc_host")]
    mrc_serial_port: Option<String>,

    /// Baud rate for the serial port; 0 means auto-detect
    #[arg(long, default_value_t = 0)]
    mrc_baud_rate: u32,

    /// Connect to the MRC using TCP to this host
    #[arg(long)]
    mrc_host: Option<String>,

    /// Port number used with --mrc-host
    #[arg(long, default_value_t = 4001)]
    mrc_port: u16,

    /// Server listen address (IPv4 dotted decimal or IPv6 hex notation)
    #[arg(long, default_value = "::")]
    listen_address: String,

    /// Server listen port
    #[arg(long, default_value_t = 23000)]
    listen_port: u16,

    /// Increase verbosity (can be used multiple times)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (can be used multiple times)
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    quiet: u8,
}

fn init_logging(verbose: u8, quiet: u8) {
    // -v / -q shift the default level; RUST_LOG still overrides.
    let levels = [
        LevelFilter::ERROR,
        LevelFilter::WARN,
        LevelFilter::INFO,
        LevelFilter::DEBUG,
        LevelFilter::TRACE,
    ];
    let idx = 2i32 + i32::from(verbose) - i32::from(quiet);
    let level = if idx < 0 {
        LevelFilter::OFF
    } else {
        levels[(idx as usize).min(levels.len() - 1)]
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(true)
        .init();
}

fn build_transport(args: &Args) -> Result<Box<dyn MrcTransport>, String> {
    if let Some(port) = &args.mrc_serial_port {
        let transport = SerialTransport::new(SerialConfig {
            port: port.clone(),
            baud_rate: args.mrc_baud_rate,
        })
        .map_err(|e| e.to_string())?;
        return Ok(Box::new(transport));
    }

    if let Some(host) = &args.mrc_host {
        let transport = TcpTransport::new(TcpConfig {
            host: host.clone(),
            port: args.mrc_port,
        })
        .map_err(|e| e.to_string())?;
        return Ok(Box::new(transport));
    }

    Err("neither --mrc-serial-port nor --mrc-host given".to_string())
}

fn bind_exit_code(e: &io::Error) -> u8 {
    match e.kind() {
        io::ErrorKind::AddrInUse => EXIT_ADDRESS_IN_USE,
        io::ErrorKind::AddrNotAvailable => EXIT_ADDRESS_NOT_AVAILABLE,
        io::ErrorKind::PermissionDenied => EXIT_PERMISSION_DENIED,
        io::ErrorKind::InvalidInput => EXIT_BAD_LISTEN_ADDRESS,
        _ => EXIT_UNKNOWN_ERROR,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = if e.use_stderr() {
                EXIT_OPTIONS_ERROR
            } else {
                // --help / --version output
                EXIT_SUCCESS
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    init_logging(args.verbose, args.quiet);

    let transport = match build_transport(&args) {
        Ok(transport) => transport,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_OPTIONS_ERROR);
        }
    };

    let listen = ListenConfig {
        address: args.listen_address.clone(),
        port: args.listen_port,
    };
    let listen_addr = match listen.socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(EXIT_BAD_LISTEN_ADDRESS);
        }
    };

    let listener = match acceptor::bind(listen_addr) {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Error: failed to bind {listen_addr}: {e}");
            return ExitCode::from(bind_exit_code(&e));
        }
    };

    let gateway = match mrcsrv::server::start(transport, listener, GatewayConfig::default()) {
        Ok(gateway) => gateway,
        Err(e) => {
            eprintln!("Error: failed starting the gateway: {e}");
            return ExitCode::from(EXIT_UNKNOWN_ERROR);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "mrcsrv started");

    mrcsrv::wait_for_shutdown().await;
    info!("shutdown signal received");
    gateway.stop();

    // Give the tasks a moment to close sockets cleanly.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    info!("mrcsrv exiting");
    ExitCode::from(EXIT_SUCCESS)
}
