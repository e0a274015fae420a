//! Hogimap - IMAP Session Server
//!
//! This is the main entry point. It loads the configuration, sets up
//! logging, and starts one listener per configured server.

use hogimap::config::Config;
use hogimap::server::run_servers;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Exit code for command-line usage errors, distinct from the
/// configuration loading codes
const EXIT_USAGE: i32 = 64;

/// Command-line options
#[derive(Debug, PartialEq)]
struct Args {
    /// Path to the JSON configuration file
    config_file: Option<PathBuf>,
    /// Log level when RUST_LOG is not set
    log_level: Level,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config_file: None,
            log_level: Level::INFO,
        }
    }
}

/// What the command line asked for
#[derive(Debug, PartialEq)]
enum Command {
    Run(Args),
    Help,
    Version,
}

impl Args {
    /// Parse options from command-line arguments, exiting on usage errors
    fn from_args() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();

        match Self::parse(&args) {
            Ok(Command::Run(parsed)) => parsed,
            Ok(Command::Help) => {
                print_help();
                std::process::exit(0);
            }
            Ok(Command::Version) => {
                println!("Hogimap version {}", hogimap::VERSION);
                std::process::exit(0);
            }
            Err(message) => {
                eprintln!("Error: {}", message);
                print_help();
                std::process::exit(EXIT_USAGE);
            }
        }
    }

    /// Parse options, program name excluded
    fn parse(args: &[String]) -> Result<Command, String> {
        let mut parsed = Args::default();
        let mut args = args.iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config-file" | "-c" => {
                    let value = args.next().ok_or("--config-file requires a value")?;
                    parsed.config_file = Some(PathBuf::from(value));
                }
                "--log-level" | "-l" => {
                    let value = args.next().ok_or("--log-level requires a value")?;
                    parsed.log_level = value
                        .parse()
                        .map_err(|_| format!("invalid log level '{}'", value))?;
                }
                "--help" => return Ok(Command::Help),
                "--version" | "-v" => return Ok(Command::Version),
                other => return Err(format!("unknown argument: {}", other)),
            }
        }

        Ok(Command::Run(parsed))
    }
}

fn print_help() {
    println!(
        r#"
Hogimap - IMAP Session Server

USAGE:
    hogimap [OPTIONS]

OPTIONS:
    -c, --config-file <PATH>   JSON configuration file (default: built-in)
    -l, --log-level <LEVEL>    trace, debug, info, warn or error (default: info)
    -v, --version              Print version information
        --help                 Print this help message

EXIT CODES:
    1   configuration file could not be read
    2   unsupported configuration file extension
    3   configuration file could not be parsed
    64  invalid command-line usage

EXAMPLES:
    hogimap                                  # One server on 0.0.0.0:143
    hogimap --config-file config.json        # Servers from a file
    RUST_LOG=hogimap=trace hogimap           # Log every line on the wire

CONNECTING:
    $ openssl s_client -starttls imap -connect localhost:143
    . CAPABILITY
    * CAPABILITY IMAP4rev1 STARTTLS AUTH=PLAIN
    . OK CAPABILITY completed
"#
    );
}

/// Loads the configuration, exiting with its error code on failure.
fn load_config(path: Option<&PathBuf>) -> Config {
    let Some(path) = path else {
        return Config::default();
    };

    Config::load(path).unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(e.exit_code());
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let args = Args::from_args();

    let config = load_config(args.config_file.as_ref());
    println!("{}", config.to_pretty_json());

    // Set up logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str().to_lowercase()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    info!(servers = config.servers.len(), "Hogimap v{} starting", hogimap::VERSION);

    // Set up graceful shutdown
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping servers..."),
            Err(e) => {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = run_servers(Arc::new(config)) => {}
        _ = shutdown => {}
    }

    info!("Server shutdown complete");
    Ok(())
}
