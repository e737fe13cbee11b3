//! qotd: a quote of the day server (RFC 865)
//!
//! Every TCP connection or UDP datagram is answered with one quote drawn
//! from a quotes file, after which the connection is closed.
//!
//! Features:
//! - TCP and/or UDP over IPv4, IPv6 or both
//! - Line, `%`-divided or whole-file quote corpora
//! - A quote per day or a fresh quote per request
//! - Reload of configuration and quotes on SIGHUP
//! - Configuration via CLI arguments or TOML file

mod config;
mod corpus;
mod listener;
mod quote;
mod service;
mod signals;

use config::{CliArgs, Config};
use service::{Service, ServiceError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    // Load configuration
    let (cli, config) = match Config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(ServiceError::from(e).exit_code());
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        transport = ?config.transport,
        family = ?config.family,
        quotes_file = %config.quotes_file.display(),
        divider = ?config.divider,
        daily = config.daily,
        pad = config.pad,
        allow_big = config.allow_big,
        "Starting qotd server"
    );

    let code = match run(cli, config) {
        Ok(code) => code,
        Err(e) => service::fatal(&e),
    };

    info!(code, "Quitting");
    std::process::exit(code);
}

fn run(cli: CliArgs, config: Config) -> Result<i32, ServiceError> {
    let service = Service::start(cli, config)?;

    if let Err(e) = signals::spawn(service.handle()) {
        warn!(error = %e, "Signal handlers unavailable, reload on SIGHUP is disabled");
    }

    service.run()
}
