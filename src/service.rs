//! Service lifecycle.
//!
//! Wires the configuration to the corpus store and the listener, runs the
//! serving loop, and applies reload and shutdown requests delivered over
//! the control channel.

use crate::config::{CliArgs, Config, ConfigError};
use crate::corpus::{CorpusError, CorpusStore};
use crate::listener::{Listener, ListenerError, QuoteSource, SocketKind};
use crate::quote::{QuoteOptions, QuoteSelector};
use mio::Waker;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Process exit codes.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const CONFIGURATION: i32 = 18;
    pub const IO: i32 = 21;
    pub const SIGNAL: i32 = 22;
}

/// Requests delivered to the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Re-read configuration and quotes, re-bind if connection settings changed.
    Reload,
    /// Close everything and exit with `code`.
    Shutdown { code: i32 },
}

/// Cloneable sender for control events.
#[derive(Clone)]
pub struct ControlHandle {
    tx: Sender<ControlEvent>,
    waker: Arc<Waker>,
}

impl ControlHandle {
    pub(crate) fn new(tx: Sender<ControlEvent>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Queue an event and wake the serving loop.
    ///
    /// Returns `false` once the service has stopped.
    pub fn send(&self, event: ControlEvent) -> bool {
        if self.tx.send(event).is_err() {
            return false;
        }

        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Unable to wake the serving loop");
            return false;
        }

        true
    }

    pub fn reload(&self) -> bool {
        self.send(ControlEvent::Reload)
    }

    pub fn shutdown(&self, code: i32) -> bool {
        self.send(ControlEvent::Shutdown { code })
    }
}

/// Renders quotes for the listener from the active corpus.
struct Responder<'a> {
    store: &'a mut CorpusStore,
    selector: &'a mut QuoteSelector,
    options: QuoteOptions,
}

impl QuoteSource for Responder<'_> {
    fn next_quote(&mut self) -> Option<&[u8]> {
        self.store.refresh_or_keep();
        let corpus = self.store.corpus();

        match self.selector.select_and_format(&corpus, &self.options) {
            Ok(quote) => Some(quote),
            Err(e) => {
                warn!(error = %e, "No quote to send");
                None
            }
        }
    }
}

/// The running service and everything it owns.
pub struct Service {
    cli: CliArgs,
    config: Config,
    store: CorpusStore,
    selector: QuoteSelector,
    listener: Listener,
    control: Receiver<ControlEvent>,
    handle: ControlHandle,
}

impl Service {
    /// Open the quotes file and bind the sockets.
    ///
    /// Any failure here is fatal to the caller.
    pub fn start(cli: CliArgs, config: Config) -> Result<Self, ServiceError> {
        let store = CorpusStore::open(&config.quotes_file, config.divider)?;

        let mut listener = Listener::new()?;
        listener.bind(config.connection())?;

        let (tx, control) = mpsc::channel();
        let handle = ControlHandle::new(tx, listener.waker());

        Ok(Service {
            cli,
            config,
            store,
            selector: QuoteSelector::new(),
            listener,
            control,
            handle,
        })
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    #[cfg(test)]
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addrs(&self) -> Vec<(SocketKind, SocketAddr)> {
        self.listener.local_addrs()
    }

    /// Serve until a shutdown event or a fatal error.
    ///
    /// Returns the requested exit code.
    pub fn run(mut self) -> Result<i32, ServiceError> {
        info!(addrs = ?self.local_addrs(), "Serving quotes");

        loop {
            let woken = {
                let mut responder = Responder {
                    store: &mut self.store,
                    selector: &mut self.selector,
                    options: QuoteOptions::from(&self.config),
                };
                self.listener.poll_once(&mut responder)
            };

            let woken = match woken {
                Ok(woken) => woken,
                Err(e) => {
                    self.listener.close();
                    return Err(e.into());
                }
            };

            if !woken {
                continue;
            }

            while let Ok(event) = self.control.try_recv() {
                debug!(?event, "Control event");
                match event {
                    ControlEvent::Reload => self.reload()?,
                    ControlEvent::Shutdown { code } => {
                        self.shutdown();
                        return Ok(code);
                    }
                }
            }
        }
    }

    /// Re-read configuration, then the quotes, then re-bind if needed.
    ///
    /// Failures keep the previous state. The only error returned is a
    /// socket set that could neither be re-bound nor restored.
    pub fn reload(&mut self) -> Result<(), ServiceError> {
        info!("Reloading configuration settings");

        let config = match Config::resolve(&self.cli) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Unable to reload configuration, keeping previous settings");
                return Ok(());
            }
        };

        self.reload_corpus(&config);

        let connection = config.connection();
        if self.listener.connection() != Some(connection) {
            info!(?connection, "Connection settings changed, remaking sockets");
            if let Err(e) = self.listener.rebind(connection) {
                self.listener.close();
                return Err(e.into());
            }
        }

        self.config = Config {
            quotes_file: self.store.path().to_path_buf(),
            divider: self.store.divider(),
            ..config
        };
        if let Some(active) = self.listener.connection() {
            self.config.transport = active.transport;
            self.config.family = active.family;
            self.config.port = active.port;
        }

        Ok(())
    }

    fn reload_corpus(&mut self, config: &Config) {
        if config.quotes_file != self.store.path() || config.divider != self.store.divider() {
            info!(path = %config.quotes_file.display(), "Quotes file changed, opening new file");
            match CorpusStore::open(&config.quotes_file, config.divider) {
                Ok(store) => self.store = store,
                Err(e) => warn!(error = %e, "Unable to open new quotes file, keeping previous quotes"),
            }
        } else if let Err(e) = self.store.reload() {
            warn!(error = %e, "Unable to reload quotes file, keeping previous quotes");
        }
    }

    /// Close the sockets. The corpus goes with `self`.
    fn shutdown(&mut self) {
        info!(state = ?self.listener.state(), "Shutting down");
        self.listener.close();
    }
}

/// Errors that stop the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Corpus(#[from] CorpusError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ServiceError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceError::Config(ConfigError::FileRead(..)) => exit::IO,
            ServiceError::Config(ConfigError::TomlParse(..)) => exit::CONFIGURATION,
            ServiceError::Corpus(CorpusError::Io(..)) => exit::IO,
            ServiceError::Corpus(CorpusError::NoDelimiter | CorpusError::Empty) => {
                exit::CONFIGURATION
            }
            ServiceError::Listener(_) | ServiceError::Io(_) => exit::IO,
        }
    }
}

/// Log a fatal error and produce the exit code for it.
pub fn fatal(error: &ServiceError) -> i32 {
    let code = error.exit_code();
    error!(error = %error, code, "Fatal error");
    code
}
