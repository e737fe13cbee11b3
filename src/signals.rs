//! Translates process signals into control events.
//!
//! - SIGHUP: reload
//! - SIGTERM: shut down, exit 0
//! - SIGINT: shut down, exit with the signal status

use crate::service::{exit, ControlEvent, ControlHandle};
use std::io;
use std::sync::mpsc;
use std::thread;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info};

struct Signals {
    hangup: Signal,
    terminate: Signal,
    interrupt: Signal,
}

impl Signals {
    fn register() -> io::Result<Self> {
        Ok(Signals {
            hangup: signal(SignalKind::hangup())?,
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
        })
    }

    async fn next(&mut self) -> ControlEvent {
        tokio::select! {
            _ = self.hangup.recv() => {
                info!("Hangup received, reloading");
                ControlEvent::Reload
            }
            _ = self.terminate.recv() => {
                info!("Termination signal received, exiting");
                ControlEvent::Shutdown { code: exit::SUCCESS }
            }
            _ = self.interrupt.recv() => {
                info!("Interrupt signal received, exiting");
                ControlEvent::Shutdown { code: exit::SIGNAL }
            }
        }
    }

    async fn forward(mut self, handle: ControlHandle) {
        loop {
            let event = self.next().await;
            let stop = matches!(event, ControlEvent::Shutdown { .. });
            if !handle.send(event) || stop {
                return;
            }
        }
    }
}

/// Start the signal thread.
///
/// Returns once the handlers are installed, so signals sent after this
/// call are never delivered with their default action.
pub fn spawn(handle: ControlHandle) -> io::Result<thread::JoinHandle<()>> {
    let (ready_tx, ready_rx) = mpsc::sync_channel::<io::Result<()>>(1);

    let thread = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            runtime.block_on(async move {
                let signals = match Signals::register() {
                    Ok(signals) => signals,
                    Err(e) => {
                        error!(error = %e, "Unable to install signal handlers");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok(()));
                signals.forward(handle).await;
            });
        })?;

    ready_rx
        .recv()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "signal thread exited early"))??;

    Ok(thread)
}
