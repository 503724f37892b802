//! Run-wide stop signal (CTRL+C, SIGTERM, timeouts)
//!
//! `StopHandle::trigger` flips a watch channel; every pipeline holds a cloned
//! `StopSignal` and selects on `stopped()` at its suspension points.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

/// Exit status after a second interrupt (128 + SIGINT)
const FORCED_EXIT_CODE: i32 = 130;

/// Sending side, owned by whoever decides the run must end
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Receiving side, cheap to clone into each pipeline
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

/// Create a linked handle/signal pair
pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopSignal {
    /// Signal that never fires, for callers without cancellation
    pub fn never() -> Self {
        let (handle, signal) = stop_channel();
        // Dropping the sender leaves the value at `false` for good
        drop(handle);
        signal
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once a stop was requested. Pends forever if the handle is gone untriggered.
    pub async fn stopped(&mut self) {
        let closed = self.rx.wait_for(|stopped| *stopped).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Trigger `handle` on SIGINT or SIGTERM.
///
/// The first signal asks the run to stop and report what it has; a second one
/// exits immediately. Handlers are registered before this returns.
#[cfg(unix)]
pub fn listen_for_signals(handle: StopHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "Interrupt",
            _ = terminate.recv() => "Termination signal",
        };
        warn!("{} received, stopping monitoring...", name);
        handle.trigger();

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        warn!("Second signal received, exiting without a report");
        std::process::exit(FORCED_EXIT_CODE);
    }))
}

/// Trigger `handle` on CTRL+C; a second CTRL+C exits immediately.
#[cfg(not(unix))]
pub fn listen_for_signals(handle: StopHandle) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        warn!("Interrupt received, stopping monitoring...");
        handle.trigger();

        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt received, exiting without a report");
            std::process::exit(FORCED_EXIT_CODE);
        }
    }))
}
