//! OS termination signals for root daemons.

use std::future::Future;
use std::thread::{self, JoinHandle};

use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::command::{DaemonCommand, Params};
use super::core::Daemon;

/// Background watcher that ends a root daemon on SIGTERM/SIGINT.
/// Dropping it stops the watcher if no signal has arrived yet.
pub(crate) struct SignalWatcher {
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    /// Stop watching and wait for the watcher thread to exit.
    ///
    /// Must only be called once the root's mailbox is closed, otherwise a
    /// watcher that is mid-submit would never return.
    pub(crate) fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("signal watcher panicked");
            }
        }
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

pub(crate) fn spawn_watcher(root: &Daemon) -> Option<SignalWatcher> {
    spawn_with(root, wait_for_termination)
}

/// Run `trigger` on a watcher thread and end `root` when it yields a signal
/// name. `trigger` must resolve to `None` once its stop receiver fires.
fn spawn_with<F, Fut>(root: &Daemon, trigger: F) -> Option<SignalWatcher>
where
    F: FnOnce(oneshot::Receiver<()>) -> Fut + Send + 'static,
    Fut: Future<Output = Option<&'static str>>,
{
    let (stop_tx, stop_rx) = oneshot::channel();
    let daemon = root.clone();

    let spawned = thread::Builder::new()
        .name(format!("{}-signals", root.name()))
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(daemon = %daemon.name(), error = %e, "failed to start signal runtime");
                    return;
                }
            };

            let Some(signal) = runtime.block_on(trigger(stop_rx)) else {
                debug!(daemon = %daemon.name(), "signal watcher stopped");
                return;
            };

            info!(daemon = %daemon.name(), signal, "termination signal received");
            match daemon.submit_command(DaemonCommand::end(), Params::new()) {
                Ok(_) => info!(daemon = %daemon.name(), "graceful shutdown complete"),
                Err(e) => {
                    error!(daemon = %daemon.name(), error = %e, "graceful shutdown did not complete")
                }
            }
        });

    match spawned {
        Ok(thread) => Some(SignalWatcher {
            stop: Some(stop_tx),
            thread: Some(thread),
        }),
        Err(e) => {
            error!(daemon = %root.name(), error = %e, "failed to spawn signal watcher");
            None
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination(stop: oneshot::Receiver<()>) -> Option<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to register signal handlers");
            return None;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => Some("SIGTERM"),
        _ = sigint.recv() => Some("SIGINT"),
        _ = stop => None,
    }
}

#[cfg(not(unix))]
async fn wait_for_termination(stop: oneshot::Receiver<()>) -> Option<&'static str> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.ok().map(|_| "Ctrl+C"),
        _ = stop => None,
    }
}
