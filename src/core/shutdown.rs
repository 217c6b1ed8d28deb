//! Signal handling as cancellation.
//!
//! SIGINT/SIGTERM never interrupt an agent invocation in flight. The first
//! signal moves the shared state to [`ShutdownState::Requested`]; the
//! controller notices it once the current invocation returns and runs its
//! single shutdown path. A second signal escalates to
//! [`ShutdownState::Forced`], which makes the executor kill the child so that
//! same path runs sooner.

use std::path::Path;

use tokio::sync::watch;

use crate::fs::remove_capture_files;

/// Shutdown progress shared between the signal listener and the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    /// Finish the current invocation, then stop.
    Requested,
    /// Kill the current invocation, then stop.
    Forced,
}

impl ShutdownState {
    /// Returns the state after one more signal.
    #[must_use]
    pub const fn escalate(self) -> Self {
        match self {
            Self::Running => Self::Requested,
            Self::Requested | Self::Forced => Self::Forced,
        }
    }
}

/// Sending half: records signals.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<ShutdownState>,
}

impl ShutdownController {
    /// Creates a controller in the `Running` state and its first observer.
    #[must_use]
    pub fn new() -> (Self, ShutdownSignal) {
        let (tx, rx) = watch::channel(ShutdownState::Running);
        (Self { tx }, ShutdownSignal { rx })
    }

    /// Records one signal and returns the resulting state.
    pub fn request(&self) -> ShutdownState {
        let mut next = ShutdownState::Running;
        self.tx.send_modify(|state| {
            *state = state.escalate();
            next = *state;
        });
        next
    }

    /// Returns another observer of this controller.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half: cheap to clone and poll.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<ShutdownState>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn state(&self) -> ShutdownState {
        *self.rx.borrow()
    }

    /// Returns true once any shutdown has been requested.
    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    /// Resolves once shutdown has been requested. Never resolves if the
    /// sending side is gone without having requested it.
    pub async fn requested(&self) {
        self.wait_for(ShutdownState::Requested).await;
    }

    /// Resolves once shutdown has been forced.
    pub async fn forced(&self) {
        self.wait_for(ShutdownState::Forced).await;
    }

    async fn wait_for(&self, at_least: ShutdownState) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|state| *state >= at_least).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Listens for SIGINT/SIGTERM for the rest of the process lifetime.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be registered.
pub fn install_signal_handlers() -> std::io::Result<ShutdownSignal> {
    let (controller, signal) = ShutdownController::new();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = sigint.recv() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                };
                on_signal(&controller, name);
            }
        });
    }

    #[cfg(not(unix))]
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            on_signal(&controller, "Ctrl-C");
        }
    });

    Ok(signal)
}

fn on_signal(controller: &ShutdownController, name: &str) {
    match controller.request() {
        ShutdownState::Requested => tracing::warn!(
            "{name} received; finishing the current invocation before stopping (signal again to force)"
        ),
        ShutdownState::Forced => {
            tracing::warn!("{name} received again; killing the current invocation");
        }
        ShutdownState::Running => {}
    }
}

/// Deletes transient capture files left in the log directory.
pub fn cleanup_transient(log_dir: &Path) -> usize {
    let removed = remove_capture_files(log_dir);
    if removed > 0 {
        tracing::debug!(removed, "removed transient capture files");
    }
    removed
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn escalation_is_monotonic() {
        assert_eq!(ShutdownState::Running.escalate(), ShutdownState::Requested);
        assert_eq!(ShutdownState::Requested.escalate(), ShutdownState::Forced);
        assert_eq!(ShutdownState::Forced.escalate(), ShutdownState::Forced);
    }

    #[test]
    fn request_escalates_shared_state() {
        let (controller, signal) = ShutdownController::new();
        let other = controller.subscribe();

        assert!(!signal.is_requested());
        assert_eq!(controller.request(), ShutdownState::Requested);
        assert!(signal.is_requested());
        assert_eq!(other.state(), ShutdownState::Requested);
        assert_eq!(controller.request(), ShutdownState::Forced);
        assert_eq!(controller.request(), ShutdownState::Forced);
        assert_eq!(signal.state(), ShutdownState::Forced);
    }

    #[tokio::test]
    async fn requested_resolves_after_request() {
        let (controller, signal) = ShutdownController::new();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            controller.request();
            // Keep the sender alive so the wait resolves on the value.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        tokio::time::timeout(Duration::from_millis(150), signal.requested())
            .await
            .expect("requested() should resolve after a request");
    }

    #[tokio::test]
    async fn forced_does_not_resolve_on_first_request() {
        let (controller, signal) = ShutdownController::new();
        controller.request();

        let forced = tokio::time::timeout(Duration::from_millis(50), signal.forced()).await;
        assert!(forced.is_err());

        controller.request();
        tokio::time::timeout(Duration::from_millis(50), signal.forced())
            .await
            .expect("forced() should resolve after the second request");
    }

    #[tokio::test]
    async fn dropped_controller_never_resolves() {
        let (controller, signal) = ShutdownController::new();
        drop(controller);

        let waited = tokio::time::timeout(Duration::from_millis(30), signal.requested()).await;
        assert!(waited.is_err());
        assert!(!signal.is_requested());
    }

    #[test]
    fn cleanup_transient_removes_capture_files() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join(".capture-1"), "partial").unwrap();
        std::fs::write(temp.path().join("ralph-20240101-000000.log"), "log").unwrap();

        assert_eq!(cleanup_transient(temp.path()), 1);
        assert!(temp.path().join("ralph-20240101-000000.log").exists());
    }
}
