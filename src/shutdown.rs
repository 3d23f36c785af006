//! Process shutdown: signal handling plus runtime drain.
//!
//! Runtimes must stay registered (reachable for stop/retry) for as long as
//! the process lives, so shutdown is two-phase: wait for a termination
//! signal or a programmatic request, then give live runtimes a bounded
//! grace period to reach a final status before the registry is cleared.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::runtime::RuntimeRegistry;

/// How often the drain re-checks live runtimes.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct ShutdownCoordinator {
    registry: RuntimeRegistry,
    requested: Arc<watch::Sender<bool>>,
}

impl ShutdownCoordinator {
    pub fn new(registry: RuntimeRegistry) -> Self {
        let (requested, _) = watch::channel(false);
        Self {
            registry,
            requested: Arc::new(requested),
        }
    }

    /// Request shutdown programmatically; safe to call more than once.
    pub fn request_shutdown(&self) {
        if !self.requested.send_replace(true) {
            info!("shutdown requested");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Resolves once shutdown is requested; immediately if it already was.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.requested.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Block until a termination signal or programmatic request, then drain
    /// live runtimes for at most `grace` and clear the registry.
    pub async fn run_until_shutdown(&self, grace: Duration) {
        tokio::select! {
            _ = self.wait_for_shutdown() => {}
            _ = termination_signal() => self.request_shutdown(),
        }
        self.drain_runtimes(grace).await;
        self.registry.clear();
        info!("runtime registry cleared");
    }

    /// Poll registered runtimes until every run is final or `grace` elapses.
    async fn drain_runtimes(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let mut active = 0usize;
            for workflow in self.registry.workflows() {
                if !workflow.status().await.is_final() {
                    active += 1;
                }
            }
            if active == 0 {
                info!("all runtimes drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(active, "grace period elapsed with runtimes still active");
                return;
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                }
            }
            Err(e) => {
                warn!("no SIGTERM handler, listening for ctrl-c only: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
