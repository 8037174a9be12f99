// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The service monitor core: lifecycle state, the maintenance loop, and the
//! shutdown discipline shared by every role controller.
//!
//! The core owns the three cross-task signals (`shutdown`, `wake`,
//! `restart`) and exposes a single cancellable bounded wait over them; the
//! maintenance loop and both of the dependent controller's blocking
//! bootstrap phases go through it. Waits are always bounded so a missed
//! signal self-heals on the next poll.

use crate::config::Config;
use crate::middleware::MiddlewareClient;
use crate::platform::OrchestrationClient;
use crate::roles::RoleController;
use idstore::IdentityStore;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use warden_certificates::CertificateManager;

/// Lifecycle state of the monitor.
///
/// Transitions are one-directional except `Operational` ⇄ `ShuttingDown`.
/// Installer nodes never get past `Uninitialized`; principal and extension
/// nodes skip straight to `Operational`; dependent nodes pass through both
/// `Awaiting…` states.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Uninitialized,
    AwaitingOwnCertificate,
    AwaitingMiddlewareCertificates,
    Operational,
    ShuttingDown,
}

/// What a bounded wait observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// An event source asked for an early cycle.
    Woken,
    /// The full timeout elapsed.
    TimedOut,
    /// Shutdown was requested; the caller must unwind promptly.
    Shutdown,
}

/// The composed core each role controller holds a reference to.
pub struct MonitorCore {
    log: Logger,
    config: Arc<Config>,
    store: Arc<dyn IdentityStore>,
    certificates: Arc<CertificateManager>,
    platform: Arc<dyn OrchestrationClient>,
    middleware: Arc<dyn MiddlewareClient>,
    state_tx: watch::Sender<MonitorState>,
    shutdown_tx: watch::Sender<bool>,
    restart_tx: watch::Sender<bool>,
    wake: Notify,
}

impl MonitorCore {
    pub fn new(
        log: &Logger,
        config: Arc<Config>,
        store: Arc<dyn IdentityStore>,
        certificates: Arc<CertificateManager>,
        platform: Arc<dyn OrchestrationClient>,
        middleware: Arc<dyn MiddlewareClient>,
    ) -> MonitorCore {
        let (state_tx, _) = watch::channel(MonitorState::Uninitialized);
        let (shutdown_tx, _) = watch::channel(false);
        let (restart_tx, _) = watch::channel(false);
        MonitorCore {
            log: log.new(o!("component" => "MonitorCore")),
            config,
            store,
            certificates,
            platform,
            middleware,
            state_tx,
            shutdown_tx,
            restart_tx,
            wake: Notify::new(),
        }
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    pub fn certificates(&self) -> &CertificateManager {
        &self.certificates
    }

    pub fn platform(&self) -> &Arc<dyn OrchestrationClient> {
        &self.platform
    }

    pub fn middleware(&self) -> &Arc<dyn MiddlewareClient> {
        &self.middleware
    }

    pub fn state(&self) -> MonitorState {
        *self.state_tx.borrow()
    }

    pub fn set_state(&self, state: MonitorState) {
        self.state_tx.send_if_modified(|current| {
            if *current != state {
                info!(self.log, "monitor state transition";
                    "from" => ?*current, "to" => ?state);
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Ask the maintenance loop (and any bounded wait) to run now.
    pub fn wake(&self) {
        self.wake.notify_waiters();
    }

    /// Request shutdown. The single cancellation primitive: every blocking
    /// wait observes it and returns promptly.
    pub fn trigger_shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!(self.log, "shutdown requested");
        self.wake.notify_waiters();
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// A receiver for the shutdown flag, for tasks that select on it
    /// directly.
    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Raise the restart signal after a state-changing bootstrap step. This
    /// is deliberate control flow, not a failure; the process exits with
    /// the restart code and the supervisor relaunches it.
    pub fn request_restart(&self) {
        if self.restart_tx.send_replace(true) {
            return;
        }
        info!(self.log, "restart requested");
        self.wake.notify_waiters();
    }

    pub fn restart_requested(&self) -> bool {
        *self.restart_tx.borrow()
    }

    /// Wait for up to `timeout`, returning early on a wake or shutdown
    /// signal.
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return WaitOutcome::Shutdown;
        }
        tokio::select! {
            _ = self.wake.notified() => {
                if self.shutdown_requested() {
                    WaitOutcome::Shutdown
                } else {
                    WaitOutcome::Woken
                }
            }
            _ = shutdown_rx.wait_for(|requested| *requested) => {
                WaitOutcome::Shutdown
            }
            _ = tokio::time::sleep(timeout) => WaitOutcome::TimedOut,
        }
    }

    /// Run the maintenance loop until shutdown. Entered only once the node
    /// is `Operational`.
    pub async fn run(&self, controller: &dyn RoleController) {
        while !self.shutdown_requested() {
            if let Err(err) = self.run_cycle(controller).await {
                // Errors inside a cycle are caught here at the cycle
                // boundary; the loop continues.
                warn!(self.log, "maintenance cycle failed";
                    "error" => %err);
            }
            match self.wait(self.config.maintenance_interval()).await {
                WaitOutcome::Shutdown => break,
                WaitOutcome::Woken | WaitOutcome::TimedOut => continue,
            }
        }
        self.set_state(MonitorState::ShuttingDown);
    }

    async fn run_cycle(
        &self,
        controller: &dyn RoleController,
    ) -> Result<(), crate::roles::ControllerError> {
        let load = sample_load_average();
        if load > self.config.max_load {
            // Back-pressure, not an error: leave the workloads alone this
            // cycle.
            info!(self.log, "load above threshold, skipping workload upkeep";
                "load" => load, "max_load" => self.config.max_load);
        } else if let Err(err) = self.ensure_workloads().await {
            // Aborts the workload substep only.
            warn!(self.log, "workload upkeep failed"; "error" => %err);
        }

        if !self.middleware.is_connected() {
            if let Err(err) = self.middleware.connect().await {
                // Transient negotiation failure: retried next cycle.
                info!(self.log, "middleware connection attempt failed";
                    "error" => %err);
            }
        }

        controller.maintain(self).await
    }

    async fn ensure_workloads(&self) -> Result<(), anyhow::Error> {
        for service in self.store.workloads().await? {
            self.platform.ensure_service(&service).await?;
        }
        Ok(())
    }
}

// One-minute load average of the host; 0.0 when unreadable (the
// back-pressure check then never trips, which is the right failure mode for
// a missing /proc).
fn sample_load_average() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|contents| {
            contents.split_whitespace().next().and_then(|v| v.parse().ok())
        })
        .unwrap_or(0.0)
}

/// One step of the shutdown discipline.
pub struct ReleaseStep<'a> {
    pub name: &'static str,
    pub run: futures::future::BoxFuture<'a, Result<(), anyhow::Error>>,
}

/// Run every release step, independently of each other's success. A failing
/// step is logged and never prevents the remaining steps from running.
pub async fn release_all(log: &Logger, steps: Vec<ReleaseStep<'_>>) {
    for step in steps {
        match step.run.await {
            Ok(()) => debug!(log, "release step done"; "step" => step.name),
            Err(err) => {
                warn!(log, "release step failed";
                    "step" => step.name, "error" => %err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use slog::Drain;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_log() -> Logger {
        Logger::root(slog::Discard.fuse(), o!())
    }

    #[tokio::test]
    async fn wait_returns_shutdown_immediately_when_already_requested() {
        let core = crate::fakes::test_core();
        core.trigger_shutdown();
        assert_eq!(
            core.wait(Duration::from_secs(60)).await,
            WaitOutcome::Shutdown
        );
    }

    #[tokio::test]
    async fn wait_observes_wake_and_timeout() {
        let core = Arc::new(crate::fakes::test_core());

        let waiter = Arc::clone(&core);
        let handle = tokio::spawn(async move {
            waiter.wait(Duration::from_secs(60)).await
        });
        // Give the waiter a chance to register.
        tokio::time::sleep(Duration::from_millis(50)).await;
        core.wake();
        assert_eq!(handle.await.unwrap(), WaitOutcome::Woken);

        assert_eq!(
            core.wait(Duration::from_millis(10)).await,
            WaitOutcome::TimedOut
        );
    }

    #[tokio::test]
    async fn state_transitions_are_published() {
        let core = crate::fakes::test_core();
        assert_eq!(core.state(), MonitorState::Uninitialized);
        core.set_state(MonitorState::Operational);
        assert_eq!(core.state(), MonitorState::Operational);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_loop_runs_until_shutdown() {
        let core = crate::fakes::test_core();
        let controller = crate::fakes::CountingController::new(Some(3));
        core.run(&controller).await;
        // Shutdown arrived mid-cycle on the third pass; the loop wound down
        // and published the transition.
        assert_eq!(controller.maintain_calls.load(Ordering::SeqCst), 3);
        assert_eq!(core.state(), MonitorState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn workloads_are_asserted_each_cycle() {
        let store = Arc::new(idstore::MemoryStore::new());
        store.set_workloads(vec![
            idstore::WorkloadService {
                name: "messaging".to_string(),
                image: "cluster/messaging:1".to_string(),
            },
            idstore::WorkloadService {
                name: "datastore".to_string(),
                image: "cluster/datastore:1".to_string(),
            },
        ]);
        let platform = Arc::new(crate::fakes::FakeOrchestration::default());
        let middleware = Arc::new(crate::fakes::FakeMiddleware::default());
        let (core, _) = crate::fakes::test_core_parts(
            store,
            Arc::clone(&platform)
                as Arc<dyn crate::platform::OrchestrationClient>,
            middleware,
        );
        core.run(&crate::fakes::CountingController::new(Some(1))).await;
        assert_eq!(
            *platform.ensured.lock().unwrap(),
            vec!["messaging".to_string(), "datastore".to_string()]
        );
    }

    #[tokio::test]
    async fn release_runs_every_step_despite_failures() {
        let ran = AtomicUsize::new(0);
        let step = |fail: bool| {
            let ran = &ran;
            ReleaseStep {
                name: "step",
                run: async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(anyhow::anyhow!("injected"))
                    } else {
                        Ok(())
                    }
                }
                .boxed(),
            }
        };
        let steps =
            vec![step(false), step(true), step(true), step(false), step(false)];
        release_all(&test_log(), steps).await;
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }
}
