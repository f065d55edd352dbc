//! The launch host seam.
//!
//! A controller only needs two things from whatever runs it: a shutdown
//! notification and the launch configurations for substitution. `LaunchService`
//! is the host this crate ships; embedders can implement [`ExecutionHost`]
//! themselves.

use crate::action::SandboxContainerAction;
use crate::completion::{CompletionSignal, Outcome};
use crate::context::SandboxContext;
use crate::controller::LifecycleController;
use crate::substitution::SubstitutionContext;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

pub trait ExecutionHost: Send + Sync {
    fn subscribe_shutdown(&self) -> ShutdownListener;

    /// Snapshot of the launch configurations at the time of the call.
    fn substitution_context(&self) -> SubstitutionContext;
}

/// One-shot subscription to a host's shutdown broadcast.
#[derive(Debug)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// True once shutdown was announced, false if the host went away without it.
    pub async fn notified(mut self) -> bool {
        self.rx.wait_for(|shutting_down| *shutting_down).await.is_ok()
    }
}

struct Launched {
    label: String,
    controller: Option<Arc<LifecycleController>>,
    completion: CompletionSignal,
}

/// Runs sandbox actions and fans one shutdown out to all of them.
pub struct LaunchService {
    ctx: SandboxContext,
    substitutions: RwLock<SubstitutionContext>,
    shutdown_tx: watch::Sender<bool>,
    launched: Mutex<Vec<Launched>>,
}

impl LaunchService {
    pub fn new(ctx: SandboxContext) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            substitutions: RwLock::new(SubstitutionContext::new()),
            shutdown_tx,
            launched: Mutex::new(Vec::new()),
        }
    }

    pub fn with_substitutions(self, substitutions: SubstitutionContext) -> Self {
        *self.substitutions.write() = substitutions;
        self
    }

    pub fn set_launch_configuration(&self, name: impl Into<String>, value: impl Into<String>) {
        self.substitutions.write().set_var(name, value);
    }

    pub fn context(&self) -> &SandboxContext {
        &self.ctx
    }

    /// Activates `action` and starts it without waiting for it.
    ///
    /// An action that has nothing to run yields an already succeeded signal.
    pub async fn launch(&self, action: &SandboxContainerAction) -> CompletionSignal {
        let label = action
            .sandbox_name()
            .map(ToString::to_string)
            .unwrap_or_else(|| "sandbox".to_string());

        let Some(controller) = action.activate(&self.ctx) else {
            debug!(sandbox = %label, "Nothing to run");
            let completion = CompletionSignal::resolved(Outcome::Succeeded);
            self.launched.lock().push(Launched {
                label,
                controller: None,
                completion: completion.clone(),
            });
            return completion;
        };

        let controller = Arc::new(controller);
        let completion = controller.execute(self).await;
        info!(sandbox = %label, policy = %controller.describe(), "Launched");
        self.launched.lock().push(Launched {
            label,
            controller: Some(controller),
            completion: completion.clone(),
        });
        completion
    }

    /// Broadcasts shutdown to every controller launched so far and any launched later.
    pub fn shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            info!(sandboxes = self.launched.lock().len(), "Shutting down launch service");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn controllers(&self) -> Vec<Arc<LifecycleController>> {
        self.launched
            .lock()
            .iter()
            .filter_map(|l| l.controller.clone())
            .collect()
    }

    /// Waits for every launched sandbox to finish, in launch order.
    pub async fn wait(&self) -> Vec<(String, Outcome)> {
        let pending: Vec<(String, CompletionSignal)> = self
            .launched
            .lock()
            .iter()
            .map(|l| (l.label.clone(), l.completion.clone()))
            .collect();
        join_all(
            pending
                .into_iter()
                .map(|(label, signal)| async move { (label, signal.wait().await) }),
        )
        .await
    }

    /// Serves until `stop` resolves, then shuts everything down and waits for it.
    pub async fn run_until<F>(&self, stop: F) -> Vec<(String, Outcome)>
    where
        F: Future<Output = ()>,
    {
        stop.await;
        self.shutdown();
        self.wait().await
    }
}

impl ExecutionHost for LaunchService {
    fn subscribe_shutdown(&self) -> ShutdownListener {
        ShutdownListener::new(self.shutdown_tx.subscribe())
    }

    fn substitution_context(&self) -> SubstitutionContext {
        self.substitutions.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_sees_shutdown_sent_before_subscribing() {
        let (tx, _) = watch::channel(false);
        tx.send_replace(true);
        assert!(ShutdownListener::new(tx.subscribe()).notified().await);
    }

    #[tokio::test]
    async fn test_listener_reports_dropped_host() {
        let (tx, rx) = watch::channel(false);
        let listener = ShutdownListener::new(rx);
        drop(tx);
        assert!(!listener.notified().await);
    }

    #[tokio::test]
    async fn test_substitutions_are_snapshotted() {
        let service = LaunchService::new(SandboxContext::system())
            .with_substitutions(SubstitutionContext::new().with_var("robot", "r1"));
        let before = service.substitution_context();
        service.set_launch_configuration("robot", "r2");
        assert_eq!(before.var("robot"), Some("r1"));
        assert_eq!(service.substitution_context().var("robot"), Some("r2"));
    }
}
