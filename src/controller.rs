//! Sandbox lifecycle controller.
//!
//! ```text
//! Idle --execute()--> Starting --acquire+start+inject--> Running
//! Starting --acquire/start fails, or the startup task panics--> Failed
//! Running  --shutdown--> ShuttingDown --release--> Stopped
//! Starting --shutdown--> ShuttingDown --wait for startup, release--> Stopped
//! ```
//!
//! State, execution context and completion are only mutated while holding
//! `inner`. The startup task never transitions out of `Starting` once shutdown
//! has moved the state on; it only publishes a context it created so that
//! shutdown can release it.
//!
//! Cancellation points: the acquire call is abandoned as soon as shutdown is
//! requested (nothing exists yet). The start call always runs to completion
//! so a created context cannot be lost. Injection checks for cancellation
//! before each workload.

use crate::completion::{Completion, CompletionSignal, Outcome};
use crate::env::AccountRecord;
use crate::error::{Result, SandboxError};
use crate::launch::ExecutionHost;
use crate::policy::container::ContainerBackend;
use crate::policy::user::{ProcessGroup, UserBackend};
use crate::runtime::ContainerHandle;
use crate::substitution::{SubstitutionContext, SubstitutionResolver};
use crate::workload::{ResolvedWorkload, WorkloadDescriptor};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A live isolated environment owned by exactly one controller.
#[derive(Debug, Clone)]
pub enum ExecutionContext {
    Container(ContainerHandle),
    ProcessGroup(ProcessGroup),
}

impl ExecutionContext {
    pub fn describe(&self) -> String {
        match self {
            ExecutionContext::Container(handle) => format!("container {} ({})", handle.name, handle.id),
            ExecutionContext::ProcessGroup(group) => {
                format!("process group of {} ({} processes)", group.account(), group.len())
            }
        }
    }
}

/// Result of the acquire step, consumed by start.
pub(crate) enum Prepared {
    Image,
    Account(AccountRecord),
}

pub(crate) enum Backend {
    Container(ContainerBackend),
    User(UserBackend),
}

impl Backend {
    fn describe(&self) -> String {
        match self {
            Backend::Container(b) => b.describe(),
            Backend::User(b) => b.describe(),
        }
    }

    async fn acquire(&self) -> Result<Prepared> {
        match self {
            Backend::Container(b) => b.acquire().await.map(|()| Prepared::Image),
            Backend::User(b) => b.acquire().await.map(Prepared::Account),
        }
    }

    async fn start(&self, prepared: Prepared) -> Result<ExecutionContext> {
        match (self, prepared) {
            (Backend::Container(b), _) => b.start().await.map(ExecutionContext::Container),
            (Backend::User(b), Prepared::Account(account)) => {
                Ok(ExecutionContext::ProcessGroup(b.start(&account)))
            }
            (Backend::User(_), Prepared::Image) => Err(SandboxError::Startup {
                stage: "start".to_string(),
                reason: "no account record was acquired".to_string(),
            }),
        }
    }

    async fn inject(&self, context: &ExecutionContext, workload: &ResolvedWorkload) -> Result<()> {
        match (self, context) {
            (Backend::Container(b), ExecutionContext::Container(handle)) => b.inject(handle, workload).await,
            (Backend::User(b), ExecutionContext::ProcessGroup(group)) => b.inject(group, workload).await,
            _ => Err(SandboxError::Injection {
                workload: workload.label(),
                reason: "execution context does not belong to this policy".to_string(),
            }),
        }
    }

    async fn release(&self, context: &ExecutionContext) -> Result<()> {
        match (self, context) {
            (Backend::Container(b), ExecutionContext::Container(handle)) => b.release(handle).await,
            (Backend::User(b), ExecutionContext::ProcessGroup(group)) => b.release(group).await,
            _ => Err(SandboxError::Shutdown {
                context: context.describe(),
                reason: "execution context does not belong to this policy".to_string(),
            }),
        }
    }
}

struct Inner {
    state: LifecycleState,
    context: Option<ExecutionContext>,
    completion: Option<Completion>,
    startup: Option<JoinHandle<()>>,
}

/// Drives one execution context through acquire, start, inject and release.
pub struct LifecycleController {
    backend: Backend,
    workloads: Vec<WorkloadDescriptor>,
    resolver: Arc<dyn SubstitutionResolver>,
    span: Span,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<LifecycleState>,
    cancel_tx: watch::Sender<bool>,
}

impl LifecycleController {
    pub(crate) fn new(
        backend: Backend,
        workloads: Vec<WorkloadDescriptor>,
        resolver: Arc<dyn SubstitutionResolver>,
        span: Span,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Idle);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            backend,
            workloads,
            resolver,
            span,
            inner: Mutex::new(Inner {
                state: LifecycleState::Idle,
                context: None,
                completion: None,
                startup: None,
            }),
            state_tx,
            cancel_tx,
        }
    }

    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    pub fn workloads(&self) -> &[WorkloadDescriptor] {
        &self.workloads
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.lock().await.state
    }

    /// Snapshot of the live execution context, if any.
    pub async fn context(&self) -> Option<ExecutionContext> {
        self.inner.lock().await.context.clone()
    }

    pub async fn completion(&self) -> Option<CompletionSignal> {
        self.inner.lock().await.completion.as_ref().map(Completion::signal)
    }

    /// Every transition is published here; intermediate states may be skipped
    /// by slow observers.
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }

    pub async fn wait_for_state(&self, pred: impl Fn(LifecycleState) -> bool) -> LifecycleState {
        let mut rx = self.state_tx.subscribe();
        let waited = rx.wait_for(|s| pred(*s)).await.map(|s| *s);
        waited.unwrap_or_else(|_| *rx.borrow())
    }

    fn set_state(&self, inner: &mut Inner, state: LifecycleState) {
        debug!(from = %inner.state, to = %state, "Lifecycle transition");
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Starts the sandbox without waiting for it.
    ///
    /// Registers for the host's shutdown notification and spawns the startup
    /// sequence. Calling it again returns the existing signal.
    pub async fn execute(self: &Arc<Self>, host: &dyn ExecutionHost) -> CompletionSignal {
        let mut inner = self.inner.lock().await;
        if let Some(completion) = &inner.completion {
            return completion.signal();
        }

        let completion = Completion::new();
        let signal = completion.signal();
        if inner.state != LifecycleState::Idle {
            // Shut down before it ever ran.
            completion.resolve(Outcome::Cancelled);
            inner.completion = Some(completion);
            return signal;
        }
        inner.completion = Some(completion);

        // The listener lives until shutdown is announced or the controller is done.
        let listener = host.subscribe_shutdown();
        let controller = Arc::clone(self);
        tokio::spawn(
            async move {
                tokio::select! {
                    notified = listener.notified() => {
                        if notified {
                            controller.shutdown().await;
                        }
                    }
                    _ = controller.wait_for_state(LifecycleState::is_terminal) => {}
                }
            }
            .instrument(self.span.clone()),
        );

        self.set_state(&mut inner, LifecycleState::Starting);
        let substitutions = host.substitution_context();
        let startup = tokio::spawn(
            Arc::clone(self)
                .run_startup(substitutions)
                .instrument(self.span.clone()),
        );
        let controller = Arc::clone(self);
        let supervisor = tokio::spawn(
            async move {
                if let Err(e) = startup.await {
                    controller
                        .fail(SandboxError::Startup {
                            stage: "startup".to_string(),
                            reason: join_error_reason(e),
                        })
                        .await;
                }
            }
            .instrument(self.span.clone()),
        );
        inner.startup = Some(supervisor);

        signal
    }

    async fn run_startup(self: Arc<Self>, substitutions: SubstitutionContext) {
        let mut cancel = self.cancel_tx.subscribe();

        info!(sandbox = %self.backend.describe(), "Acquiring sandbox resources");
        let acquired = tokio::select! {
            biased;
            _ = cancel.wait_for(|c| *c) => {
                debug!("Startup cancelled while acquiring");
                return;
            }
            acquired = self.backend.acquire() => acquired,
        };
        let prepared = match acquired {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(e).await,
        };

        if *cancel.borrow() {
            debug!("Startup cancelled before start");
            return;
        }

        let context = match self.backend.start(prepared).await {
            Ok(context) => context,
            Err(e) => return self.fail(e).await,
        };

        {
            let mut inner = self.inner.lock().await;
            info!(context = %context.describe(), "Execution context started");
            inner.context = Some(context.clone());
            if inner.state != LifecycleState::Starting {
                debug!("Shutdown requested during start, context left for release");
                return;
            }
        }

        for workload in &self.workloads {
            if *cancel.borrow() {
                debug!("Startup cancelled during injection");
                return;
            }

            let resolved = match workload.resolve(self.resolver.as_ref(), &substitutions) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(workload = %workload.label(), error = %e, "Skipping workload");
                    continue;
                }
            };
            match self.backend.inject(&context, &resolved).await {
                Ok(()) => info!(workload = %resolved.label(), "Workload injected"),
                Err(e) => warn!(workload = %resolved.label(), error = %e, "Skipping workload"),
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.state == LifecycleState::Starting {
            self.set_state(&mut inner, LifecycleState::Running);
            info!(workloads = self.workloads.len(), "Sandbox running");
        }
    }

    async fn fail(&self, err: SandboxError) {
        let mut inner = self.inner.lock().await;
        if inner.state != LifecycleState::Starting {
            warn!(error = %err, "Startup failed after shutdown was requested");
            return;
        }
        error!(error = %err, "Sandbox startup failed");
        if let Some(context) = inner.context.take() {
            if let Err(e) = self.backend.release(&context).await {
                warn!(error = %e, "Failed to stop execution context");
            }
        }
        self.set_state(&mut inner, LifecycleState::Failed);
        if let Some(completion) = &inner.completion {
            completion.resolve(Outcome::Failed(Arc::new(err)));
        }
    }

    /// Cancels startup if it is in flight, releases the execution context and
    /// resolves the completion signal as cancelled. Idempotent; concurrent
    /// callers return once the controller reached a terminal state.
    pub async fn shutdown(&self) {
        let startup = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                LifecycleState::Stopped | LifecycleState::Failed => return,
                LifecycleState::ShuttingDown => None,
                LifecycleState::Idle => {
                    self.set_state(&mut inner, LifecycleState::Stopped);
                    return;
                }
                LifecycleState::Starting | LifecycleState::Running => {
                    info!(sandbox = %self.backend.describe(), "Shutting down sandbox");
                    self.set_state(&mut inner, LifecycleState::ShuttingDown);
                    self.cancel_tx.send_replace(true);
                    Some(inner.startup.take())
                }
            }
        };

        let Some(startup) = startup else {
            self.wait_for_state(LifecycleState::is_terminal).await;
            return;
        };

        if let Some(task) = startup {
            if let Err(e) = task.await {
                error!(error = %e, "Startup supervisor did not finish");
            }
        }

        let mut inner = self.inner.lock().await;
        if let Some(context) = inner.context.take() {
            match self.backend.release(&context).await {
                Ok(()) => info!(context = %context.describe(), "Execution context stopped"),
                Err(e) => warn!(error = %e, "Failed to stop execution context"),
            }
        }
        if let Some(completion) = &inner.completion {
            completion.resolve(Outcome::Cancelled);
        }
        self.set_state(&mut inner, LifecycleState::Stopped);
    }
}

fn join_error_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map(|msg| format!("startup task panicked: {}", msg))
        .unwrap_or_else(|| "startup task panicked".to_string())
}

impl fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleController")
            .field("backend", &self.backend.describe())
            .field("workloads", &self.workloads.len())
            .field("state", &*self.state_tx.borrow())
            .finish()
    }
}
