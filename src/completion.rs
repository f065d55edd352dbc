use crate::error::SandboxError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// How a sandbox finished.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeeded,
    Cancelled,
    Failed(Arc<SandboxError>),
}

impl Outcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn error(&self) -> Option<&SandboxError> {
        match self {
            Outcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Succeeded => f.write_str("succeeded"),
            Outcome::Cancelled => f.write_str("cancelled"),
            Outcome::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Write side of a [`CompletionSignal`]. Only the first `resolve` counts.
#[derive(Debug)]
pub(crate) struct Completion {
    tx: watch::Sender<Option<Outcome>>,
}

impl Completion {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub(crate) fn signal(&self) -> CompletionSignal {
        CompletionSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Returns false if the signal was already resolved.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }
}

/// Single-assignment future for "the sandbox has finished".
///
/// Clones observe the same resolution. Callers that need bounded waiting wrap
/// [`CompletionSignal::wait`] in `tokio::time::timeout`.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    rx: watch::Receiver<Option<Outcome>>,
}

impl CompletionSignal {
    /// A signal that is already resolved.
    pub fn resolved(outcome: Outcome) -> Self {
        let completion = Completion::new();
        completion.resolve(outcome);
        completion.signal()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.rx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits for resolution. A signal whose writer disappeared unresolved counts as cancelled.
    pub async fn wait(&self) -> Outcome {
        let mut rx = self.rx.clone();
        let waited = rx.wait_for(Option::is_some).await.map(|o| o.clone());
        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(_) => rx.borrow().clone(),
        };
        outcome.unwrap_or(Outcome::Cancelled)
    }

    /// True if both handles observe the same completion.
    pub fn same_as(&self, other: &CompletionSignal) -> bool {
        self.rx.same_channel(&other.rx)
    }
}
