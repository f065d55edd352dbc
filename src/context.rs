use crate::docker::DockerCli;
use crate::env::{IdentityResolver, LocalSpawner, ProcessSpawner, SystemIdentity};
use crate::runtime::ContainerRuntime;
use crate::substitution::{DefaultResolver, SubstitutionResolver};
use std::sync::Arc;
use tracing::Span;

/// Adapters and logging span handed to policies and controllers explicitly,
/// so nothing reads process-global state behind the caller's back.
#[derive(Clone)]
pub struct SandboxContext {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub identity: Arc<dyn IdentityResolver>,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub resolver: Arc<dyn SubstitutionResolver>,
    pub span: Span,
}

impl SandboxContext {
    /// Docker CLI, the system user database and local child processes.
    pub fn system() -> Self {
        Self {
            runtime: Arc::new(DockerCli::new()),
            identity: Arc::new(SystemIdentity),
            spawner: Arc::new(LocalSpawner),
            resolver: Arc::new(DefaultResolver),
            span: Span::current(),
        }
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn SubstitutionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }
}
