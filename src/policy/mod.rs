//! Isolation policies.
//!
//! The set of strategies is closed: a sandbox either runs in a container or
//! as another local user. `apply` only builds the lifecycle controller; the
//! host decides when it is executed.

pub mod container;
pub mod user;

pub use container::{ContainerPolicy, ContainerPolicyBuilder};
pub use user::{ProcessGroup, UserPolicy};

use crate::context::SandboxContext;
use crate::controller::{Backend, LifecycleController};
use crate::workload::WorkloadDescriptor;
use container::ContainerBackend;
use user::UserBackend;

#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    Container(ContainerPolicy),
    User(UserPolicy),
}

impl Policy {
    pub fn apply(&self, ctx: &SandboxContext, workloads: Vec<WorkloadDescriptor>) -> LifecycleController {
        let backend = match self {
            Policy::Container(policy) => {
                Backend::Container(ContainerBackend::new(policy.clone(), ctx.runtime.clone()))
            }
            Policy::User(policy) => Backend::User(UserBackend::new(
                *policy,
                ctx.identity.clone(),
                ctx.spawner.clone(),
            )),
        };
        LifecycleController::new(backend, workloads, ctx.resolver.clone(), ctx.span.clone())
    }
}

impl From<ContainerPolicy> for Policy {
    fn from(policy: ContainerPolicy) -> Self {
        Policy::Container(policy)
    }
}

impl From<UserPolicy> for Policy {
    fn from(policy: UserPolicy) -> Self {
        Policy::User(policy)
    }
}
