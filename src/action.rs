use crate::context::SandboxContext;
use crate::controller::LifecycleController;
use crate::policy::Policy;
use crate::substitution::Template;
use crate::workload::WorkloadDescriptor;
use tracing::{debug, info_span};

/// The unit a launch host instantiates: a set of workloads to run under one policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SandboxContainerAction {
    sandbox_name: Option<Template>,
    policy: Option<Policy>,
    workloads: Option<Vec<WorkloadDescriptor>>,
}

impl SandboxContainerAction {
    pub fn new(
        sandbox_name: Option<Template>,
        policy: Option<Policy>,
        workloads: Option<Vec<WorkloadDescriptor>>,
    ) -> Self {
        Self {
            sandbox_name,
            policy,
            workloads,
        }
    }

    pub fn with_name(mut self, name: impl Into<Template>) -> Self {
        self.sandbox_name = Some(name.into());
        self
    }

    pub fn with_policy(mut self, policy: impl Into<Policy>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_workload(mut self, workload: WorkloadDescriptor) -> Self {
        self.workloads.get_or_insert_with(Vec::new).push(workload);
        self
    }

    pub fn with_workloads(mut self, workloads: impl IntoIterator<Item = WorkloadDescriptor>) -> Self {
        self.workloads
            .get_or_insert_with(Vec::new)
            .extend(workloads);
        self
    }

    pub fn sandbox_name(&self) -> Option<&Template> {
        self.sandbox_name.as_ref()
    }

    pub fn policy(&self) -> Option<&Policy> {
        self.policy.as_ref()
    }

    pub fn workloads(&self) -> Option<&[WorkloadDescriptor]> {
        self.workloads.as_deref()
    }

    /// Builds the controller for this sandbox without starting it.
    ///
    /// Returns `None` when there is nothing to run: no workloads were given,
    /// or workloads were given without a policy.
    pub fn activate(&self, ctx: &SandboxContext) -> Option<LifecycleController> {
        let Some(workloads) = &self.workloads else {
            debug!("Sandbox has no workloads");
            return None;
        };
        let Some(policy) = &self.policy else {
            debug!(workloads = workloads.len(), "Sandbox has no policy, workloads are not run");
            return None;
        };

        let name = self
            .sandbox_name
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let span = info_span!(parent: &ctx.span, "sandbox", name = %name);
        let ctx = ctx.clone().with_span(span);
        Some(policy.apply(&ctx, workloads.clone()))
    }
}
