use crate::docker::containerized_command;
use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerHandle, ContainerRuntime, RunOptions};
use crate::workload::ResolvedWorkload;
use chrono::{DateTime, Local};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_REPOSITORY: &str = "osrf/ros";
pub const DEFAULT_TAG: &str = "dashing-desktop";
/// Tag used for any repository other than [`DEFAULT_REPOSITORY`].
pub const FALLBACK_TAG: &str = "latest";
/// Bootstrap script shipped in the default image.
pub const DEFAULT_ENTRYPOINT: &str = "/ros_entrypoint.sh";
pub const SHELL_ENTRYPOINT: &str = "/bin/bash -c";
pub const CONTAINER_NAME_PREFIX: &str = "launch-sandbox-";

/// Repository and tag after defaulting.
pub fn resolve_image(repository: Option<&str>, tag: Option<&str>) -> (String, String) {
    let repository = repository.unwrap_or(DEFAULT_REPOSITORY);
    let tag = match tag {
        Some(tag) => tag,
        None if repository == DEFAULT_REPOSITORY => DEFAULT_TAG,
        None => FALLBACK_TAG,
    };
    (repository.to_string(), tag.to_string())
}

pub fn resolve_entrypoint(repository: &str, entrypoint: Option<&str>) -> String {
    match entrypoint {
        Some(e) => e.to_string(),
        None if repository == DEFAULT_REPOSITORY => DEFAULT_ENTRYPOINT.to_string(),
        None => SHELL_ENTRYPOINT.to_string(),
    }
}

pub fn generate_container_name(now: DateTime<Local>) -> String {
    format!("{}{}", CONTAINER_NAME_PREFIX, now.format("%H%M%S"))
}

/// Runs all workloads of a sandbox inside one container.
///
/// Everything is resolved at construction; nothing touches the engine until
/// the controller produced by `apply` is executed.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerPolicy {
    repository: String,
    tag: String,
    entrypoint: String,
    container_name: String,
    run_options: RunOptions,
}

impl Default for ContainerPolicy {
    fn default() -> Self {
        let (repository, tag) = resolve_image(None, None);
        let entrypoint = resolve_entrypoint(&repository, None);
        Self {
            repository,
            tag,
            entrypoint,
            container_name: generate_container_name(Local::now()),
            run_options: RunOptions::new(),
        }
    }
}

impl ContainerPolicy {
    pub fn builder() -> ContainerPolicyBuilder {
        ContainerPolicyBuilder::default()
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// `repository:tag`
    pub fn image_name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn run_options(&self) -> &RunOptions {
        &self.run_options
    }
}

#[derive(Debug, Default)]
pub struct ContainerPolicyBuilder {
    repository: Option<String>,
    tag: Option<String>,
    entrypoint: Option<String>,
    container_name: Option<String>,
    run_options: BTreeMap<String, Value>,
}

impl ContainerPolicyBuilder {
    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = Some(repository.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn container_name(mut self, name: impl Into<String>) -> Self {
        self.container_name = Some(name.into());
        self
    }

    pub fn run_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.run_options.insert(key.into(), value.into());
        self
    }

    pub fn run_options(mut self, options: BTreeMap<String, Value>) -> Self {
        self.run_options.extend(options);
        self
    }

    pub fn build(self) -> Result<ContainerPolicy> {
        let run_options = RunOptions::from_map(self.run_options)?;

        if let Some(name) = &self.container_name {
            if name.trim().is_empty() {
                return Err(SandboxError::configuration("container name must not be empty"));
            }
        }
        if matches!(&self.entrypoint, Some(e) if e.trim().is_empty()) {
            return Err(SandboxError::configuration("entrypoint must not be empty"));
        }

        let (repository, tag) = resolve_image(self.repository.as_deref(), self.tag.as_deref());
        let entrypoint = resolve_entrypoint(&repository, self.entrypoint.as_deref());
        let container_name = self
            .container_name
            .unwrap_or_else(|| generate_container_name(Local::now()));

        Ok(ContainerPolicy {
            repository,
            tag,
            entrypoint,
            container_name,
            run_options,
        })
    }
}

/// Lifecycle operations of a container sandbox, driven by the controller.
pub(crate) struct ContainerBackend {
    policy: ContainerPolicy,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerBackend {
    pub(crate) fn new(policy: ContainerPolicy, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { policy, runtime }
    }

    pub(crate) fn describe(&self) -> String {
        format!("container {} ({})", self.policy.container_name, self.policy.image_name())
    }

    pub(crate) async fn acquire(&self) -> Result<()> {
        self.runtime
            .ensure_image(&self.policy.repository, &self.policy.tag)
            .await
            .map_err(|e| e.into_startup("acquire"))
    }

    pub(crate) async fn start(&self) -> Result<ContainerHandle> {
        self.runtime
            .start_context(
                &self.policy.image_name(),
                &self.policy.container_name,
                &self.policy.run_options,
            )
            .await
            .map_err(|e| e.into_startup("start"))
    }

    pub(crate) async fn inject(
        &self,
        handle: &ContainerHandle,
        workload: &ResolvedWorkload,
    ) -> Result<()> {
        let cmd = containerized_command(&self.policy.entrypoint, &workload.command());
        let output = self
            .runtime
            .exec_in_context(handle, &cmd, true)
            .await
            .map_err(|e| SandboxError::Injection {
                workload: workload.label(),
                reason: e.to_string(),
            })?;
        debug!(
            container = %handle.name,
            ?cmd,
            exit_code = ?output.exit_code,
            output = %String::from_utf8_lossy(&output.output),
            "Executed command"
        );
        Ok(())
    }

    pub(crate) async fn release(&self, handle: &ContainerHandle) -> Result<()> {
        self.runtime
            .stop_context(handle)
            .await
            .map_err(|e| SandboxError::Shutdown {
                context: handle.name.clone(),
                reason: e.to_string(),
            })
    }
}
