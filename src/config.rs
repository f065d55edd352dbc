//! JSON description of a sandbox.
//!
//! ```json
//! {
//!   "sandbox_name": "my_sandbox",
//!   "policy": {
//!     "kind": "docker",
//!     "repository": "osrf/ros",
//!     "tag": "dashing-desktop",
//!     "run_options": { "cpuset_cpus": "0" }
//!   },
//!   "workloads": [
//!     { "package": "demo_nodes_cpp", "executable": "talker", "name": "$(var robot)_talker" }
//!   ]
//! }
//! ```

use crate::action::SandboxContainerAction;
use crate::context::SandboxContext;
use crate::env::User;
use crate::error::{Result, SandboxError};
use crate::policy::{ContainerPolicy, Policy, UserPolicy};
use crate::substitution::Template;
use crate::workload::{Parameter, Remapping, WorkloadDescriptor};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxManifest {
    #[serde(default)]
    pub sandbox_name: Option<Template>,
    #[serde(default)]
    pub policy: Option<PolicyManifest>,
    #[serde(default)]
    pub workloads: Option<Vec<WorkloadManifest>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum PolicyManifest {
    Docker {
        #[serde(default)]
        repository: Option<String>,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default)]
        entrypoint: Option<String>,
        #[serde(default)]
        container_name: Option<String>,
        #[serde(default)]
        run_options: BTreeMap<String, Value>,
    },
    User {
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        uid: Option<u32>,
        #[serde(default)]
        gid: Option<u32>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadManifest {
    pub package: Template,
    pub executable: Template,
    #[serde(default)]
    pub name: Option<Template>,
    #[serde(default)]
    pub namespace: Option<Template>,
    #[serde(default)]
    pub parameters: Option<Vec<Parameter>>,
    #[serde(default)]
    pub remappings: Option<Vec<Remapping>>,
}

impl SandboxManifest {
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| SandboxError::configuration(format!("invalid sandbox manifest: {}", e)))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sandbox manifest {}", path.display()))?;
        Self::from_json_str(&source)
    }

    /// Validates everything up front; nothing here touches the container engine.
    pub fn into_action(self, ctx: &SandboxContext) -> Result<SandboxContainerAction> {
        let policy = self.policy.map(|p| p.into_policy(ctx)).transpose()?;
        let workloads = self
            .workloads
            .map(|ws| ws.into_iter().map(WorkloadManifest::into_descriptor).collect::<Result<Vec<_>>>())
            .transpose()?;
        Ok(SandboxContainerAction::new(self.sandbox_name, policy, workloads))
    }
}

impl PolicyManifest {
    pub fn into_policy(self, ctx: &SandboxContext) -> Result<Policy> {
        match self {
            PolicyManifest::Docker {
                repository,
                tag,
                entrypoint,
                container_name,
                run_options,
            } => {
                let mut builder = ContainerPolicy::builder().run_options(run_options);
                if let Some(repository) = repository {
                    builder = builder.repository(repository);
                }
                if let Some(tag) = tag {
                    builder = builder.tag(tag);
                }
                if let Some(entrypoint) = entrypoint {
                    builder = builder.entrypoint(entrypoint);
                }
                if let Some(name) = container_name {
                    builder = builder.container_name(name);
                }
                Ok(Policy::Container(builder.build()?))
            }
            PolicyManifest::User { username, uid, gid } => {
                let identity = ctx.identity.as_ref();
                let policy = match (username, uid) {
                    (Some(_), Some(_)) => {
                        return Err(SandboxError::configuration(
                            "user policy takes either a username or a uid, not both",
                        ))
                    }
                    (Some(username), None) => UserPolicy::for_username(&username, identity)?,
                    (None, Some(uid)) => {
                        // Without an explicit gid the account's primary group is used.
                        let gid = match gid {
                            Some(gid) => gid,
                            None => identity.account(uid)?.gid,
                        };
                        UserPolicy::new(Some(User::new(uid, gid)), identity)
                    }
                    (None, None) if gid.is_some() => {
                        return Err(SandboxError::configuration("user policy gid requires a uid"))
                    }
                    (None, None) => UserPolicy::new(None, identity),
                };
                Ok(Policy::User(policy))
            }
        }
    }
}

impl WorkloadManifest {
    pub fn into_descriptor(self) -> Result<WorkloadDescriptor> {
        let mut builder = WorkloadDescriptor::builder(self.package, self.executable);
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        if let Some(namespace) = self.namespace {
            builder = builder.namespace(namespace);
        }
        for parameter in self.parameters.into_iter().flatten() {
            builder = match parameter {
                Parameter::Value { name, value } => builder.parameter(name, value),
                Parameter::File { file } => builder.parameter_file(file),
            };
        }
        for Remapping { from, to } in self.remappings.into_iter().flatten() {
            builder = builder.remap(from, to);
        }
        builder.build()
    }
}
