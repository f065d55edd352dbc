//! Run groups of ROS 2 nodes inside an isolated execution context.
//!
//! A [`SandboxContainerAction`] pairs a [`Policy`] with [`WorkloadDescriptor`]s.
//! Activating it yields a [`LifecycleController`] that a host (for example
//! [`LaunchService`]) executes and shuts down.

pub mod action;
pub mod completion;
pub mod config;
pub mod context;
pub mod controller;
pub mod docker;
pub mod env;
pub mod error;
pub mod launch;
pub mod logging;
pub mod policy;
pub mod runtime;
pub mod substitution;
pub mod workload;

pub use action::SandboxContainerAction;
pub use completion::{CompletionSignal, Outcome};
pub use config::SandboxManifest;
pub use context::SandboxContext;
pub use controller::{ExecutionContext, LifecycleController, LifecycleState};
pub use error::{Result, SandboxError};
pub use launch::{ExecutionHost, LaunchService, ShutdownListener};
pub use policy::{ContainerPolicy, Policy, UserPolicy};
pub use runtime::{ContainerHandle, ContainerRuntime, RunOptions};
pub use substitution::{SubstitutionContext, SubstitutionResolver, Template};
pub use workload::WorkloadDescriptor;
