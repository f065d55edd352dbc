//! Call boundary to the container engine.
//!
//! The controller only needs five operations from the engine; everything else
//! (registries, storage drivers, networking) stays behind this trait.

use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Options the controller always sets itself when starting a container.
pub const RESERVED_RUN_OPTIONS: &[&str] = &["image", "tty", "detach", "auto_remove", "name"];

/// Engine run options forwarded verbatim to `start_context`, e.g. `cpuset_cpus`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOptions(BTreeMap<String, Value>);

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails on keys the controller owns.
    pub fn from_map(options: BTreeMap<String, Value>) -> Result<Self> {
        let mut reserved: Vec<&str> = options
            .keys()
            .map(String::as_str)
            .filter(|k| RESERVED_RUN_OPTIONS.contains(k))
            .collect();
        if !reserved.is_empty() {
            reserved.sort_unstable();
            return Err(SandboxError::configuration(format!(
                "run options may not override reserved keys: {}",
                reserved.join(", ")
            )));
        }
        Ok(Self(options))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A running container, addressed by engine id and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub output: Vec<u8>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Fetches `repository:tag` from its registry. Returns
    /// `SandboxError::ResourceNotFound` when the registry does not know the image.
    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()>;

    /// Images present locally, as `repository:tag`.
    async fn local_images(&self) -> Result<Vec<String>>;

    async fn start_context(
        &self,
        image: &str,
        name: &str,
        options: &RunOptions,
    ) -> Result<ContainerHandle>;

    async fn exec_in_context(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        detach: bool,
    ) -> Result<ExecOutput>;

    async fn stop_context(&self, handle: &ContainerHandle) -> Result<()>;

    /// Makes sure `repository:tag` is usable locally.
    ///
    /// The image is always pulled so that stale local copies get updated. If the
    /// pull fails but a local copy exists, the local copy wins. Otherwise the
    /// failure is returned, listing the local images when the image is unknown.
    async fn ensure_image(&self, repository: &str, tag: &str) -> Result<()> {
        let image = format!("{}:{}", repository, tag);
        debug!(%image, "Pulling image");

        let pull_err = match self.pull_image(repository, tag).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let available = self.local_images().await.unwrap_or_else(|e| {
            warn!(error = %e, "Could not list local images");
            Vec::new()
        });

        if available.iter().any(|i| *i == image) {
            warn!(%image, error = %pull_err, "Image could not be pulled, using local copy");
            return Ok(());
        }

        match pull_err {
            SandboxError::ResourceNotFound { resource, .. } => {
                Err(SandboxError::ResourceNotFound { resource, available })
            }
            other => Err(other),
        }
    }
}
