use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerHandle, ContainerRuntime, ExecOutput, RunOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, trace};

/// Run-option keys whose docker CLI flag is not simply the dashed key.
const FLAG_ALIASES: &[(&str, &str)] = &[
    ("environment", "env"),
    ("mem_limit", "memory"),
    ("volumes", "volume"),
    ("ports", "publish"),
    ("labels", "label"),
    ("devices", "device"),
    ("network_mode", "network"),
    ("working_dir", "workdir"),
    ("publish_all_ports", "publish-all"),
];

/// `nano_cpus` counts billionths of a CPU; the CLI takes `--cpus` as a decimal.
const NANO_CPUS: &str = "nano_cpus";

/// Stderr fragments the docker CLI prints when a registry does not know an image.
const NOT_FOUND_MARKERS: &[&str] = &[
    "not found",
    "manifest unknown",
    "pull access denied",
    "repository does not exist",
];

/// Container runtime backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    /// Use another docker-compatible client, e.g. `podman`.
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, operation: &str, args: &[String]) -> Result<Output> {
        trace!(binary = %self.binary, ?args, "Invoking container CLI");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::runtime(operation, format!("failed to run {}: {}", self.binary, e)))
    }

    async fn run_checked(&self, operation: &str, args: &[String]) -> Result<String> {
        let output = self.run(operation, args).await?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::runtime(operation, err.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Translate forwarded run options into `docker run` flags.
pub fn run_option_flags(options: &RunOptions) -> Vec<String> {
    let mut flags = Vec::new();
    for (key, value) in options.iter() {
        if key == NANO_CPUS {
            if let Some(nanos) = value.as_f64() {
                flags.push(format!("--cpus={}", nanos / 1e9));
                continue;
            }
        }
        let flag = FLAG_ALIASES
            .iter()
            .find(|(k, _)| *k == key.as_str())
            .map(|(_, f)| f.to_string())
            .unwrap_or_else(|| key.replace('_', "-"));

        match value {
            Value::Null | Value::Bool(false) => {}
            Value::Bool(true) => flags.push(format!("--{}", flag)),
            Value::Array(items) => {
                for item in items {
                    flags.push(format!("--{}={}", flag, scalar(item)));
                }
            }
            Value::Object(map) => {
                for (k, v) in map {
                    flags.push(format!("--{}={}={}", flag, k, scalar(v)));
                }
            }
            other => flags.push(format!("--{}={}", flag, scalar(other))),
        }
    }
    flags
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()> {
        let image = format!("{}:{}", repository, tag);
        let output = self.run("docker pull", &["pull".to_string(), image.clone()]).await?;
        if output.status.success() {
            return Ok(());
        }

        let err = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if NOT_FOUND_MARKERS.iter().any(|m| err.contains(m)) {
            return Err(SandboxError::ResourceNotFound {
                resource: image,
                available: Vec::new(),
            });
        }
        Err(SandboxError::runtime("docker pull", err.trim()))
    }

    async fn local_images(&self) -> Result<Vec<String>> {
        let args = ["images", "--format", "{{.Repository}}:{{.Tag}}"].map(String::from);
        let stdout = self.run_checked("docker images", &args).await?;
        Ok(stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .filter(|line| !line.contains("<none>"))
            .collect())
    }

    async fn start_context(
        &self,
        image: &str,
        name: &str,
        options: &RunOptions,
    ) -> Result<ContainerHandle> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--tty".to_string(),
            "--rm".to_string(),
            format!("--name={}", name),
        ];
        args.extend(run_option_flags(options));
        args.push(image.to_string());

        let id = self.run_checked("docker run", &args).await?;
        debug!(%id, %name, %image, "Container started");
        Ok(ContainerHandle {
            id,
            name: name.to_string(),
        })
    }

    async fn exec_in_context(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        detach: bool,
    ) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), "--tty".to_string()];
        if detach {
            args.push("--detach".to_string());
        }
        args.push(handle.id.clone());
        args.extend(command.iter().cloned());

        let output = self.run("docker exec", &args).await?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::runtime("docker exec", err.trim()));
        }
        Ok(ExecOutput {
            exit_code: output.status.code(),
            output: output.stdout,
        })
    }

    async fn stop_context(&self, handle: &ContainerHandle) -> Result<()> {
        self.run_checked("docker stop", &["stop".to_string(), handle.id.clone()])
            .await?;
        Ok(())
    }
}
