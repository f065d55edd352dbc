use crate::env::identity::User;
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How long a terminated workload gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A workload process started under another identity.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    label: String,
    child: Option<Child>,
}

impl ProcessHandle {
    /// Handle for a process this crate does not own a `Child` for.
    pub fn detached(pid: Option<u32>, label: impl Into<String>) -> Self {
        Self {
            pid,
            label: label.into(),
            child: None,
        }
    }

    fn from_child(child: Child, label: String) -> Self {
        Self {
            pid: child.id(),
            label,
            child: Some(child),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn_as(
        &self,
        user: User,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle>;

    /// SIGTERM, then SIGKILL once the grace period is over.
    async fn terminate(&self, mut handle: ProcessHandle) -> Result<()> {
        let Some(child) = handle.child.as_mut() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        if let Some(pid) = child.id() {
            // SAFETY: plain syscall on a pid we spawned and have not reaped yet.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(label = %handle.label, ?status, "Workload exited");
            }
            Err(_) => {
                warn!(label = %handle.label, "Workload ignored SIGTERM, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Spawns workloads as local child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSpawner;

#[async_trait]
impl ProcessSpawner for LocalSpawner {
    async fn spawn_as(
        &self,
        user: User,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| SandboxError::configuration("cannot spawn an empty command"))?;

        let child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(env)
            .uid(user.uid)
            .gid(user.gid)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| SandboxError::runtime(format!("spawn {}", program), e))?;

        debug!(pid = ?child.id(), uid = user.uid, gid = user.gid, ?command, "Spawned workload");
        Ok(ProcessHandle::from_child(child, command.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::identity::{IdentityResolver, SystemIdentity};

    #[tokio::test]
    async fn test_spawn_and_terminate_as_current_user() {
        let me = SystemIdentity.current_user();
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());

        let cmd = vec!["sleep".to_string(), "30".to_string()];
        let handle = LocalSpawner.spawn_as(me, &cmd, &env).await.unwrap();
        assert!(handle.pid().is_some());
        assert_eq!(handle.label(), "sleep 30");

        LocalSpawner.terminate(handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let me = SystemIdentity.current_user();
        let err = LocalSpawner.spawn_as(me, &[], &BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Configuration { .. }));
    }
}
