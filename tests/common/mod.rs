//! In-memory adapters shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use launch_sandbox::env::{AccountRecord, IdentityResolver, ProcessHandle, ProcessSpawner, User};
use launch_sandbox::runtime::ExecOutput;
use launch_sandbox::{
    ContainerHandle, ContainerRuntime, LaunchService, Result, RunOptions, SandboxContext, SandboxError,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Pull(String),
    LocalImages,
    Start {
        image: String,
        name: String,
        options: Vec<(String, Value)>,
    },
    Exec {
        container: String,
        command: Vec<String>,
        detach: bool,
    },
    Stop(String),
}

/// Container runtime that records every call and counts live contexts.
///
/// Each adapter call can be held at a gate (a semaphore with no permits) so
/// tests can interleave shutdown with a specific startup step.
#[derive(Default)]
pub struct MockRuntime {
    pub calls: Mutex<Vec<Call>>,
    pub local: Vec<String>,
    pub pull_missing: bool,
    pub start_fails: bool,
    pub start_panics: bool,
    pub stop_fails: bool,
    /// Exec fails for commands mentioning this package.
    pub exec_fails_for: Option<String>,

    pub pull_gate: Option<Arc<Semaphore>>,
    pub start_gate: Option<Arc<Semaphore>>,
    pub exec_gate: Option<Arc<Semaphore>>,
    pub pull_entered: Notify,
    pub start_entered: Notify,
    pub exec_entered: Notify,

    pub live: AtomicUsize,
    pub max_live: AtomicUsize,
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
}

pub fn gate() -> Arc<Semaphore> {
    Arc::new(Semaphore::new(0))
}

pub fn open(gate: &Semaphore) {
    gate.add_permits(1024);
}

async fn pass(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

impl MockRuntime {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::Exec { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn pull_image(&self, repository: &str, tag: &str) -> Result<()> {
        let image = format!("{}:{}", repository, tag);
        self.calls.lock().push(Call::Pull(image.clone()));
        self.pull_entered.notify_one();
        pass(&self.pull_gate).await;
        if self.pull_missing {
            return Err(SandboxError::ResourceNotFound {
                resource: format!("image {}", image),
                available: Vec::new(),
            });
        }
        Ok(())
    }

    async fn local_images(&self) -> Result<Vec<String>> {
        self.calls.lock().push(Call::LocalImages);
        Ok(self.local.clone())
    }

    async fn start_context(&self, image: &str, name: &str, options: &RunOptions) -> Result<ContainerHandle> {
        self.calls.lock().push(Call::Start {
            image: image.to_string(),
            name: name.to_string(),
            options: options.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        });
        self.start_entered.notify_one();
        pass(&self.start_gate).await;
        if self.start_fails {
            return Err(SandboxError::runtime("docker run", "engine refused the container"));
        }
        if self.start_panics {
            panic!("engine client crashed");
        }

        let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(ContainerHandle {
            id: format!("c{}", n),
            name: name.to_string(),
        })
    }

    async fn exec_in_context(
        &self,
        handle: &ContainerHandle,
        command: &[String],
        detach: bool,
    ) -> Result<ExecOutput> {
        self.calls.lock().push(Call::Exec {
            container: handle.id.clone(),
            command: command.to_vec(),
            detach,
        });
        self.exec_entered.notify_one();
        pass(&self.exec_gate).await;
        if let Some(package) = &self.exec_fails_for {
            if command.iter().any(|a| a.contains(package.as_str())) {
                return Err(SandboxError::runtime("docker exec", "exec failed"));
            }
        }
        Ok(ExecOutput {
            exit_code: None,
            output: Vec::new(),
        })
    }

    async fn stop_context(&self, handle: &ContainerHandle) -> Result<()> {
        self.calls.lock().push(Call::Stop(handle.id.clone()));
        if self.stop_fails {
            return Err(SandboxError::runtime("docker stop", "daemon not responding"));
        }
        self.stopped.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FixedIdentity;

impl IdentityResolver for FixedIdentity {
    fn current_user(&self) -> User {
        User::new(1000, 1000)
    }

    fn resolve_user(&self, username: &str) -> Result<User> {
        match username {
            "ros2_user" => Ok(User::new(1001, 1001)),
            _ => Err(SandboxError::ResourceNotFound {
                resource: format!("user {}", username),
                available: Vec::new(),
            }),
        }
    }

    fn account(&self, uid: u32) -> Result<AccountRecord> {
        match uid {
            1000 | 1001 => Ok(AccountRecord {
                name: "ros2_user".to_string(),
                uid,
                gid: uid,
                home: PathBuf::from("/home/ros2_user"),
            }),
            _ => Err(SandboxError::ResourceNotFound {
                resource: format!("user uid={}", uid),
                available: Vec::new(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Spawned {
    pub user: User,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Records spawns and terminations instead of creating processes.
#[derive(Default)]
pub struct MockSpawner {
    pub spawned: Mutex<Vec<Spawned>>,
    pub terminated: Mutex<Vec<String>>,
    pub terminate_fails: bool,
    pub next_pid: AtomicUsize,
}

#[async_trait]
impl ProcessSpawner for MockSpawner {
    async fn spawn_as(
        &self,
        user: User,
        command: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle> {
        self.spawned.lock().push(Spawned {
            user,
            command: command.to_vec(),
            env: env.clone(),
        });
        let pid = 4000 + self.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        Ok(ProcessHandle::detached(Some(pid), command.join(" ")))
    }

    async fn terminate(&self, handle: ProcessHandle) -> Result<()> {
        self.terminated.lock().push(handle.label().to_string());
        if self.terminate_fails {
            return Err(SandboxError::runtime("kill", "operation not permitted"));
        }
        Ok(())
    }
}

pub fn context(runtime: &Arc<MockRuntime>) -> SandboxContext {
    SandboxContext::system()
        .with_runtime(runtime.clone())
        .with_identity(Arc::new(FixedIdentity))
}

pub fn service(runtime: &Arc<MockRuntime>) -> LaunchService {
    LaunchService::new(context(runtime))
}
