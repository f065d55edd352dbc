use crate::env::{impersonation_env, utf8_vars, AccountRecord, IdentityResolver, ProcessHandle, ProcessSpawner, User};
use crate::error::{Result, SandboxError};
use crate::workload::ResolvedWorkload;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Runs workloads as child processes of another local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPolicy {
    run_as: User,
}

impl UserPolicy {
    /// Defaults to the identity of the controlling process.
    pub fn new(run_as: Option<User>, identity: &dyn IdentityResolver) -> Self {
        Self {
            run_as: run_as.unwrap_or_else(|| identity.current_user()),
        }
    }

    pub fn for_username(username: &str, identity: &dyn IdentityResolver) -> Result<Self> {
        Ok(Self {
            run_as: identity.resolve_user(username)?,
        })
    }

    pub fn run_as(&self) -> User {
        self.run_as
    }
}

/// The spawned workloads of an impersonation sandbox.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    user: User,
    account: String,
    env: Arc<BTreeMap<String, String>>,
    members: Arc<Mutex<Vec<ProcessHandle>>>,
}

impl ProcessGroup {
    fn new(user: User, account: &AccountRecord) -> Self {
        Self {
            user,
            account: account.name.clone(),
            env: Arc::new(impersonation_env(utf8_vars(std::env::vars_os()), account)),
            members: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn user(&self) -> User {
        self.user
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

pub(crate) struct UserBackend {
    run_as: User,
    identity: Arc<dyn IdentityResolver>,
    spawner: Arc<dyn ProcessSpawner>,
}

impl UserBackend {
    pub(crate) fn new(
        policy: UserPolicy,
        identity: Arc<dyn IdentityResolver>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        Self {
            run_as: policy.run_as,
            identity,
            spawner,
        }
    }

    pub(crate) fn describe(&self) -> String {
        format!("user uid={} gid={}", self.run_as.uid, self.run_as.gid)
    }

    pub(crate) async fn acquire(&self) -> Result<AccountRecord> {
        self.identity
            .account(self.run_as.uid)
            .map_err(|e| e.into_startup("acquire"))
    }

    pub(crate) fn start(&self, account: &AccountRecord) -> ProcessGroup {
        ProcessGroup::new(self.run_as, account)
    }

    pub(crate) async fn inject(&self, group: &ProcessGroup, workload: &ResolvedWorkload) -> Result<()> {
        let cmd = workload.command();
        let handle = self
            .spawner
            .spawn_as(group.user, &cmd, &group.env)
            .await
            .map_err(|e| SandboxError::Injection {
                workload: workload.label(),
                reason: e.to_string(),
            })?;
        debug!(account = %group.account, pid = ?handle.pid(), ?cmd, "Spawned workload");
        group.members.lock().push(handle);
        Ok(())
    }

    /// Terminates every member; the first failure is reported after all were attempted.
    pub(crate) async fn release(&self, group: &ProcessGroup) -> Result<()> {
        let members: Vec<ProcessHandle> = std::mem::take(&mut *group.members.lock());
        let mut first_err = None;
        for handle in members {
            let label = handle.label().to_string();
            if let Err(e) = self.spawner.terminate(handle).await {
                first_err.get_or_insert(SandboxError::Shutdown {
                    context: label,
                    reason: e.to_string(),
                });
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SystemIdentity;
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct FixedIdentity;

    impl IdentityResolver for FixedIdentity {
        fn current_user(&self) -> User {
            User::new(1000, 1000)
        }

        fn resolve_user(&self, username: &str) -> Result<User> {
            match username {
                "ros2_user" => Ok(User::new(1001, 1002)),
                _ => Err(SandboxError::ResourceNotFound {
                    resource: format!("user {}", username),
                    available: vec![],
                }),
            }
        }

        fn account(&self, uid: u32) -> Result<AccountRecord> {
            Err(SandboxError::ResourceNotFound {
                resource: format!("user uid={}", uid),
                available: vec![],
            })
        }
    }

    #[test]
    fn test_defaults_to_current_identity() {
        let policy = UserPolicy::new(None, &FixedIdentity);
        assert_eq!(policy.run_as(), User::new(1000, 1000));

        let policy = UserPolicy::new(Some(User::new(0, 0)), &FixedIdentity);
        assert_eq!(policy.run_as(), User::new(0, 0));
    }

    #[test]
    fn test_from_username() {
        let policy = UserPolicy::for_username("ros2_user", &FixedIdentity).unwrap();
        assert_eq!(policy.run_as(), User::new(1001, 1002));
        assert!(UserPolicy::for_username("nobody-here", &FixedIdentity).is_err());
    }

    #[test]
    fn test_system_default_matches_process() {
        let policy = UserPolicy::new(None, &SystemIdentity);
        assert_eq!(policy.run_as(), SystemIdentity.current_user());
    }

    /// Terminating anything but the talker fails.
    #[derive(Default)]
    struct StubbornSpawner {
        attempted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessSpawner for StubbornSpawner {
        async fn spawn_as(
            &self,
            _user: User,
            command: &[String],
            _env: &BTreeMap<String, String>,
        ) -> Result<ProcessHandle> {
            Ok(ProcessHandle::detached(None, command.join(" ")))
        }

        async fn terminate(&self, handle: ProcessHandle) -> Result<()> {
            self.attempted.lock().push(handle.label().to_string());
            if handle.label().contains("talker") {
                Ok(())
            } else {
                Err(SandboxError::runtime("kill", "operation not permitted"))
            }
        }
    }

    fn workload(executable: &str) -> ResolvedWorkload {
        ResolvedWorkload {
            package: "demo_nodes_cpp".to_string(),
            executable: executable.to_string(),
            name: None,
            namespace: String::new(),
            parameters: Vec::new(),
            remappings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_release_attempts_all_and_reports_first_failure() {
        let spawner = Arc::new(StubbornSpawner::default());
        let backend = UserBackend::new(
            UserPolicy::new(None, &FixedIdentity),
            Arc::new(FixedIdentity),
            spawner.clone(),
        );
        let account = AccountRecord {
            name: "ros2_user".to_string(),
            uid: 1000,
            gid: 1000,
            home: PathBuf::from("/home/ros2_user"),
        };
        let group = backend.start(&account);
        for exe in ["talker", "listener", "add_two_ints_server"] {
            backend.inject(&group, &workload(exe)).await.unwrap();
        }
        assert_eq!(group.len(), 3);

        let err = backend.release(&group).await.unwrap_err();
        match err {
            SandboxError::Shutdown { context, .. } => {
                assert_eq!(context, "ros2 run demo_nodes_cpp listener");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(spawner.attempted.lock().len(), 3);
        assert!(group.is_empty());
    }
}
