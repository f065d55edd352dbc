/// Sandbox actions driven through the launch service
mod common;

#[cfg(test)]
mod action_tests {
    use super::common::{context, service, Call, MockRuntime};
    use launch_sandbox::{
        ContainerPolicy, LifecycleState, Outcome, SandboxContainerAction, SandboxError,
        SandboxManifest, WorkloadDescriptor,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    fn node(executable: &str) -> WorkloadDescriptor {
        WorkloadDescriptor::new("demo_nodes_cpp", executable).unwrap()
    }

    #[tokio::test]
    async fn test_workloads_without_policy_are_a_no_op() {
        let runtime = Arc::new(MockRuntime::default());
        let service = service(&runtime);
        let action = SandboxContainerAction::default()
            .with_name("my_sandbox")
            .with_workload(node("talker"));

        assert!(action.activate(service.context()).is_none());
        let signal = service.launch(&action).await;
        assert!(matches!(signal.outcome(), Some(Outcome::Succeeded)));
        assert!(service.controllers().is_empty());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_policy_without_workloads_is_a_no_op() {
        let runtime = Arc::new(MockRuntime::default());
        let action = SandboxContainerAction::default().with_policy(ContainerPolicy::default());
        assert!(action.activate(&context(&runtime)).is_none());

        let action = action.with_workloads(Vec::new());
        let controller = action.activate(&context(&runtime)).expect("empty workload list still runs");
        assert!(controller.workloads().is_empty());
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reserved_run_option_rejected_before_engine_is_used() {
        let runtime = Arc::new(MockRuntime::default());
        let manifest = SandboxManifest::from_json_str(
            r#"{
                "policy": { "kind": "docker", "run_options": { "auto_remove": false } },
                "workloads": [ { "package": "demo_nodes_cpp", "executable": "talker" } ]
            }"#,
        )
        .unwrap();

        let err = manifest.into_action(&context(&runtime)).unwrap_err();
        assert!(matches!(err, SandboxError::Configuration { .. }));
        assert!(err.to_string().contains("auto_remove"));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_manifest_end_to_end() {
        let runtime = Arc::new(MockRuntime::default());
        let service = service(&runtime);
        service.set_launch_configuration("robot", "r2");
        let action = SandboxManifest::from_json_str(
            r#"{
                "sandbox_name": "my_sandbox",
                "policy": {
                    "kind": "docker",
                    "repository": "ubuntu",
                    "container_name": "sandboxed-listener-node",
                    "run_options": { "cpuset_cpus": "0" }
                },
                "workloads": [
                    {
                        "package": "demo_nodes_cpp",
                        "executable": "listener",
                        "namespace": "$(var robot)",
                        "parameters": [ { "name": "qos depth", "value": "10" } ]
                    }
                ]
            }"#,
        )
        .unwrap()
        .into_action(service.context())
        .unwrap();

        let signal = service.launch(&action).await;
        let controller = service.controllers().pop().unwrap();
        let state = controller
            .wait_for_state(|s| s == LifecycleState::Running || s.is_terminal())
            .await;
        assert_eq!(state, LifecycleState::Running);

        let calls = runtime.calls();
        assert_eq!(calls[0], Call::Pull("ubuntu:latest".to_string()));
        assert_eq!(
            calls[1],
            Call::Start {
                image: "ubuntu:latest".to_string(),
                name: "sandboxed-listener-node".to_string(),
                options: vec![("cpuset_cpus".to_string(), Value::from("0"))],
            }
        );
        assert_eq!(
            runtime.exec_calls(),
            vec![vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                "ros2 run demo_nodes_cpp listener --ros-args -r __ns:=r2 -p 'qos depth:=10'"
                    .to_string(),
            ]]
        );

        service.shutdown();
        let outcome = tokio::time::timeout(Duration::from_secs(5), signal.wait())
            .await
            .expect("sandbox stops after shutdown");
        assert!(outcome.is_cancelled());
        assert_eq!(runtime.live(), 0);
    }

    #[tokio::test]
    async fn test_service_shutdown_stops_every_sandbox() {
        let runtime = Arc::new(MockRuntime::default());
        let service = service(&runtime);

        for name in ["left", "right"] {
            let policy = ContainerPolicy::builder().container_name(name).build().unwrap();
            let action = SandboxContainerAction::default()
                .with_name(name)
                .with_policy(policy)
                .with_workload(node("talker"));
            service.launch(&action).await;
        }
        let idle = SandboxContainerAction::default().with_workload(node("listener"));
        service.launch(&idle).await;
        assert_eq!(service.controllers().len(), 2);

        let outcomes = service.run_until(tokio::task::yield_now()).await;
        let labels: Vec<&str> = outcomes.iter().map(|(label, _)| label.as_str()).collect();
        assert_eq!(labels, ["left", "right", "sandbox"]);
        assert!(outcomes[0].1.is_cancelled());
        assert!(outcomes[1].1.is_cancelled());
        assert!(outcomes[2].1.is_succeeded());

        assert!(runtime.max_live() <= 2);
        assert_eq!(runtime.live(), 0);
        for controller in service.controllers() {
            assert_eq!(controller.state().await, LifecycleState::Stopped);
        }
    }

    #[tokio::test]
    async fn test_launch_after_shutdown_is_cancelled() {
        let runtime = Arc::new(MockRuntime::default());
        let service = service(&runtime);
        service.shutdown();
        assert!(service.is_shutting_down());

        let action = SandboxContainerAction::default()
            .with_policy(ContainerPolicy::default())
            .with_workload(node("talker"));
        let outcome = service.launch(&action).await.wait().await;
        assert!(outcome.is_cancelled());
        assert_eq!(runtime.live(), 0);
    }
}
