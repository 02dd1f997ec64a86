use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use kstrace_k8s::mock::{ExecScript, MockCluster, MockExecTransport, RecordingClock};
use kstrace_trace::{CleanupCoordinator, INTERRUPTED_EXIT_CODE, TraceOrchestrator};
use kstrace_types::{OutputRoot, PodOutcome, SessionConfig, TargetPod};

struct Session {
    cluster: Arc<MockCluster>,
    transport: Arc<MockExecTransport>,
    coordinator: Arc<CleanupCoordinator>,
    orchestrator: Arc<TraceOrchestrator>,
    dir: tempfile::TempDir,
}

fn session() -> Session {
    let dir = tempfile::tempdir().unwrap();
    let cluster = Arc::new(MockCluster::new());
    let transport = Arc::new(MockExecTransport::new());
    let coordinator = Arc::new(CleanupCoordinator::new());

    let config = SessionConfig {
        output: OutputRoot::Directory(dir.path().to_path_buf()),
        ..Default::default()
    };
    let orchestrator = Arc::new(TraceOrchestrator::new(
        Arc::new(config),
        cluster.clone(),
        transport.clone(),
        Arc::new(RecordingClock::default()),
        coordinator.clone(),
    ));

    Session {
        cluster,
        transport,
        coordinator,
        orchestrator,
        dir,
    }
}

fn targets() -> Vec<TargetPod> {
    (0..3)
        .map(|i| {
            TargetPod::new(format!("web-{i}"), "shop", format!("worker-{i}"))
                .with_container("app", &format!("cri-o://web{i}app"))
        })
        .collect()
}

fn inspect(pid: u32) -> ExecScript {
    ExecScript::exit(0).stdout(&format!(r#"{{"info":{{"pid":{pid}}}}}"#))
}

#[tokio::test]
async fn test_one_failed_probe_fails_only_its_pod() {
    let s = session();
    s.transport.on("inspect web0app", inspect(100));
    s.transport.on("inspect web1app", ExecScript::exit(1).stderr("no such container"));
    s.transport.on("inspect web2app", inspect(300));
    s.transport.on("strace", ExecScript::exit(0).stdout("syscalls\n"));

    let report = s.orchestrator.run(targets()).await.unwrap();

    assert_eq!(report.succeeded().count(), 2);
    assert_eq!(report.failed().count(), 1);
    assert!(report.has_failures());
    assert_eq!(report.pods[1].pod, "web-1");
    assert!(matches!(
        &report.pods[1].outcome,
        PodOutcome::Failed { reason } if reason.contains("no such container")
    ));

    // Three companions, each deleted once; one namespace, deleted once
    let created: BTreeSet<_> = s.cluster.pod_nodes().into_iter().map(|(pod, _)| pod).collect();
    let deleted: Vec<_> = s.cluster.pod_deletes();
    assert_eq!(created.len(), 3);
    assert_eq!(deleted.len(), 3);
    assert_eq!(deleted.into_iter().collect::<BTreeSet<_>>(), created);
    assert_eq!(s.cluster.namespace_deletes(), vec![report.namespace.clone()]);
    assert!(!s.cluster.has_namespace(&report.namespace));
    assert!(report.leaks().is_empty());

    // Companions follow their targets
    let mut nodes: Vec<_> = s.cluster.pod_nodes().into_iter().map(|(_, node)| node).collect();
    nodes.sort();
    assert_eq!(nodes, vec!["worker-0", "worker-1", "worker-2"]);

    let log = s.dir.path().join("web-2").join("app.log");
    assert_eq!(std::fs::read_to_string(log).unwrap(), "syscalls\n");
    assert!(!s.dir.path().join("web-1").exists());
}

#[tokio::test]
async fn test_interrupt_cleans_up_everything_once() {
    let s = session();
    s.transport.on("inspect", inspect(42));
    s.transport.on("strace", ExecScript::hang());

    let run = tokio::spawn({
        let orchestrator = s.orchestrator.clone();
        async move { orchestrator.run(targets()).await }
    });

    while s
        .transport
        .commands()
        .iter()
        .filter(|c| c.starts_with("strace"))
        .count()
        < 3
    {
        tokio::task::yield_now().await;
    }

    assert_eq!(s.coordinator.handle_interrupt().await, INTERRUPTED_EXIT_CODE);
    let report = run.await.unwrap().unwrap();

    assert_eq!(report.failed().count(), 3);
    assert_eq!(s.cluster.namespace_deletes().len(), 1);
    let deleted: BTreeSet<_> = s.cluster.pod_deletes().into_iter().collect();
    assert_eq!(s.cluster.pod_deletes().len(), 3);
    assert_eq!(deleted.len(), 3);
    assert_eq!(s.cluster.live_pods(), 0);
}

#[tokio::test]
async fn test_leaked_namespace_is_reported_not_fatal() {
    let s = session();
    s.transport.on("inspect", inspect(42));
    s.cluster.fail_namespace_delete();

    let report = s.orchestrator.run(targets()).await.unwrap();

    assert_eq!(report.succeeded().count(), 3);
    assert_eq!(s.cluster.namespace_deletes().len(), 1);
    let warning = report.namespace_warning.as_deref().unwrap();
    assert!(warning.contains(&report.namespace));
    assert!(warning.contains("manual deletion is required"));
    assert_eq!(report.leaks().len(), 1);

    // A late interrupt finds nothing left to delete
    s.coordinator.run_all().await;
    assert_eq!(s.cluster.namespace_deletes().len(), 1);
    assert_eq!(s.cluster.pod_deletes().len(), 3);
}

#[tokio::test]
async fn test_interrupt_outlives_the_session_run() {
    let s = session();
    s.transport.on("inspect", inspect(42));
    s.transport.on("strace", ExecScript::hang());
    s.cluster.delete_latency(Duration::from_millis(50));

    let (interrupt, received) = tokio::sync::oneshot::channel::<()>();
    let signals = s.coordinator.on_interrupt(async move {
        let _ = received.await;
    });

    let run = tokio::spawn({
        let orchestrator = s.orchestrator.clone();
        async move { orchestrator.run(targets()).await }
    });

    while s
        .transport
        .commands()
        .iter()
        .filter(|c| c.starts_with("strace"))
        .count()
        < 3
    {
        tokio::task::yield_now().await;
    }
    interrupt.send(()).unwrap();

    // Workers stop long before the slow namespace delete returns
    let report = run.await.unwrap().unwrap();
    assert_eq!(report.failed().count(), 3);

    assert_eq!(signals.finish().await, Some(INTERRUPTED_EXIT_CODE));
    assert_eq!(s.cluster.namespace_deletes(), vec![report.namespace.clone()]);
    assert!(!s.cluster.has_namespace(&report.namespace));
    assert_eq!(s.cluster.pod_deletes().len(), 3);
    assert_eq!(s.cluster.live_pods(), 0);
}
