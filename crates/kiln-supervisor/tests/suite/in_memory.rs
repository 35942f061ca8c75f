use std::sync::Arc;
use std::time::Duration;

use kiln_proto::Severity;
use kiln_supervisor::{BuildSupervisor, SupervisorError, Unconfigured, WorkerState};
use tokio::time::timeout;

use crate::support::{init_tracing, job, worker_config, Behavior, FakeLauncher};

async fn wait_for_state(supervisor: &BuildSupervisor, state: WorkerState) {
    let mut states = supervisor.watch_state();
    timeout(Duration::from_secs(5), states.wait_for(|current| *current == state))
        .await
        .expect("timed out waiting for worker state")
        .expect("supervisor dropped its state channel");
}

#[tokio::test]
async fn jobs_submitted_before_ready_are_flushed_in_order() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior {
        ready_delay: Duration::from_millis(100),
        ..Behavior::default()
    });
    let supervisor = BuildSupervisor::start(worker_config(), launcher.clone());
    assert_eq!(supervisor.state(), WorkerState::Stopped);

    let (alpha, beta) = tokio::join!(
        supervisor.compile(1, job("Alpha")),
        supervisor.compile(2, job("Beta")),
    );

    let alpha = alpha.unwrap();
    let beta = beta.unwrap();
    assert_eq!(alpha.result.name, "Alpha.dll");
    assert_eq!(beta.result.name, "Beta.dll");
    assert_eq!(alpha.diagnostics.len(), 1);
    assert_eq!(alpha.diagnostics[0].severity, Severity::Warning);
    assert_eq!(alpha.errors().count(), 0);
    assert_eq!(launcher.launches(), 1);
    assert_eq!(supervisor.state(), WorkerState::Ready);

    supervisor.shutdown().await;
    assert_eq!(launcher.shutdowns(), 1);
}

#[tokio::test]
async fn response_for_unknown_id_is_dropped() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior {
        stray_response: true,
        ..Behavior::default()
    });
    let supervisor = BuildSupervisor::start(worker_config(), launcher.clone());

    let response = supervisor.compile(5, job("Alpha")).await.unwrap();
    assert_eq!(response.result.name, "Alpha.dll");
    assert!(response.has_module());

    // The channel survived the anomaly.
    let response = supervisor.compile(6, job("Beta")).await.unwrap();
    assert_eq!(response.result.name, "Beta.dll");
    assert_eq!(launcher.launches(), 1);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn worker_failure_is_reported_to_the_job() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior {
        fail_with: Some("compiler process faulted".into()),
        ..Behavior::default()
    });
    let supervisor = BuildSupervisor::start(worker_config(), launcher);

    let err = supervisor.compile(1, job("Alpha")).await.unwrap_err();
    assert_eq!(err, SupervisorError::Worker("compiler process faulted".into()));
    assert_eq!(supervisor.state(), WorkerState::Ready);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn reply_written_just_before_exit_is_delivered() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior {
        exit_after_reply: true,
        ..Behavior::default()
    });
    let supervisor = BuildSupervisor::start(worker_config(), launcher.clone());

    for round in 0..3 {
        let name = format!("Alpha{round}");
        let response = supervisor.compile(round + 1, job(&name)).await.unwrap();
        assert_eq!(response.result.name, format!("{name}.dll"));
        wait_for_state(&supervisor, WorkerState::Crashed).await;
    }
    assert_eq!(launcher.launches(), 3);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn outstanding_id_cannot_be_reused() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior {
        silent: true,
        ..Behavior::default()
    });
    let supervisor = Arc::new(BuildSupervisor::start(worker_config(), launcher));

    let first = tokio::spawn({
        let supervisor = supervisor.clone();
        async move { supervisor.compile(1, job("Alpha")).await }
    });
    wait_for_state(&supervisor, WorkerState::Busy).await;

    let err = supervisor.compile(1, job("Beta")).await.unwrap_err();
    assert_eq!(err, SupervisorError::DuplicateId(1));

    supervisor.stop_worker().await;
    let err = first.await.unwrap().unwrap_err();
    assert_eq!(err, SupervisorError::WorkerUnavailable("stop requested".into()));
    assert_eq!(supervisor.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn idle_worker_is_stopped_and_restarted_on_demand() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior::default());
    let mut config = worker_config();
    config.idle_timeout_ms = 100;
    let supervisor = BuildSupervisor::start(config, launcher.clone());

    supervisor.compile(1, job("Alpha")).await.unwrap();
    wait_for_state(&supervisor, WorkerState::Stopped).await;
    assert_eq!(launcher.shutdowns(), 1);

    supervisor.compile(2, job("Alpha")).await.unwrap();
    assert_eq!(launcher.launches(), 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn crash_fails_every_outstanding_job_then_recovers() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior {
        crash_after: Some(2),
        ..Behavior::default()
    });
    let supervisor = BuildSupervisor::start(worker_config(), launcher.clone());

    let (seven, eight) = tokio::join!(
        supervisor.compile(7, job("Alpha")),
        supervisor.compile(8, job("Beta")),
    );
    for result in [seven, eight] {
        match result {
            Err(SupervisorError::WorkerUnavailable(_)) => {}
            other => panic!("expected worker unavailable, got {other:?}"),
        }
    }
    assert_eq!(supervisor.state(), WorkerState::Crashed);

    let response = supervisor.compile(9, job("Gamma")).await.unwrap();
    assert_eq!(response.result.name, "Gamma.dll");
    assert_eq!(launcher.launches(), 2);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn silent_worker_times_out_on_heartbeats() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior {
        silent: true,
        ..Behavior::default()
    });
    let mut config = worker_config();
    config.heartbeat_interval_ms = 20;
    config.heartbeat_timeout_ms = 150;
    let supervisor = BuildSupervisor::start(config, launcher);

    let err = supervisor.compile(1, job("Alpha")).await.unwrap_err();
    match err {
        SupervisorError::WorkerUnavailable(reason) => assert!(reason.contains("heartbeat"), "{reason}"),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(supervisor.state(), WorkerState::Crashed);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn worker_that_never_signals_ready_is_abandoned() {
    init_tracing();
    let launcher = FakeLauncher::new(Behavior {
        ready_delay: Duration::from_secs(10),
        ..Behavior::default()
    });
    let mut config = worker_config();
    config.startup_timeout_ms = 100;
    let supervisor = BuildSupervisor::start(config, launcher);

    let err = supervisor.compile(1, job("Alpha")).await.unwrap_err();
    assert_eq!(
        err,
        SupervisorError::WorkerUnavailable("worker did not signal ready within 100ms".into())
    );

    supervisor.shutdown().await;
}

#[tokio::test]
async fn missing_executable_reports_worker_unavailable() {
    init_tracing();
    let supervisor = BuildSupervisor::start(worker_config(), Arc::new(Unconfigured));

    let err = supervisor.compile(1, job("Alpha")).await.unwrap_err();
    assert_eq!(err.to_string(), "worker unavailable: failed to start worker: no worker executable configured");
    assert_eq!(supervisor.state(), WorkerState::Crashed);

    supervisor.shutdown().await;
}
