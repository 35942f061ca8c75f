use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_module::ModuleImage;
use kiln_supervisor::{BuildSupervisor, ProcessLauncher, SupervisorError, WorkerState};
use tempfile::TempDir;

use crate::support::{init_tracing, job, job_with_source, worker_config};

fn launcher(state_dir: &Path) -> Arc<ProcessLauncher> {
    Arc::new(
        ProcessLauncher::new(env!("CARGO_BIN_EXE_kiln-test-worker"))
            .arg("--state-dir")
            .arg(state_dir.display().to_string())
            .kill_grace(Duration::from_millis(100)),
    )
}

fn configure(state_dir: &Path, conf: &str) -> anyhow::Result<()> {
    std::fs::write(state_dir.join("kiln-test-worker.conf"), conf)?;
    Ok(())
}

fn attempts(state_dir: &Path) -> usize {
    std::fs::read_to_string(state_dir.join("attempts.log"))
        .map(|log| log.lines().count())
        .unwrap_or(0)
}

#[tokio::test]
async fn worker_process_compiles_a_module() -> anyhow::Result<()> {
    init_tracing();
    let tmp = TempDir::new()?;
    let supervisor = BuildSupervisor::start(worker_config(), launcher(tmp.path()));

    let source = "namespace Oxide.Plugins\n{\n    public class Alpha : RustPlugin\n    {\n        void Loaded()\n        {\n        }\n    }\n}\n";
    let response = supervisor.compile(1, job_with_source("Alpha", source)).await?;
    assert!(response.has_module());
    let image = ModuleImage::parse(&response.result.data)?;
    let alpha = image.find_type("Oxide.Plugins", "Alpha").expect("Alpha type");
    assert!(alpha.method("Loaded").is_some());
    assert!(alpha.method(".ctor").is_some());

    supervisor.shutdown().await;
    assert_eq!(attempts(tmp.path()), 1);
    Ok(())
}

#[tokio::test]
async fn compiler_errors_suppress_the_module() -> anyhow::Result<()> {
    init_tracing();
    let tmp = TempDir::new()?;
    let supervisor = BuildSupervisor::start(worker_config(), launcher(tmp.path()));

    let source = "public class Alpha : RustPlugin\n{\n#error broken on purpose\n}\n";
    let response = supervisor.compile(3, job_with_source("Alpha", source)).await?;
    assert!(!response.has_module());
    let errors: Vec<_> = response.errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, "CS1029");
    assert_eq!(errors[0].script_name(), "Alpha");

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn crashed_worker_fails_outstanding_jobs_then_restarts() -> anyhow::Result<()> {
    init_tracing();
    let tmp = TempDir::new()?;
    configure(tmp.path(), "crash_attempts=1\ncrash_after_jobs=2\n")?;
    let supervisor = BuildSupervisor::start(worker_config(), launcher(tmp.path()));

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

    let response = supervisor.compile(9, job("Gamma")).await?;
    assert!(response.has_module());
    assert_eq!(attempts(tmp.path()), 2);

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn job_failure_message_is_surfaced() -> anyhow::Result<()> {
    init_tracing();
    let tmp = TempDir::new()?;
    configure(tmp.path(), "fail_jobs=true\n")?;
    let supervisor = BuildSupervisor::start(worker_config(), launcher(tmp.path()));

    let err = supervisor.compile(1, job("Alpha")).await.unwrap_err();
    assert_eq!(err, SupervisorError::Worker("compiler process faulted".into()));

    supervisor.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn worker_ignoring_shutdown_is_killed_after_grace() -> anyhow::Result<()> {
    init_tracing();
    let tmp = TempDir::new()?;
    configure(tmp.path(), "ignore_shutdown=true\n")?;
    let mut config = worker_config();
    config.shutdown_grace_ms = 200;
    let supervisor = BuildSupervisor::start(config, launcher(tmp.path()));

    supervisor.compile(1, job("Alpha")).await?;

    let start = Instant::now();
    supervisor.stop_worker().await;
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(supervisor.state(), WorkerState::Stopped);

    supervisor.shutdown().await;
    Ok(())
}
