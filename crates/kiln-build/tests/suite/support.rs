use std::collections::HashSet;
use std::fmt::Write as _;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kiln_build::{BuildContext, BuildCoordinator, BuildHost, CompiledModule, UnitReport};
use kiln_config::{KilnConfig, WorkerConfig};
use kiln_module::{flags, MethodDef, ModuleImage, TypeDef};
use kiln_proto::{CompileResult, CompilerJob, MessageType, WireMessage};
use kiln_supervisor::{BoxFuture, BuildSupervisor, WorkerConnection, WorkerLauncher, WorkerProcess};
use kiln_transport::{FrameReader, FrameWriter};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const REPORT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("kiln=debug")
        .try_init();
}

/// Plugin tree under a temporary root.
pub struct Workspace {
    _root: TempDir,
    pub config: KilnConfig,
}

impl Workspace {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = KilnConfig::with_root(root.path());
        config.compiler.settle_delay_ms = 1;
        config.compiler.lock_retry_ms = 1;
        config.worker = WorkerConfig {
            startup_timeout_ms: 2_000,
            idle_timeout_ms: 60_000,
            shutdown_grace_ms: 500,
            heartbeat_interval_ms: 200,
            heartbeat_timeout_ms: 5_000,
            ..WorkerConfig::default()
        };
        for dir in [
            config.paths.plugins_dir(),
            config.paths.include_dir(),
            config.paths.libraries_dir(),
        ] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(config.paths.libraries_dir().join("System.dll"), b"system").unwrap();
        Self { _root: root, config }
    }

    /// Write `<name>.cs`. `header` goes above the namespace, `body` inside
    /// the class.
    pub fn plugin(&self, name: &str, header: &str, body: &str) {
        let source = format!(
            "{header}\nnamespace Oxide.Plugins\n{{\n    public class {name} : RustPlugin\n    {{\n{body}\n    }}\n}}\n"
        );
        std::fs::write(self.config.paths.plugins_dir().join(format!("{name}.cs")), source).unwrap();
    }

    pub fn include(&self, name: &str, source: &str) {
        std::fs::write(self.config.paths.include_dir().join(format!("{name}.cs")), source).unwrap();
    }

    /// Push the script's modification time forward so it reads as edited.
    pub fn touch(&self, name: &str) {
        let path = self.config.paths.plugins_dir().join(format!("{name}.cs"));
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified + Duration::from_secs(10))
            .unwrap();
    }
}

/// Host that records every callback and forwards reports to the test.
pub struct RecordingHost {
    reports: mpsc::UnboundedSender<UnitReport>,
    pub loads: Mutex<Vec<(String, String)>>,
    pub unloads: Mutex<Vec<String>>,
    refuse: HashSet<String>,
}

impl RecordingHost {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<UnitReport>) {
        Self::refusing(&[])
    }

    pub fn refusing(units: &[&str]) -> (Arc<Self>, mpsc::UnboundedReceiver<UnitReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let host = Arc::new(Self {
            reports,
            loads: Mutex::new(Vec::new()),
            unloads: Mutex::new(Vec::new()),
            refuse: units.iter().map(|unit| unit.to_string()).collect(),
        });
        (host, rx)
    }

    pub fn loaded_names(&self) -> Vec<String> {
        self.loads.lock().iter().map(|(unit, _)| unit.clone()).collect()
    }

    pub fn unloaded_names(&self) -> Vec<String> {
        self.unloads.lock().clone()
    }
}

impl BuildHost for RecordingHost {
    fn unit_changed(&self, report: UnitReport) {
        let _ = self.reports.send(report);
    }

    fn load_requested(&self, unit: &str, module: &Arc<CompiledModule>) -> bool {
        if self.refuse.contains(unit) {
            return false;
        }
        self.loads.lock().push((unit.to_owned(), module.name.clone()));
        true
    }

    fn unload_requested(&self, unit: &str) {
        self.unloads.lock().push(unit.to_owned());
    }
}

pub async fn next_report(reports: &mut mpsc::UnboundedReceiver<UnitReport>) -> UnitReport {
    tokio::time::timeout(REPORT_TIMEOUT, reports.recv())
        .await
        .expect("timed out waiting for a unit report")
        .expect("host dropped")
}

/// Collect `count` reports, sorted by unit name.
pub async fn reports(reports: &mut mpsc::UnboundedReceiver<UnitReport>, count: usize) -> Vec<UnitReport> {
    let mut collected = Vec::with_capacity(count);
    for _ in 0..count {
        collected.push(next_report(reports).await);
    }
    collected.sort_by(|a, b| a.unit.cmp(&b.unit));
    collected
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + REPORT_TIMEOUT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn start(
    workspace: &Workspace,
    launcher: Arc<CompilingLauncher>,
    host: Arc<RecordingHost>,
) -> BuildCoordinator {
    let ctx = Arc::new(BuildContext::new(workspace.config.clone()).unwrap());
    let supervisor = Arc::new(BuildSupervisor::start(workspace.config.worker.clone(), launcher));
    BuildCoordinator::start(ctx, supervisor, host)
}

/// How the in-memory compiler behaves.
#[derive(Clone, Debug, Default)]
pub struct Behavior {
    pub job_delay: Duration,
    /// Answer every job with an `Error` message.
    pub fail_with: Option<String>,
}

/// Launches in-memory workers that turn sources into module images.
pub struct CompilingLauncher {
    behavior: Behavior,
    jobs: Arc<Mutex<Vec<Vec<String>>>>,
    launches: AtomicUsize,
}

impl CompilingLauncher {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            jobs: Arc::new(Mutex::new(Vec::new())),
            launches: AtomicUsize::new(0),
        })
    }

    /// Source file names of every job received, in order.
    pub fn jobs(&self) -> Vec<Vec<String>> {
        self.jobs.lock().clone()
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl WorkerLauncher for CompilingLauncher {
    fn launch(&self, _channel_id: &str) -> io::Result<WorkerConnection> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (host, worker) = tokio::io::duplex(256 * 1024);
        let (reader, writer) = tokio::io::split(host);
        let task = tokio::spawn(compiling_worker(worker, self.behavior.clone(), self.jobs.clone()));
        Ok(WorkerConnection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(TaskProcess {
                task,
                finished: false,
            }),
        })
    }
}

struct TaskProcess {
    task: JoinHandle<()>,
    finished: bool,
}

impl WorkerProcess for TaskProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn wait(&mut self) -> BoxFuture<'_, Option<i32>> {
        Box::pin(async move {
            if !self.finished {
                let _ = (&mut self.task).await;
                self.finished = true;
            }
            Some(0)
        })
    }

    fn terminate(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.task.abort();
            if !self.finished {
                let _ = (&mut self.task).await;
                self.finished = true;
            }
        })
    }
}

async fn compiling_worker(stream: DuplexStream, behavior: Behavior, jobs: Arc<Mutex<Vec<Vec<String>>>>) {
    let (read, write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);
    if writer.write_message(&WireMessage::ready()).await.is_err() {
        return;
    }

    while let Ok(Some(message)) = reader.read_message().await {
        let reply = match message.kind {
            MessageType::Heartbeat => WireMessage::heartbeat(),
            MessageType::Shutdown => return,
            MessageType::Data => {
                let job = CompilerJob::decode(&message.data).unwrap();
                jobs.lock()
                    .push(job.source_files.iter().map(|file| file.name.clone()).collect());
                tokio::time::sleep(behavior.job_delay).await;
                match &behavior.fail_with {
                    Some(failure) => WireMessage::failure(message.id, failure.clone()).unwrap(),
                    None => compile(message.id, &job),
                }
            }
            _ => continue,
        };
        if writer.write_message(&reply).await.is_err() {
            return;
        }
    }
}

/// One public entry type per `class X` line; `#error` lines fail the build.
fn compile(id: u32, job: &CompilerJob) -> WireMessage {
    let mut stdout = String::new();
    let mut module = ModuleImage::new(job.output_file.clone());
    let mut failed = false;
    for file in &job.source_files {
        let text = String::from_utf8_lossy(&file.data);
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        for line in &lines {
            if let Some(message) = line.strip_prefix("#error") {
                failed = true;
                writeln!(stdout, "[Error][CS1029][{}] #error: '{}'", file.name, message.trim()).unwrap();
            }
        }
        for line in &lines {
            let Some((_, rest)) = line.split_once("class ") else {
                continue;
            };
            let Some(name) = rest.split_whitespace().next() else {
                continue;
            };
            let mut ty = TypeDef::new("Oxide.Plugins", name, flags::PUBLIC);
            let hidden = lines.iter().any(|line| line.starts_with(&format!("private {name}(")));
            let visibility = if hidden { flags::PRIVATE } else { flags::PUBLIC };
            ty.methods.push(MethodDef::new(
                ".ctor",
                visibility | flags::CONSTRUCTOR | flags::SPECIAL_NAME,
            ));
            module.types.push(ty);
        }
    }

    let data = if failed { Vec::new() } else { module.to_bytes().unwrap() };
    let result = CompileResult {
        name: job.output_file.clone(),
        data,
        symbols: Vec::new(),
    };
    WireMessage::result(id, &result, Some(stdout)).unwrap()
}
