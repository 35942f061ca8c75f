use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use kiln_config::KilnConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{ChildStderr, Command};

use crate::process::ChildProcess;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handle on a running worker.
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Resolves with the exit code once the worker has exited. Must be
    /// cancel-safe.
    fn wait(&mut self) -> BoxFuture<'_, Option<i32>>;

    /// Force-terminate the worker and anything it spawned.
    fn terminate(&mut self) -> BoxFuture<'_, ()>;
}

/// Byte streams to a freshly started worker, plus its process handle.
pub struct WorkerConnection {
    pub reader: Box<dyn AsyncRead + Unpin + Send>,
    pub writer: Box<dyn AsyncWrite + Unpin + Send>,
    pub process: Box<dyn WorkerProcess>,
}

pub trait WorkerLauncher: Send + Sync {
    /// Start a new worker generation. `channel_id` is unique per generation.
    fn launch(&self, channel_id: &str) -> io::Result<WorkerConnection>;
}

/// Launcher used when no worker executable is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

impl WorkerLauncher for Unconfigured {
    fn launch(&self, _channel_id: &str) -> io::Result<WorkerConnection> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no worker executable configured",
        ))
    }
}

/// Spawns the worker as a child process talking over stdin/stdout.
#[derive(Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    kill_grace: Duration,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            kill_grace: Duration::from_millis(250),
        }
    }

    /// `None` when `[worker] executable` is unset.
    pub fn from_config(config: &KilnConfig) -> Option<Self> {
        let program = config.worker.executable.clone()?;
        let program = if program.is_relative() {
            config.paths.root.join(program)
        } else {
            program
        };
        Some(Self {
            program,
            args: config.worker.args.clone(),
            env: worker_environment(config),
            kill_grace: config.worker.kill_grace(),
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

impl fmt::Display for ProcessLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLauncher")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env_keys", &self.env.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .finish()
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, channel_id: &str) -> io::Result<WorkerConnection> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("--parent")
            .arg(std::process::id().to_string())
            .arg("--channel")
            .arg(channel_id)
            .args(&self.args)
            .envs(self.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so termination reaches anything the worker spawns.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                // SAFETY: `setpgid` is async-signal-safe and does not allocate.
                // This is executed after `fork` in the child process.
                if libc::setpgid(0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let Some(stdin) = child.stdin.take() else {
            return Err(io::Error::other("worker stdin was not captured"));
        };
        let Some(stdout) = child.stdout.take() else {
            return Err(io::Error::other("worker stdout was not captured"));
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, child.id()));
        }

        tracing::debug!(target: "kiln.supervisor", command = %self, pid = ?child.id(), channel = channel_id, "spawned worker");

        Ok(WorkerConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess::new(child, self.kill_grace)),
        })
    }
}

async fn forward_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(target: "kiln.worker", pid = ?pid, "{line}");
    }
}

/// Environment handed to the worker: host paths, compiler switches and logging
/// settings, as `KILN_<Section>__<Key>` variables.
pub fn worker_environment(config: &KilnConfig) -> Vec<(String, String)> {
    let paths = &config.paths;
    let worker = &config.worker;
    let logs = paths.logs_dir();
    let entries = [
        ("Path:Root", paths.root.display().to_string()),
        ("Path:Logging", logs.display().to_string()),
        ("Path:Plugins", paths.plugins_dir().display().to_string()),
        ("Path:Configuration", paths.config_dir().display().to_string()),
        ("Path:Data", paths.data_dir().display().to_string()),
        ("Path:Libraries", paths.libraries_dir().display().to_string()),
        ("Compiler:AllowUnsafe", worker.allow_unsafe.to_string()),
        (
            "Compiler:UseStandardLibraries",
            worker.use_standard_libraries.to_string(),
        ),
        ("Compiler:Force", worker.force.to_string()),
        ("Compiler:EnableMessageStream", "true".to_owned()),
        (
            "Logging:FileName",
            logs.join("kiln-compiler.log").display().to_string(),
        ),
        ("Logging:Level", config.logging.worker_level().to_owned()),
    ];
    entries
        .into_iter()
        .map(|(key, value)| (format!("KILN_{}", key.replace(':', "__")), value))
        .collect()
}
