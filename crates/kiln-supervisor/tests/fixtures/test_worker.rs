//! Stand-in build worker used by the supervisor and coordinator tests.
//!
//! Speaks the framed wire protocol on stdin/stdout. Instead of compiling, it
//! scans each source for `class <Name>` declarations and emits a module image
//! with one type per class. `#error` and `#warning` lines become diagnostics;
//! any `#error` suppresses the image.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use kiln_module::{flags, MethodDef, ModuleImage, TypeDef};
use kiln_proto::{CompileResult, CompilerJob, MessageType, WireMessage};
use kiln_transport::{FrameReader, FrameWriter};

const PLUGIN_NAMESPACE: &str = "Oxide.Plugins";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;
    let cfg = args
        .state_dir
        .as_deref()
        .map(TestWorkerConfig::load)
        .unwrap_or_default();
    let attempt = match &args.state_dir {
        Some(dir) => record_attempt(dir)?,
        None => 1,
    };

    eprintln!(
        "kiln test worker attempt {attempt} (parent {}, channel {})",
        args.parent, args.channel
    );

    if cfg.ready_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(cfg.ready_delay_ms)).await;
    }

    let mut reader = FrameReader::new(tokio::io::stdin());
    let mut writer = FrameWriter::new(tokio::io::stdout());
    writer.write_message(&WireMessage::ready()).await?;

    let crashing = attempt <= cfg.crash_attempts;
    let mut held = 0u32;
    while let Some(message) = reader.read_message().await? {
        match message.kind {
            MessageType::Heartbeat => {
                if !cfg.silent {
                    writer.write_message(&WireMessage::heartbeat()).await?;
                }
            }
            MessageType::Shutdown => {
                if cfg.ignore_shutdown {
                    eprintln!("kiln test worker ignoring shutdown");
                    continue;
                }
                return Ok(());
            }
            MessageType::Data => {
                if crashing && cfg.crash_after_jobs > 0 {
                    held += 1;
                    if held >= cfg.crash_after_jobs {
                        eprintln!("kiln test worker crashing with {held} jobs outstanding");
                        std::process::exit(3);
                    }
                    continue;
                }
                if cfg.silent {
                    continue;
                }
                if cfg.job_delay_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(cfg.job_delay_ms)).await;
                }
                let reply = match CompilerJob::decode(&message.data) {
                    Ok(_) if cfg.fail_jobs => {
                        WireMessage::failure(message.id, "compiler process faulted")?
                    }
                    Ok(job) => compile(message.id, &job)?,
                    Err(err) => WireMessage::failure(message.id, format!("invalid job: {err}"))?,
                };
                writer.write_message(&reply).await?;
            }
            MessageType::Ready | MessageType::Error | MessageType::Unknown => {}
        }
    }

    Ok(())
}

fn compile(id: u32, job: &CompilerJob) -> Result<WireMessage> {
    let mut stdout = String::new();
    let mut module = ModuleImage::new(job.output_file.clone());
    module.references = job
        .reference_files
        .iter()
        .map(|file| file.name.trim_end_matches(".dll").to_owned())
        .collect();
    let mut failed = false;

    for file in &job.source_files {
        let text = String::from_utf8_lossy(&file.data);
        let lines: Vec<&str> = text.lines().map(str::trim).collect();
        for line in &lines {
            if let Some(message) = line.strip_prefix("#error") {
                failed = true;
                writeln!(stdout, "[Error][CS1029][{}] #error: '{}'", file.name, message.trim())?;
            } else if let Some(message) = line.strip_prefix("#warning") {
                writeln!(stdout, "[Warning][CS1030][{}] #warning: '{}'", file.name, message.trim())?;
            }
        }
        module
            .types
            .extend(lines.iter().filter_map(|line| class_name(line)).map(|name| plugin_type(name, &lines)));
    }

    let data = if failed {
        Vec::new()
    } else {
        module.to_bytes()?
    };
    let result = CompileResult {
        name: job.output_file.clone(),
        data,
        symbols: Vec::new(),
    };
    WireMessage::result(id, &result, Some(stdout))
}

fn class_name(line: &str) -> Option<&str> {
    let (_, rest) = line.split_once("class ")?;
    let name = rest
        .split(|c: char| c.is_whitespace() || c == ':' || c == '{')
        .next()?;
    (!name.is_empty()).then_some(name)
}

/// Entry type with a constructor and one method per `void Name(` line.
///
/// A `private Name()` line makes the constructor private.
fn plugin_type(name: &str, lines: &[&str]) -> TypeDef {
    let mut ty = TypeDef::new(PLUGIN_NAMESPACE, name, flags::PUBLIC);
    let hidden = lines
        .iter()
        .any(|line| line.starts_with(&format!("private {name}(")));
    let visibility = if hidden { flags::PRIVATE } else { flags::PUBLIC };
    ty.methods.push(MethodDef::new(
        ".ctor",
        visibility | flags::CONSTRUCTOR | flags::SPECIAL_NAME,
    ));
    for line in lines {
        let Some(rest) = line.strip_prefix("void ") else {
            continue;
        };
        let Some((method, params)) = rest.split_once('(') else {
            continue;
        };
        let mut def = MethodDef::new(method.trim(), flags::PRIVATE);
        let params = params.split(')').next().unwrap_or_default().trim();
        if !params.is_empty() {
            def.params = params
                .split(',')
                .map(|param| param.split_whitespace().next().unwrap_or_default().to_owned())
                .collect();
        }
        ty.methods.push(def);
    }
    ty
}

#[derive(Debug)]
struct Args {
    parent: u32,
    channel: String,
    state_dir: Option<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut parent = None;
        let mut channel = None;
        let mut state_dir = None;

        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--parent" => {
                    parent = Some(
                        iter.next()
                            .ok_or_else(|| anyhow!("--parent requires value"))?
                            .parse()
                            .context("parse --parent")?,
                    )
                }
                "--channel" => {
                    channel = Some(
                        iter.next()
                            .ok_or_else(|| anyhow!("--channel requires value"))?,
                    )
                }
                "--state-dir" => {
                    state_dir = Some(PathBuf::from(
                        iter.next()
                            .ok_or_else(|| anyhow!("--state-dir requires value"))?,
                    ))
                }
                other => return Err(anyhow!("unknown argument: {other}")),
            }
        }

        Ok(Self {
            parent: parent.ok_or_else(|| anyhow!("--parent is required"))?,
            channel: channel.ok_or_else(|| anyhow!("--channel is required"))?,
            state_dir,
        })
    }
}

#[derive(Debug, Default)]
struct TestWorkerConfig {
    /// Attempts (1-based) that crash once `crash_after_jobs` jobs are held.
    crash_attempts: u32,
    crash_after_jobs: u32,
    ready_delay_ms: u64,
    job_delay_ms: u64,
    /// Never answer heartbeats or jobs.
    silent: bool,
    ignore_shutdown: bool,
    fail_jobs: bool,
}

impl TestWorkerConfig {
    fn load(state_dir: &Path) -> Self {
        let path = state_dir.join("kiln-test-worker.conf");
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return Self::default(),
        };

        let mut cfg = Self::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "crash_attempts" => {
                    cfg.crash_attempts = value.parse().unwrap_or(cfg.crash_attempts);
                }
                "crash_after_jobs" => {
                    cfg.crash_after_jobs = value.parse().unwrap_or(cfg.crash_after_jobs);
                }
                "ready_delay_ms" => {
                    cfg.ready_delay_ms = value.parse().unwrap_or(cfg.ready_delay_ms);
                }
                "job_delay_ms" => {
                    cfg.job_delay_ms = value.parse().unwrap_or(cfg.job_delay_ms);
                }
                "silent" => cfg.silent = value == "true",
                "ignore_shutdown" => cfg.ignore_shutdown = value == "true",
                "fail_jobs" => cfg.fail_jobs = value == "true",
                _ => {}
            }
        }

        cfg
    }
}

fn record_attempt(state_dir: &Path) -> Result<u32> {
    std::fs::create_dir_all(state_dir).context("create state dir")?;
    let counter_path = state_dir.join("attempts.count");
    let current = std::fs::read_to_string(&counter_path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(0);
    let next = current.saturating_add(1);
    std::fs::write(&counter_path, next.to_string()).context("write attempt counter")?;

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("read system time")?
        .as_millis();
    let log_path = state_dir.join("attempts.log");
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open attempt log {log_path:?}"))?;
    use std::io::Write as _;
    writeln!(file, "{now_ms}").context("append attempt log")?;

    Ok(next)
}
