use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kiln_build::{BuildContext, BuildCoordinator, BuildHost, CompiledModule, UnitReport};
use kiln_config::KilnConfig;
use kiln_module::{ModuleImage, TypeDef, Visibility};
use kiln_supervisor::{BuildSupervisor, ProcessLauncher, Unconfigured, WorkerLauncher};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "kiln", version, about = "kiln build pipeline (build, analyze, inspect)")]
struct Cli {
    /// Configuration file; defaults are used when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Root directory used when no configuration file is given
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile units through the build worker and report each outcome
    Build(BuildArgs),
    /// Run source analysis only and print requires/references
    Analyze(AnalyzeArgs),
    /// Print the types and members of a compiled module image
    Inspect(InspectArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Unit names (script file names without `.cs`)
    #[arg(required = true)]
    units: Vec<String>,
    /// Worker executable, overriding `[worker] executable`
    #[arg(long)]
    worker: Option<PathBuf>,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct AnalyzeArgs {
    #[arg(required = true)]
    units: Vec<String>,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct InspectArgs {
    /// Module image file
    module: PathBuf,
    /// Emit JSON suitable for CI
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(cli.config.as_deref(), &cli.root)?;
    kiln_config::init_tracing(&config.logging);

    match cli.command {
        Command::Build(args) => {
            if let Some(worker) = args.worker {
                config.worker.executable = Some(worker);
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            let report = runtime.block_on(build(config, &args.units))?;
            let exit = if report.failed > 0 { 1 } else { 0 };
            print_output(&report, args.json)?;
            Ok(exit)
        }
        Command::Analyze(args) => {
            let report = analyze(&config, &args.units)?;
            let exit = if report.units.iter().any(|unit| unit.error.is_some()) {
                1
            } else {
                0
            };
            print_output(&report, args.json)?;
            Ok(exit)
        }
        Command::Inspect(args) => {
            let report = inspect(&args.module)?;
            print_output(&report, args.json)?;
            Ok(0)
        }
    }
}

fn load_config(path: Option<&Path>, root: &Path) -> Result<KilnConfig> {
    match path {
        Some(path) => KilnConfig::load_from_path(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(KilnConfig::with_root(root)),
    }
}

#[derive(Debug, Serialize)]
struct BuildReport {
    units: Vec<UnitOutcome>,
    failed: usize,
}

#[derive(Debug, Serialize)]
struct UnitOutcome {
    unit: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl From<UnitReport> for UnitOutcome {
    fn from(report: UnitReport) -> Self {
        Self {
            ok: report.is_ok(),
            unit: report.unit,
            module: report.module,
            error: report.error,
        }
    }
}

/// Accepts every module; the CLI has no runtime to load into.
struct ReportingHost {
    reports: mpsc::UnboundedSender<UnitReport>,
}

impl BuildHost for ReportingHost {
    fn unit_changed(&self, report: UnitReport) {
        let _ = self.reports.send(report);
    }

    fn load_requested(&self, unit: &str, module: &Arc<CompiledModule>) -> bool {
        tracing::debug!(target: "kiln.cli", unit, module = %module.name, "accepting module");
        true
    }

    fn unload_requested(&self, _unit: &str) {}
}

async fn build(config: KilnConfig, units: &[String]) -> Result<BuildReport> {
    let launcher: Arc<dyn WorkerLauncher> = match ProcessLauncher::from_config(&config) {
        Some(launcher) => {
            tracing::info!(target: "kiln.cli", worker = %launcher, "using build worker");
            Arc::new(launcher)
        }
        None => Arc::new(Unconfigured),
    };
    let supervisor = Arc::new(BuildSupervisor::start(config.worker.clone(), launcher));
    let ctx = Arc::new(BuildContext::new(config).context("invalid compiler configuration")?);
    let (reports, mut rx) = mpsc::unbounded_channel();
    let coordinator = BuildCoordinator::start(ctx, supervisor, Arc::new(ReportingHost { reports }));

    for unit in units {
        coordinator.request_compile(unit.clone());
    }

    // Dependencies pulled into a session report too; keep them.
    let mut pending: BTreeSet<&str> = units.iter().map(String::as_str).collect();
    let mut outcomes = BTreeMap::new();
    while !pending.is_empty() {
        let Some(report) = rx.recv().await else {
            break;
        };
        pending.remove(report.unit.as_str());
        outcomes.insert(report.unit.clone(), UnitOutcome::from(report));
    }
    coordinator.shutdown().await;

    let units: Vec<UnitOutcome> = outcomes.into_values().collect();
    let failed = units.iter().filter(|unit| !unit.ok).count();
    Ok(BuildReport { units, failed })
}

#[derive(Debug, Serialize)]
struct AnalysisReport {
    units: Vec<UnitAnalysis>,
}

#[derive(Debug, Serialize)]
struct UnitAnalysis {
    unit: String,
    requires: Vec<String>,
    references: Vec<String>,
    includes: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn analyze(config: &KilnConfig, units: &[String]) -> Result<AnalysisReport> {
    let ctx = BuildContext::new(config.clone()).context("invalid compiler configuration")?;
    let compiler = &config.compiler;
    let mut report = AnalysisReport { units: Vec::new() };
    for name in units {
        let unit = ctx.unit(name);
        let cached = kiln_source::refresh_unit(&unit, &compiler.defines, compiler.lock_retry());
        let mut unit = unit.lock();
        let result = cached.and_then(|_| ctx.analyzer().analyze(&mut unit));
        report.units.push(UnitAnalysis {
            unit: unit.name.clone(),
            requires: unit.requires.iter().cloned().collect(),
            references: unit.references.iter().cloned().collect(),
            includes: unit.include_paths.iter().cloned().collect(),
            error: result.err().map(|err| err.to_string()),
        });
    }
    Ok(report)
}

#[derive(Debug, Serialize)]
struct ModuleReport {
    name: String,
    references: Vec<String>,
    types: Vec<TypeReport>,
}

#[derive(Debug, Serialize)]
struct TypeReport {
    name: String,
    visibility: &'static str,
    members: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    nested: Vec<TypeReport>,
}

impl From<&TypeDef> for TypeReport {
    fn from(ty: &TypeDef) -> Self {
        let mut members = Vec::new();
        for field in &ty.fields {
            members.push(format!(
                "{} field {} {}",
                visibility_name(Visibility::from_flags(field.flags)),
                field.field_type,
                field.name
            ));
        }
        for property in &ty.properties {
            members.push(format!("property {} {}", property.property_type, property.name));
        }
        for method in &ty.methods {
            members.push(format!(
                "{} method {} {}({})",
                visibility_name(method.visibility()),
                method.return_type,
                method.name,
                method.params.join(", ")
            ));
        }
        for event in &ty.events {
            members.push(format!("event {} {}", event.event_type, event.name));
        }
        Self {
            name: ty.full_name(),
            visibility: visibility_name(ty.visibility()),
            members,
            nested: ty.nested.iter().map(TypeReport::from).collect(),
        }
    }
}

fn visibility_name(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Public => "public",
        Visibility::Private => "private",
        Visibility::Protected => "protected",
        Visibility::Internal => "internal",
    }
}

fn inspect(path: &Path) -> Result<ModuleReport> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let image = ModuleImage::parse(&bytes)
        .with_context(|| format!("{} is not a module image", path.display()))?;
    Ok(ModuleReport {
        name: image.name.clone(),
        references: image.references.clone(),
        types: image.types.iter().map(TypeReport::from).collect(),
    })
}

fn print_output<T: Serialize + 'static>(value: &T, json: bool) -> Result<()> {
    if json {
        let out = serde_json::to_string_pretty(value)?;
        println!("{out}");
        return Ok(());
    }

    let any = value as &dyn std::any::Any;
    if let Some(report) = any.downcast_ref::<BuildReport>() {
        for unit in &report.units {
            match (&unit.module, &unit.error) {
                (_, Some(error)) => println!("{}: error: {error}", unit.unit),
                (Some(module), None) => println!("{}: ok ({module})", unit.unit),
                (None, None) => println!("{}: ok", unit.unit),
            }
        }
        println!(
            "summary: {} compiled, {} failed",
            report.units.len() - report.failed,
            report.failed
        );
    } else if let Some(report) = any.downcast_ref::<AnalysisReport>() {
        for unit in &report.units {
            println!("{}:", unit.unit);
            println!("  requires: {}", unit.requires.join(", "));
            println!("  references: {}", unit.references.join(", "));
            for include in &unit.includes {
                println!("  include: {}", include.display());
            }
            if let Some(error) = &unit.error {
                println!("  error: {error}");
            }
        }
    } else if let Some(report) = any.downcast_ref::<ModuleReport>() {
        println!("module: {}", report.name);
        if !report.references.is_empty() {
            println!("  references: {}", report.references.join(", "));
        }
        for ty in &report.types {
            print_type(ty, 1);
        }
    } else {
        let out = serde_json::to_string_pretty(value)?;
        println!("{out}");
    }
    Ok(())
}

fn print_type(ty: &TypeReport, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{indent}{} type {}", ty.visibility, ty.name);
    for member in &ty.members {
        println!("{indent}  {member}");
    }
    for nested in &ty.nested {
        print_type(nested, depth + 1);
    }
}
