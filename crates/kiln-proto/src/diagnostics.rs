use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Other(String),
}

impl Severity {
    fn parse(value: &str) -> Self {
        match value {
            "Error" => Severity::Error,
            "Warning" => Severity::Warning,
            other => Severity::Other(other.to_owned()),
        }
    }
}

/// One `[Severity][Code][File] Message` line from the worker's compiler output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub file: String,
    pub message: String,
}

impl Diagnostic {
    /// File name without directory or extension, i.e. the unit name.
    pub fn script_name(&self) -> &str {
        Path::new(&self.file)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.file)
    }

    /// Human-readable advice for compiler errors that have a known cause.
    pub fn hint(&self) -> Option<String> {
        match self.code.as_str() {
            "CS0012" => missing_reference_hint(&self.message),
            _ => None,
        }
    }
}

/// CS0012: a type from an assembly the script never referenced.
fn missing_reference_hint(message: &str) -> Option<String> {
    static RE: OnceLock<[Regex; 3]> = OnceLock::new();
    let [ty, assembly, file] = RE.get_or_init(|| {
        [
            r"^The type '(?P<value>\S+)'",
            r"reference to assembly '(?P<value>\S+),",
            r"SourceFile\((?P<value>\S+\.cs)\[",
        ]
        .map(|pattern| Regex::new(pattern).expect("CS0012 hint regex should compile"))
    });
    let ty = &ty.captures(message)?["value"];
    let assembly = &assembly.captures(message)?["value"];
    let file = &file.captures(message)?["value"];
    Some(format!(
        "Plugin {file} is using Type '{ty}' from {assembly}, but is missing a // Reference: {assembly}"
    ))
}

fn diagnostic_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(?P<severity>\S+)\]\[(?P<code>\S+)\]\[(?P<file>\S+)\] (?P<message>.+)$")
            .expect("diagnostic line regex should compile")
    })
}

/// Extract diagnostics from compiler stdout. Lines that don't follow the
/// diagnostic grammar are skipped.
pub fn parse_diagnostics(output: &str) -> Vec<Diagnostic> {
    output
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let caps = diagnostic_line_re().captures(line)?;
            Some(Diagnostic {
                severity: Severity::parse(&caps["severity"]),
                code: caps["code"].to_owned(),
                file: caps["file"].to_owned(),
                message: caps["message"].to_owned(),
            })
        })
        .collect()
}
