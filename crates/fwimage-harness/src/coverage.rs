//! Coverage gate.
//!
//! Re-runs the program's self-tests under an external line-coverage tool,
//! parses the tool's text report and fails unless coverage is exactly 100%
//! and every required entry-type plugin appears in the report.
//!
//! Tool protocol:
//! - `<tool> run --omit "<globs>" <program> -t` with the module search path
//!   extended by `<build_dir>/<sandbox_subdir>`;
//! - `<tool> report`, whose stdout is the tabular report. Its last non-empty
//!   line ends with the total percentage; one row per measured file starts
//!   with the file path.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::{DEFAULT_COVERAGE_TIMEOUT, DEFAULT_COVERAGE_TOOL, Verbosity, split_command};
use crate::discovery::DEFAULT_PLUGIN_EXTENSION;
use crate::process::{ProcessError, run_with_timeout};
use crate::structured_log::{ArtifactIndex, LogEmitter, LogLevel, Outcome};

pub const GATE: &str = "coverage_gate";

/// Report rows for plugin sources contain this path fragment.
pub const DEFAULT_MODULE_MARKER: &str = "/etype/";
pub const DEFAULT_SEARCH_PATH_VAR: &str = "PYTHONPATH";
/// Build-tree directory holding the generated device-tree binding module.
pub const DEFAULT_SANDBOX_SUBDIR: &str = "sandbox_spl/tools";
/// Sibling support libraries that are tested on their own.
pub const DEFAULT_SUPPORT_GLOBS: &[&str] = &["tools/patman/*", "tools/dtoc/*"];
pub const HTML_HINT: &str = "Type 'python3 -m coverage html' to get a report in htmlcov/index.html";

pub const REPORT_FILE: &str = "coverage_report.txt";
pub const SUMMARY_FILE: &str = "coverage_summary.json";
pub const INDEX_FILE: &str = "artifact_index.json";

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("missing tests for {}", join_names(missing))]
    MissingModules { missing: BTreeSet<String> },
    #[error("coverage is {percentage}, but should be 100%")]
    Shortfall { percentage: String },
    #[error("malformed coverage report: {0}")]
    MalformedReport(String),
    #[error("coverage tool '{command}' failed: {reason}")]
    Tool { command: String, reason: String },
    #[error("coverage run failed: {0}")]
    Process(#[from] ProcessError),
    #[error("failed to write coverage artifacts to {}: {source}", dir.display())]
    Artifacts {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoverageError {
    /// True for gate verdicts, false for problems running the tool itself.
    #[must_use]
    pub fn is_gate_failure(&self) -> bool {
        matches!(self, Self::MissingModules { .. } | Self::Shortfall { .. })
    }
}

fn join_names(names: &BTreeSet<String>) -> String {
    names.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// Coverage tool settings.
#[derive(Debug, Clone)]
pub struct CoverageConfig {
    /// Tool command line, e.g. `python3 -m coverage`.
    pub tool: Vec<String>,
    pub module_marker: String,
    pub search_path_var: String,
    pub sandbox_subdir: PathBuf,
    /// Sibling support-library directories that do not count.
    pub support_globs: Vec<String>,
    /// Installed packages and generated bindings that do not count.
    pub external_globs: Vec<String>,
    /// Omit plugin-extension files next to the program whose path contains this.
    pub omit_matching: Option<String>,
    pub plugin_extension: String,
    pub timeout: Duration,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            tool: split_command(DEFAULT_COVERAGE_TOOL),
            module_marker: DEFAULT_MODULE_MARKER.to_string(),
            search_path_var: DEFAULT_SEARCH_PATH_VAR.to_string(),
            sandbox_subdir: PathBuf::from(DEFAULT_SANDBOX_SUBDIR),
            support_globs: DEFAULT_SUPPORT_GLOBS.iter().map(|glob| glob.to_string()).collect(),
            external_globs: vec!["*libfdt.py".to_string(), "*site-packages*".to_string()],
            omit_matching: None,
            plugin_extension: DEFAULT_PLUGIN_EXTENSION.to_string(),
            timeout: DEFAULT_COVERAGE_TIMEOUT,
        }
    }
}

/// Globs excluded from measurement for `program`.
#[must_use]
pub fn build_omit_list(program: &Path, config: &CoverageConfig) -> Vec<String> {
    let mut globs = Vec::new();

    if let Some(filter) = config.omit_matching.as_deref() {
        let dir = program.parent().unwrap_or(Path::new("."));
        if let Ok(entries) = std::fs::read_dir(dir) {
            let mut matched: Vec<String> = entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| {
                    path.extension().and_then(|ext| ext.to_str())
                        == Some(config.plugin_extension.as_str())
                })
                .map(|path| path.to_string_lossy().into_owned())
                .filter(|path| path.contains(filter))
                .collect();
            matched.sort();
            globs.extend(matched);
        }
    }

    globs.push("*test*".to_string());
    if let Some(name) = program.file_name() {
        globs.push(format!("*{}", name.to_string_lossy()));
    }
    globs.extend(config.support_globs.iter().cloned());
    globs.extend(config.external_globs.iter().cloned());
    globs
}

/// `existing` search path with `extra` appended.
pub fn extend_search_path(existing: Option<OsString>, extra: &Path) -> Result<OsString, CoverageError> {
    let mut paths: Vec<PathBuf> = existing
        .as_deref()
        .map(|value| std::env::split_paths(value).collect())
        .unwrap_or_default();
    paths.push(extra.to_path_buf());
    std::env::join_paths(paths).map_err(|err| CoverageError::Tool {
        command: "join search path".to_string(),
        reason: err.to_string(),
    })
}

/// One measured run of the program's self-tests.
#[derive(Debug, Clone)]
pub struct CoverageRun {
    pub program: PathBuf,
    pub omit: Vec<String>,
    pub search_path_var: String,
    pub search_path: OsString,
    /// Extra flags for the program after `-t` (e.g. `-D`).
    pub program_args: Vec<String>,
}

impl CoverageRun {
    #[must_use]
    pub fn omit_arg(&self) -> String {
        self.omit.join(",")
    }

    /// The run command as a shell would show it.
    #[must_use]
    pub fn display(&self, tool: &[String]) -> String {
        let mut line = format!(
            "{}={} {} run --omit \"{}\" {} -t",
            self.search_path_var,
            self.search_path.to_string_lossy(),
            tool.join(" "),
            self.omit_arg(),
            self.program.display()
        );
        for arg in &self.program_args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Drives the coverage tool.
pub trait CoverageBackend {
    /// Run the program's self-tests under measurement.
    fn measure(&mut self, run: &CoverageRun) -> Result<(), CoverageError>;
    /// Produce the text report for the last measurement.
    fn report(&mut self) -> Result<String, CoverageError>;
}

/// Runs the configured tool as subprocesses.
#[derive(Debug, Clone)]
pub struct ToolBackend {
    tool: Vec<String>,
    timeout: Duration,
}

impl ToolBackend {
    #[must_use]
    pub fn new(config: &CoverageConfig) -> Self {
        Self {
            tool: config.tool.clone(),
            timeout: config.timeout,
        }
    }

    fn command(&self) -> Result<Command, CoverageError> {
        let (program, args) = self.tool.split_first().ok_or_else(|| CoverageError::Tool {
            command: String::new(),
            reason: "no coverage tool configured".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl CoverageBackend for ToolBackend {
    fn measure(&mut self, run: &CoverageRun) -> Result<(), CoverageError> {
        let mut cmd = self.command()?;
        cmd.arg("run")
            .arg("--omit")
            .arg(run.omit_arg())
            .arg(&run.program)
            .arg("-t")
            .args(&run.program_args)
            .env(&run.search_path_var, &run.search_path);

        let output = run_with_timeout(&mut cmd, self.timeout)?;
        crate::console::write_out(format_args!("{}", output.stdout));
        crate::console::write_err(format_args!("{}", output.stderr));
        if !output.success() {
            // The report still decides the verdict; a failing test run
            // normally shows up there as missing coverage.
            crate::errln!(
                "warning: measured test run ended with {}",
                output.describe_status()
            );
        }
        Ok(())
    }

    fn report(&mut self) -> Result<String, CoverageError> {
        let mut cmd = self.command()?;
        cmd.arg("report");
        let output = run_with_timeout(&mut cmd, self.timeout)?;
        if !output.success() {
            return Err(CoverageError::Tool {
                command: format!("{} report", self.tool.join(" ")),
                reason: format!("{}: {}", output.describe_status(), output.stderr.trim()),
            });
        }
        Ok(output.stdout)
    }
}

/// Parsed coverage report.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageReport {
    /// Total as printed, e.g. `97%`.
    pub percentage: String,
    pub percent: f64,
    /// Report rows for plugin sources.
    pub module_lines: Vec<String>,
    pub covered_modules: BTreeSet<String>,
    pub body: String,
}

impl CoverageReport {
    /// Parse the tool's text report.
    ///
    /// The last whitespace-separated token of the last non-empty line is the
    /// total; rows containing `module_marker` name covered plugins by the
    /// file stem of their first token.
    pub fn parse(body: &str, module_marker: &str) -> Result<Self, CoverageError> {
        let last = body
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| CoverageError::MalformedReport("empty report".to_string()))?;
        let percentage = last
            .split_whitespace()
            .next_back()
            .filter(|token| token.ends_with('%'))
            .ok_or_else(|| {
                CoverageError::MalformedReport(format!("no percentage in final line '{last}'"))
            })?
            .to_string();
        let percent = percentage
            .trim_end_matches('%')
            .parse::<f64>()
            .map_err(|_| CoverageError::MalformedReport(format!("bad percentage '{percentage}'")))?;

        let module_lines: Vec<String> = body
            .lines()
            .filter(|line| line.contains(module_marker))
            .map(str::to_string)
            .collect();
        let covered_modules = module_lines
            .iter()
            .filter_map(|line| line.split_whitespace().next())
            .filter_map(|path| Path::new(path).file_stem())
            .map(|stem| stem.to_string_lossy().into_owned())
            .collect();

        Ok(Self {
            percentage,
            percent,
            module_lines,
            covered_modules,
            body: body.to_string(),
        })
    }

    #[must_use]
    pub fn missing(&self, required: &BTreeSet<String>) -> BTreeSet<String> {
        required.difference(&self.covered_modules).cloned().collect()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.percent == 100.0
    }
}

/// Machine-readable gate verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageSummary {
    pub percentage: String,
    pub passed: bool,
    pub required_modules: usize,
    pub covered_modules: Vec<String>,
    pub missing_modules: Vec<String>,
}

impl CoverageSummary {
    #[must_use]
    pub fn evaluate(report: &CoverageReport, required: &BTreeSet<String>) -> Self {
        let missing = report.missing(required);
        Self {
            percentage: report.percentage.clone(),
            passed: missing.is_empty() && report.is_complete(),
            required_modules: required.len(),
            covered_modules: report.covered_modules.iter().cloned().collect(),
            missing_modules: missing.into_iter().collect(),
        }
    }
}

/// Everything one gate invocation needs.
#[derive(Debug, Clone)]
pub struct CoverageRequest<'a> {
    pub program: &'a Path,
    pub required: &'a BTreeSet<String>,
    pub build_dir: &'a Path,
    pub verbosity: Verbosity,
    pub artifacts_dir: Option<&'a Path>,
    /// Run id recorded in the artifact index.
    pub run_id: &'a str,
}

/// Run the gate.
///
/// On success only the percentage is printed. On a missing module the
/// offenders and the full report are printed; on a shortfall the full report
/// and a hint for the HTML report.
pub fn run(
    backend: &mut dyn CoverageBackend,
    request: &CoverageRequest<'_>,
    config: &CoverageConfig,
    log: &mut LogEmitter,
) -> Result<CoverageSummary, CoverageError> {
    let search_path = extend_search_path(
        std::env::var_os(&config.search_path_var),
        &request.build_dir.join(&config.sandbox_subdir),
    )?;
    let coverage_run = CoverageRun {
        program: request.program.to_path_buf(),
        omit: build_omit_list(request.program, config),
        search_path_var: config.search_path_var.clone(),
        search_path,
        program_args: if request.verbosity.is_debug() {
            vec!["-D".to_string()]
        } else {
            Vec::new()
        },
    };

    let entry = log
        .entry(LogLevel::Info, "coverage_run")
        .with_gate(GATE)
        .with_details(serde_json::json!({ "command": coverage_run.display(&config.tool) }));
    log.record(entry);

    if let Err(err) = backend.measure(&coverage_run) {
        if matches!(err, CoverageError::Process(ProcessError::Timeout { .. })) {
            let entry = log
                .entry(LogLevel::Error, "coverage_result")
                .with_gate(GATE)
                .with_outcome(Outcome::Timeout)
                .with_details(serde_json::json!({ "error": err.to_string() }));
            log.record(entry);
        }
        return Err(err);
    }
    let body = backend.report()?;
    let report = CoverageReport::parse(&body, &config.module_marker)?;
    let summary = CoverageSummary::evaluate(&report, request.required);

    let artifact_refs = match request.artifacts_dir {
        Some(dir) => write_artifacts(dir, request.run_id, &report, &summary)?,
        None => Vec::new(),
    };
    let entry = log
        .entry(
            if summary.passed { LogLevel::Info } else { LogLevel::Error },
            "coverage_result",
        )
        .with_gate(GATE)
        .with_outcome(if summary.passed { Outcome::Pass } else { Outcome::Fail })
        .with_artifacts(artifact_refs)
        .with_details(serde_json::to_value(&summary).unwrap_or_default());
    log.record(entry);

    enforce(&report, &summary)?;
    Ok(summary)
}

/// Print the verdict and turn a failing summary into an error.
pub fn enforce(report: &CoverageReport, summary: &CoverageSummary) -> Result<(), CoverageError> {
    if !summary.missing_modules.is_empty() {
        crate::outln!("Missing tests for {}", summary.missing_modules.join(", "));
        crate::outln!("{}", report.body.trim_end());
        return Err(CoverageError::MissingModules {
            missing: summary.missing_modules.iter().cloned().collect(),
        });
    }
    if !report.is_complete() {
        crate::outln!("{}", report.body.trim_end());
        crate::outln!("{HTML_HINT}");
        crate::outln!("Coverage error: {}, but should be 100%", report.percentage);
        return Err(CoverageError::Shortfall {
            percentage: report.percentage.clone(),
        });
    }
    crate::outln!("{}", report.percentage);
    Ok(())
}

/// Write the report, the summary and an artifact index into `dir`.
pub fn write_artifacts(
    dir: &Path,
    run_id: &str,
    report: &CoverageReport,
    summary: &CoverageSummary,
) -> Result<Vec<String>, CoverageError> {
    let io_err = |source| CoverageError::Artifacts {
        dir: dir.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let summary_json = serde_json::to_string_pretty(summary).map_err(|e| io_err(e.into()))?;
    let mut index = ArtifactIndex::new(run_id);
    index
        .add_bytes(REPORT_FILE, "coverage_report", report.body.as_bytes())
        .add_bytes(SUMMARY_FILE, "coverage_summary", summary_json.as_bytes());

    std::fs::write(dir.join(REPORT_FILE), &report.body).map_err(io_err)?;
    std::fs::write(dir.join(SUMMARY_FILE), &summary_json).map_err(io_err)?;
    let index_json = index.to_json().map_err(|e| io_err(e.into()))?;
    std::fs::write(dir.join(INDEX_FILE), index_json).map_err(io_err)?;

    Ok([REPORT_FILE, SUMMARY_FILE, INDEX_FILE]
        .iter()
        .map(|name| dir.join(name).to_string_lossy().into_owned())
        .collect())
}
