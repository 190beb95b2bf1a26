//! Integration tests: coverage gate (measure, report, enforce).
//!
//! Validates:
//! 1. A 100% report covering every plugin passes and prints only the percentage.
//! 2. An 87% report fails with the full report and the shortfall message.
//! 3. A plugin absent from the report is named even at 100%.
//! 4. Artifacts are written with SHA-256 digests and the log validates.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fwimage_harness::config::Verbosity;
use fwimage_harness::console::{CaptureBuffer, with_captured_output};
use fwimage_harness::coverage::{
    self, CoverageBackend, CoverageConfig, CoverageError, CoverageRequest, CoverageRun,
    INDEX_FILE, REPORT_FILE, SUMMARY_FILE,
};
use fwimage_harness::structured_log::{LogEmitter, sha256_hex, validate_log_line};

fn unique_tmp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after UNIX_EPOCH")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Replays a canned report and remembers the measured run.
struct CannedBackend {
    report: String,
    runs: Vec<CoverageRun>,
}

impl CannedBackend {
    fn new(modules: &[&str], total: &str) -> Self {
        let mut report = String::from("Name    Stmts   Miss  Cover\n-----------------------------\n");
        for module in modules {
            report.push_str(&format!("tools/fwimage/etype/{module}.py    10    0   100%\n"));
        }
        report.push_str("tools/fwimage/control.py    40    5    87%\n");
        report.push_str("-----------------------------\n");
        report.push_str(&format!("TOTAL    400    5    {total}\n"));
        Self {
            report,
            runs: Vec::new(),
        }
    }
}

impl CoverageBackend for CannedBackend {
    fn measure(&mut self, run: &CoverageRun) -> Result<(), CoverageError> {
        self.runs.push(run.clone());
        Ok(())
    }

    fn report(&mut self) -> Result<String, CoverageError> {
        Ok(self.report.clone())
    }
}

fn required(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn run_gate(
    run_id: &str,
    backend: &mut CannedBackend,
    required: &BTreeSet<String>,
    verbosity: Verbosity,
    artifacts_dir: Option<&Path>,
    log: &mut LogEmitter,
) -> Result<coverage::CoverageSummary, CoverageError> {
    let program = PathBuf::from("tools/fwimage/main.py");
    let request = CoverageRequest {
        program: &program,
        required,
        build_dir: Path::new("b"),
        verbosity,
        artifacts_dir,
        run_id,
    };
    coverage::run(backend, &request, &CoverageConfig::default(), log)
}

#[test]
fn full_coverage_prints_only_percentage() {
    let mut backend = CannedBackend::new(&["blob", "fill"], "100%");
    let (result, captured) = with_captured_output(|| {
        run_gate(
            "run-gate",
            &mut backend,
            &required(&["blob", "fill"]),
            Verbosity::Terse,
            None,
            &mut LogEmitter::disabled(),
        )
    });
    let summary = result.expect("gate passes");
    assert!(summary.passed);
    assert_eq!(captured.stdout, "100%\n");

    let run = &backend.runs[0];
    assert!(run.omit.contains(&"*test*".to_string()));
    assert!(run.omit.contains(&"*main.py".to_string()));
    assert!(run.program_args.is_empty());
    assert!(
        std::env::split_paths(&run.search_path).any(|p| p == Path::new("b/sandbox_spl/tools"))
    );
}

#[test]
fn shortfall_prints_report_and_fails() {
    let mut backend = CannedBackend::new(&["blob"], "87%");
    let (result, captured) = with_captured_output(|| {
        run_gate(
            "run-gate",
            &mut backend,
            &required(&["blob"]),
            Verbosity::Terse,
            None,
            &mut LogEmitter::disabled(),
        )
    });
    let err = result.expect_err("87% must fail");
    assert!(matches!(err, CoverageError::Shortfall { ref percentage } if percentage == "87%"));
    assert!(captured.stdout.contains("tools/fwimage/control.py"));
    assert!(captured.stdout.contains("TOTAL"));
    assert!(
        captured
            .stdout
            .trim_end()
            .ends_with("Coverage error: 87%, but should be 100%")
    );
}

#[test]
fn missing_plugin_is_named() {
    let mut backend = CannedBackend::new(&["blob"], "100%");
    let (result, captured) = with_captured_output(|| {
        run_gate(
            "run-gate",
            &mut backend,
            &required(&["blob", "cbfs"]),
            Verbosity::Terse,
            None,
            &mut LogEmitter::disabled(),
        )
    });
    let err = result.expect_err("missing module must fail");
    assert!(matches!(err, CoverageError::MissingModules { .. }));
    assert!(captured.stdout.starts_with("Missing tests for cbfs\n"));
    assert!(!captured.stdout.contains("Coverage error"));
}

#[test]
fn debug_verbosity_reaches_measured_run() {
    let mut backend = CannedBackend::new(&["blob"], "100%");
    let ((), _) = with_captured_output(|| {
        run_gate(
            "run-gate",
            &mut backend,
            &required(&["blob"]),
            Verbosity::Debug,
            None,
            &mut LogEmitter::disabled(),
        )
        .expect("gate passes");
    });
    assert_eq!(backend.runs[0].program_args, ["-D"]);
}

#[test]
fn artifacts_and_log_are_consistent() {
    let dir = unique_tmp_dir("fwimage-coverage-artifacts");
    let buffer = CaptureBuffer::new();
    let mut log = LogEmitter::to_buffer(&buffer, coverage::GATE, "run-artifacts");
    let mut backend = CannedBackend::new(&["blob"], "87%");
    let (result, _) = with_captured_output(|| {
        run_gate(
            "run-gate",
            &mut backend,
            &required(&["blob"]),
            Verbosity::Terse,
            Some(&dir),
            &mut log,
        )
    });
    assert!(result.is_err());

    let report = std::fs::read(dir.join(REPORT_FILE)).expect("report written");
    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.join(SUMMARY_FILE)).expect("summary written"),
    )
    .expect("summary is JSON");
    assert_eq!(summary["percentage"], "87%");
    assert_eq!(summary["passed"], false);

    let index: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.join(INDEX_FILE)).expect("index written"),
    )
    .expect("index is JSON");
    let artifacts = index["artifacts"].as_array().expect("artifacts array");
    let report_entry = artifacts
        .iter()
        .find(|entry| entry["path"] == REPORT_FILE)
        .expect("report indexed");
    assert_eq!(report_entry["sha256"], sha256_hex(&report));
    assert_eq!(index["run_id"], "run-gate");

    let lines = buffer.contents();
    let events: Vec<String> = lines
        .lines()
        .enumerate()
        .map(|(n, line)| {
            validate_log_line(line, n + 1)
                .unwrap_or_else(|errs| panic!("invalid log line {line}: {errs:?}"))
                .event
        })
        .collect();
    assert_eq!(events, ["coverage_run", "coverage_result"]);
    let _ = std::fs::remove_dir_all(dir);
}
