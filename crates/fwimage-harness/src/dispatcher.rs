//! Runs the test groups and reports the merged result.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::config::{TEST_DEBUG_ENV, Verbosity};
use crate::console;
use crate::process::{CommandSpec, ProcessError, run_with_timeout};
use crate::structured_log::{LogEmitter, LogLevel, Outcome};
use crate::suite::{GroupKind, TestBody, TestCase, TestFailure, TestGroup, TestSuiteResult};

pub const GATE: &str = "test_dispatch";

/// A module whose embedded documentation examples run before the groups.
#[derive(Debug, Clone, Copy)]
pub struct DocTestModule {
    pub name: &'static str,
    pub argv: &'static [&'static str],
}

/// Documentation-example suites run ahead of the groups. Currently empty;
/// listed modules have their examples run and merged into the result.
pub const DOC_TEST_MODULES: &[DocTestModule] = &[];

/// Dispatcher settings that stay fixed for a run.
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    pub verbosity: Verbosity,
    /// Limit for command cases that do not set their own.
    pub default_timeout: Duration,
}

enum CaseOutcome {
    Pass,
    Fail(String),
    Error(String),
    Timeout(String),
}

/// Run every group, or only the case matching `filter`.
///
/// With a filter, each group is asked for the name and groups that do not
/// have it are skipped; the name is expected to live in exactly one group.
pub fn run(
    groups: &[TestGroup],
    filter: Option<&str>,
    options: DispatchOptions,
    log: &mut LogEmitter,
) -> TestSuiteResult {
    let mut result = TestSuiteResult::new();
    run_doc_tests(DOC_TEST_MODULES, &mut result, options, log);

    for group in groups {
        match filter {
            Some(name) => match group.lookup(name) {
                Some(case) => run_case(group, case, options, &mut result, log),
                None => continue,
            },
            None => {
                for case in group.cases() {
                    run_case(group, case, options, &mut result, log);
                }
            }
        }
    }
    result
}

/// Run the documentation-example suites of `modules` into `result`.
pub fn run_doc_tests(
    modules: &[DocTestModule],
    result: &mut TestSuiteResult,
    options: DispatchOptions,
    log: &mut LogEmitter,
) {
    for module in modules {
        let id = format!("doctest.{}", module.name);
        let spec = CommandSpec::new(module.argv.iter().copied());
        let started = Instant::now();
        let outcome = run_command_case(&spec, options);
        record(&id, "doctest", outcome, started.elapsed(), result, log);
    }
}

fn run_case(
    group: &TestGroup,
    case: &TestCase,
    options: DispatchOptions,
    result: &mut TestSuiteResult,
    log: &mut LogEmitter,
) {
    let id = group.test_id(case);
    let started = Instant::now();
    let outcome = match case.body() {
        TestBody::InProcess(body) => run_in_process(body, options.verbosity),
        TestBody::Command(spec) => run_command_case(spec, options),
    };
    record(&id, group.kind().as_str(), outcome, started.elapsed(), result, log);
}

fn record(
    id: &str,
    group: &str,
    outcome: CaseOutcome,
    elapsed: Duration,
    result: &mut TestSuiteResult,
    log: &mut LogEmitter,
) {
    let (level, logged) = match &outcome {
        CaseOutcome::Pass => (LogLevel::Info, Outcome::Pass),
        CaseOutcome::Fail(_) => (LogLevel::Warn, Outcome::Fail),
        CaseOutcome::Error(_) => (LogLevel::Error, Outcome::Error),
        CaseOutcome::Timeout(_) => (LogLevel::Error, Outcome::Timeout),
    };
    let entry = log
        .entry(level, "test_result")
        .with_gate(GATE)
        .with_test(group, id)
        .with_outcome(logged)
        .with_duration_ms(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
    log.record(entry);

    match outcome {
        CaseOutcome::Pass => result.add_success(),
        CaseOutcome::Fail(detail) => result.add_failure(id, detail),
        CaseOutcome::Error(detail) | CaseOutcome::Timeout(detail) => result.add_error(id, detail),
    }
}

fn run_in_process(
    body: &(dyn Fn() -> Result<(), TestFailure>),
    verbosity: Verbosity,
) -> CaseOutcome {
    console::route_panics_through_console();
    let guard = console::capture_output();
    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    let captured = guard.finish();

    let with_output = |message: String| {
        if verbosity.is_debug() && !captured.is_empty() {
            format!(
                "{message}\n--- captured stdout ---\n{}--- captured stderr ---\n{}",
                captured.stdout, captured.stderr
            )
        } else {
            message
        }
    };

    match outcome {
        Ok(Ok(())) => CaseOutcome::Pass,
        Ok(Err(TestFailure::Failed(message))) => CaseOutcome::Fail(with_output(message)),
        Ok(Err(TestFailure::Errored(message))) => CaseOutcome::Error(with_output(message)),
        Err(payload) => CaseOutcome::Error(with_output(format!(
            "panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn run_command_case(spec: &CommandSpec, options: DispatchOptions) -> CaseOutcome {
    let mut cmd = match spec.to_command() {
        Ok(cmd) => cmd,
        Err(err) => return CaseOutcome::Error(err.to_string()),
    };
    if options.verbosity.is_debug() {
        cmd.env(TEST_DEBUG_ENV, "1");
    }

    match run_with_timeout(&mut cmd, spec.timeout_or(options.default_timeout)) {
        Ok(output) => {
            let detail = || {
                let text = if output.stderr.trim().is_empty() {
                    output.stdout.trim()
                } else {
                    output.stderr.trim()
                };
                if text.is_empty() {
                    output.describe_status()
                } else {
                    format!("{}\n{text}", output.describe_status())
                }
            };
            match output.status.code() {
                Some(0) => CaseOutcome::Pass,
                Some(1) => CaseOutcome::Fail(detail()),
                _ => CaseOutcome::Error(detail()),
            }
        }
        Err(err @ ProcessError::Timeout { .. }) => CaseOutcome::Timeout(err.to_string()),
        Err(err) => CaseOutcome::Error(err.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Print the counts and then every error and failure with its detail.
pub fn print_summary(result: &TestSuiteResult) {
    crate::outln!("{result}");
    for (id, detail) in &result.errors {
        crate::outln!("{id} {detail}");
    }
    for (id, detail) in &result.failures {
        crate::outln!("{id} {detail}");
    }
}

/// Print the summary and return the process exit code (0 or 1).
#[must_use]
pub fn finish(result: &TestSuiteResult) -> u8 {
    print_summary(result);
    if result.was_successful() {
        0
    } else {
        crate::outln!("fwimage tests FAILED");
        1
    }
}

/// Groups that contain `name`, in run order.
#[must_use]
pub fn groups_containing(groups: &[TestGroup], name: &str) -> Vec<GroupKind> {
    groups
        .iter()
        .filter(|group| group.lookup(name).is_some())
        .map(TestGroup::kind)
        .collect()
}
