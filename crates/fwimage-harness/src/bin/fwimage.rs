//! CLI entrypoint for the fwimage test harness.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use fwimage_harness::config::{DEFAULT_BUILD_DIR, DEFAULT_ETYPE_DIR, DEFAULT_MANIFEST};
use fwimage_harness::{ExecutionOptions, ExternalEngine, HarnessSettings, Verbosity, app};

/// Firmware image builder front end.
#[derive(Debug, Parser)]
#[command(name = "fwimage")]
#[command(about = "Build firmware images, run the fwimage test suites, or enforce coverage")]
struct Cli {
    /// Run the test suites; the first argument, if any, names a single test.
    #[arg(short = 't', long = "test")]
    test: bool,
    /// Run the suites under the coverage tool and require 100% coverage.
    #[arg(short = 'T', long = "test-coverage")]
    test_coverage: bool,
    /// Write documentation for every entry type.
    #[arg(short = 'E', long = "entry-docs")]
    entry_docs: bool,
    /// Show error causes and per-test output.
    #[arg(short = 'D', long = "debug")]
    debug: bool,
    /// Build directory holding the sandbox tools.
    #[arg(short = 'B', long = "build-dir", default_value = DEFAULT_BUILD_DIR)]
    build_dir: PathBuf,
    /// Directory holding the entry-type plugins.
    #[arg(long, default_value = DEFAULT_ETYPE_DIR)]
    etype_dir: PathBuf,
    /// Test-group manifest.
    #[arg(long, default_value = DEFAULT_MANIFEST)]
    manifest: PathBuf,
    /// Entry script re-run under the coverage tool; required with -T.
    #[arg(long, required_if_eq("test_coverage", "true"))]
    program: Option<PathBuf>,
    /// Extra glob excluded from coverage (repeatable).
    #[arg(long = "omit")]
    omit: Vec<String>,
    /// Exclude source files beside the program whose path contains this text.
    #[arg(long)]
    omit_matching: Option<String>,
    /// Structured JSONL log path.
    #[arg(long)]
    log: Option<PathBuf>,
    /// Directory for the coverage report and artifact index.
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,
    /// Test name in test mode; otherwise forwarded to the engine.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl Cli {
    fn into_options(self) -> ExecutionOptions {
        let test_name_filter = if self.test {
            self.args.first().cloned()
        } else {
            None
        };
        ExecutionOptions {
            run_tests: self.test,
            run_coverage: self.test_coverage,
            entry_docs: self.entry_docs,
            verbosity: Verbosity::from_debug_flag(self.debug),
            test_name_filter,
            build_dir: self.build_dir,
            etype_dir: self.etype_dir,
            manifest: self.manifest,
            program: self.program,
            extra_omit: self.omit,
            omit_matching: self.omit_matching,
            log_path: self.log,
            artifacts_dir: self.artifacts_dir,
            engine_args: self.args,
        }
    }
}

fn main() -> ExitCode {
    let options = Cli::parse().into_options();
    let settings = HarnessSettings::from_env();
    let engine = ExternalEngine::new(settings.engine.clone());
    ExitCode::from(app::run(&options, &settings, &engine))
}
