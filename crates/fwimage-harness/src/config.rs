//! Run configuration.
//!
//! [`ExecutionOptions`] is built once from the command line and only read
//! afterwards. [`HarnessSettings`] holds the knobs that come from the
//! environment:
//! - `FWIMAGE_ENGINE`: command line of the image-building engine.
//! - `FWIMAGE_COVERAGE_TOOL`: coverage tool command (default `python3 -m coverage`).
//! - `FWIMAGE_COVERAGE_TIMEOUT_SECS`: limit for the measured test run (default 1800).
//! - `FWIMAGE_TEST_TIMEOUT_SECS`: default limit per manifest test command (default 600).

use std::path::PathBuf;
use std::time::Duration;

pub const ENGINE_ENV: &str = "FWIMAGE_ENGINE";
pub const COVERAGE_TOOL_ENV: &str = "FWIMAGE_COVERAGE_TOOL";
pub const COVERAGE_TIMEOUT_ENV: &str = "FWIMAGE_COVERAGE_TIMEOUT_SECS";
pub const TEST_TIMEOUT_ENV: &str = "FWIMAGE_TEST_TIMEOUT_SECS";
/// Set to `1` for manifest test commands when the harness runs in debug mode.
pub const TEST_DEBUG_ENV: &str = "FWIMAGE_TEST_DEBUG";

pub const DEFAULT_COVERAGE_TOOL: &str = "python3 -m coverage";
pub const DEFAULT_COVERAGE_TIMEOUT: Duration = Duration::from_secs(1800);
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(600);

pub const DEFAULT_BUILD_DIR: &str = "b";
pub const DEFAULT_ETYPE_DIR: &str = "tools/fwimage/etype";
pub const DEFAULT_MANIFEST: &str = "tests/harness/test_groups.v1.json";

/// How much detail error reports carry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Message only.
    #[default]
    Terse,
    /// Message plus the full cause chain and captured test output.
    Debug,
}

impl Verbosity {
    #[must_use]
    pub const fn from_debug_flag(debug: bool) -> Self {
        if debug { Self::Debug } else { Self::Terse }
    }

    #[must_use]
    pub const fn is_debug(self) -> bool {
        matches!(self, Self::Debug)
    }
}

/// Which top-level action a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Tests,
    Coverage,
    EntryDocs,
    Build,
}

/// Immutable per-run options.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub run_tests: bool,
    pub run_coverage: bool,
    pub entry_docs: bool,
    pub verbosity: Verbosity,
    pub test_name_filter: Option<String>,
    pub build_dir: PathBuf,
    pub etype_dir: PathBuf,
    pub manifest: PathBuf,
    /// Entry script re-run under the coverage tool; coverage mode needs it.
    pub program: Option<PathBuf>,
    pub extra_omit: Vec<String>,
    pub omit_matching: Option<String>,
    pub log_path: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    /// Arguments forwarded verbatim to the engine.
    pub engine_args: Vec<String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            run_tests: false,
            run_coverage: false,
            entry_docs: false,
            verbosity: Verbosity::Terse,
            test_name_filter: None,
            build_dir: PathBuf::from(DEFAULT_BUILD_DIR),
            etype_dir: PathBuf::from(DEFAULT_ETYPE_DIR),
            manifest: PathBuf::from(DEFAULT_MANIFEST),
            program: None,
            extra_omit: Vec::new(),
            omit_matching: None,
            log_path: None,
            artifacts_dir: None,
            engine_args: Vec::new(),
        }
    }
}

impl ExecutionOptions {
    /// Tests win over coverage, coverage over docs; anything else builds.
    #[must_use]
    pub fn mode(&self) -> RunMode {
        if self.run_tests {
            RunMode::Tests
        } else if self.run_coverage {
            RunMode::Coverage
        } else if self.entry_docs {
            RunMode::EntryDocs
        } else {
            RunMode::Build
        }
    }
}

/// Environment-derived settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessSettings {
    /// Engine command line; empty when no engine is configured.
    pub engine: Vec<String>,
    pub coverage_tool: Vec<String>,
    pub coverage_timeout: Duration,
    pub test_timeout: Duration,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            engine: Vec::new(),
            coverage_tool: split_command(DEFAULT_COVERAGE_TOOL),
            coverage_timeout: DEFAULT_COVERAGE_TIMEOUT,
            test_timeout: DEFAULT_TEST_TIMEOUT,
        }
    }
}

impl HarnessSettings {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unset, blank or
    /// unparsable values keep their defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        if let Some(engine) = lookup(ENGINE_ENV) {
            settings.engine = split_command(&engine);
        }
        if let Some(tool) = lookup(COVERAGE_TOOL_ENV) {
            let tool = split_command(&tool);
            if !tool.is_empty() {
                settings.coverage_tool = tool;
            }
        }
        if let Some(secs) = lookup(COVERAGE_TIMEOUT_ENV).as_deref().and_then(parse_secs) {
            settings.coverage_timeout = secs;
        }
        if let Some(secs) = lookup(TEST_TIMEOUT_ENV).as_deref().and_then(parse_secs) {
            settings.test_timeout = secs;
        }
        settings
    }
}

/// Whitespace-split a command string. No quoting rules.
#[must_use]
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Parse a positive number of seconds, allowing `_` separators.
fn parse_secs(raw: &str) -> Option<Duration> {
    let secs = raw.trim().replace('_', "").parse::<u64>().ok()?;
    (secs > 0).then(|| Duration::from_secs(secs))
}
