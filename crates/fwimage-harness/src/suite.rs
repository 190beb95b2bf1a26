//! Test groups, cases and accumulated results.

use std::fmt;

use crate::process::CommandSpec;

/// The five test groups, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKind {
    /// Unit tests of individual entry types.
    Entry,
    /// End-to-end image builds.
    Functional,
    /// Device-tree parser.
    Fdt,
    /// ELF parser.
    Elf,
    /// Whole-image integration.
    Image,
}

impl GroupKind {
    pub const ALL: [Self; 5] = [
        Self::Entry,
        Self::Functional,
        Self::Fdt,
        Self::Elf,
        Self::Image,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Functional => "functional",
            Self::Fdt => "fdt",
            Self::Elf => "elf",
            Self::Image => "image",
        }
    }

    /// Suite name used as the prefix of test ids.
    #[must_use]
    pub const fn suite_name(self) -> &'static str {
        match self {
            Self::Entry => "TestEntry",
            Self::Functional => "TestFunctional",
            Self::Fdt => "TestFdt",
            Self::Elf => "TestElf",
            Self::Image => "TestImage",
        }
    }

    /// Parse a group name (case-insensitive, accepts suite names too).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| {
            s.eq_ignore_ascii_case(kind.as_str()) || s.eq_ignore_ascii_case(kind.suite_name())
        })
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a test did not pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestFailure {
    /// An expectation did not hold.
    Failed(String),
    /// The test could not run to completion.
    Errored(String),
}

impl TestFailure {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn errored(message: impl Into<String>) -> Self {
        Self::Errored(message.into())
    }
}

/// Assert inside an in-process test body, producing [`TestFailure::Failed`].
pub fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), TestFailure> {
    if condition {
        Ok(())
    } else {
        Err(TestFailure::Failed(message()))
    }
}

pub type TestFn = Box<dyn Fn() -> Result<(), TestFailure>>;

pub enum TestBody {
    /// Runs inside the harness; a panic counts as an error.
    InProcess(TestFn),
    /// Runs a command: exit 0 passes, exit 1 fails, anything else errors.
    Command(CommandSpec),
}

impl fmt::Debug for TestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("InProcess(..)"),
            Self::Command(spec) => f.debug_tuple("Command").field(spec).finish(),
        }
    }
}

#[derive(Debug)]
pub struct TestCase {
    name: String,
    body: TestBody,
}

impl TestCase {
    pub fn from_fn(
        name: impl Into<String>,
        body: impl Fn() -> Result<(), TestFailure> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: TestBody::InProcess(Box::new(body)),
        }
    }

    pub fn command(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            body: TestBody::Command(spec),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn body(&self) -> &TestBody {
        &self.body
    }
}

/// An ordered suite of test cases for one subsystem.
#[derive(Debug)]
pub struct TestGroup {
    kind: GroupKind,
    cases: Vec<TestCase>,
}

impl TestGroup {
    #[must_use]
    pub fn new(kind: GroupKind) -> Self {
        Self {
            kind,
            cases: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_case(mut self, case: TestCase) -> Self {
        self.cases.push(case);
        self
    }

    pub fn push(&mut self, case: TestCase) {
        self.cases.push(case);
    }

    #[must_use]
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    #[must_use]
    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    /// Find a case by bare name or by full `Suite.name` id.
    ///
    /// `None` means the test belongs to some other group.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&TestCase> {
        let bare = name
            .strip_prefix(self.kind.suite_name())
            .and_then(|rest| rest.strip_prefix('.'))
            .unwrap_or(name);
        self.cases.iter().find(|case| case.name == bare)
    }

    /// Fully-qualified id of `case`, e.g. `TestEntry.testEntryContents`.
    #[must_use]
    pub fn test_id(&self, case: &TestCase) -> String {
        format!("{}.{}", self.kind.suite_name(), case.name)
    }
}

/// Results merged across every group in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSuiteResult {
    pub tests_run: usize,
    /// `(test_id, detail)` for tests that could not complete.
    pub errors: Vec<(String, String)>,
    /// `(test_id, detail)` for tests whose expectations failed.
    pub failures: Vec<(String, String)>,
}

impl TestSuiteResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_success(&mut self) {
        self.tests_run += 1;
    }

    pub fn add_failure(&mut self, test_id: impl Into<String>, detail: impl Into<String>) {
        self.tests_run += 1;
        self.failures.push((test_id.into(), detail.into()));
    }

    pub fn add_error(&mut self, test_id: impl Into<String>, detail: impl Into<String>) {
        self.tests_run += 1;
        self.errors.push((test_id.into(), detail.into()));
    }

    #[must_use]
    pub fn was_successful(&self) -> bool {
        self.errors.is_empty() && self.failures.is_empty()
    }
}

impl fmt::Display for TestSuiteResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<TestResult run={} errors={} failures={}>",
            self.tests_run,
            self.errors.len(),
            self.failures.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> TestGroup {
        TestGroup::new(GroupKind::Elf)
            .with_case(TestCase::from_fn("testAllSymbols", || Ok(())))
            .with_case(TestCase::command("testBadFile", CommandSpec::new(["true"])))
    }

    #[test]
    fn lookup_accepts_bare_and_qualified_names() {
        let group = group();
        assert_eq!(group.lookup("testBadFile").map(TestCase::name), Some("testBadFile"));
        assert_eq!(
            group.lookup("TestElf.testAllSymbols").map(TestCase::name),
            Some("testAllSymbols")
        );
        assert!(group.lookup("TestFdt.testAllSymbols").is_none());
        assert!(group.lookup("testMissing").is_none());
    }

    #[test]
    fn test_id_uses_suite_prefix() {
        let group = group();
        assert_eq!(group.test_id(&group.cases()[0]), "TestElf.testAllSymbols");
    }

    #[test]
    fn group_names_parse_loosely() {
        assert_eq!(GroupKind::from_str_loose("FDT"), Some(GroupKind::Fdt));
        assert_eq!(GroupKind::from_str_loose("TestImage"), Some(GroupKind::Image));
        assert_eq!(GroupKind::from_str_loose("dtoc"), None);
    }

    #[test]
    fn result_counts_and_display() {
        let mut result = TestSuiteResult::new();
        result.add_success();
        result.add_failure("TestEntry.a", "assertion");
        result.add_error("TestImage.b", "panicked");
        assert_eq!(result.tests_run, 3);
        assert!(!result.was_successful());
        assert_eq!(result.to_string(), "<TestResult run=3 errors=1 failures=1>");
    }

    #[test]
    fn check_maps_to_failure() {
        assert_eq!(check(true, || "unused".into()), Ok(()));
        assert_eq!(
            check(false, || "size mismatch".into()),
            Err(TestFailure::failed("size mismatch"))
        );
    }
}
