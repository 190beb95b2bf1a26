//! Top-level mode dispatch.

use crate::config::{ExecutionOptions, HarnessSettings, RunMode};
use crate::coverage::{self, CoverageConfig, CoverageRequest, ToolBackend};
use crate::discovery::{DEFAULT_PLUGIN_EXTENSION, PluginRegistry};
use crate::dispatcher::{self, DispatchOptions};
use crate::engine::Engine;
use crate::error::{HarnessError, report_error};
use crate::manifest;
use crate::structured_log::{LogEmitter, LogLevel};

fn gate_name(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Tests => dispatcher::GATE,
        RunMode::Coverage => coverage::GATE,
        RunMode::EntryDocs => "entry_docs",
        RunMode::Build => "build",
    }
}

fn run_id() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("run-{secs}-{}", std::process::id())
}

fn open_log(options: &ExecutionOptions, run_id: &str) -> Result<LogEmitter, HarnessError> {
    let Some(path) = &options.log_path else {
        return Ok(LogEmitter::disabled());
    };
    LogEmitter::to_file(path, gate_name(options.mode()), run_id).map_err(|source| {
        HarnessError::Log {
            path: path.clone(),
            source,
        }
    })
}

/// Run the selected mode and return the process exit code.
///
/// Errors are reported on the console here; callers only see the code.
pub fn run(options: &ExecutionOptions, settings: &HarnessSettings, engine: &dyn Engine) -> u8 {
    let run_id = run_id();
    let mut log = match open_log(options, &run_id) {
        Ok(log) => log,
        Err(err) => {
            report_error(&err, options.verbosity);
            return 1;
        }
    };

    let code = match dispatch(options, settings, engine, &run_id, &mut log) {
        Ok(code) => code,
        Err(err) => {
            report_error(&err, options.verbosity);
            1
        }
    };

    let entry = log
        .entry(LogLevel::Info, "run_end")
        .with_exit_code(i32::from(code));
    log.record(entry);
    log.finish();
    crate::console::flush();
    code
}

fn dispatch(
    options: &ExecutionOptions,
    settings: &HarnessSettings,
    engine: &dyn Engine,
    run_id: &str,
    log: &mut LogEmitter,
) -> Result<u8, HarnessError> {
    match options.mode() {
        RunMode::Tests => run_tests(options, settings, log),
        RunMode::Coverage => run_coverage(options, settings, run_id, log),
        RunMode::EntryDocs => {
            let registry = PluginRegistry::scan(&options.etype_dir, DEFAULT_PLUGIN_EXTENSION)?;
            engine.write_entry_docs(&registry.names(true))?;
            Ok(0)
        }
        RunMode::Build => {
            let code = engine.build(&options.engine_args)?;
            Ok(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn run_tests(
    options: &ExecutionOptions,
    settings: &HarnessSettings,
    log: &mut LogEmitter,
) -> Result<u8, HarnessError> {
    let groups = manifest::load_groups(&options.manifest)?;
    let filter = options.test_name_filter.as_deref();
    if let Some(name) = filter {
        match dispatcher::groups_containing(&groups, name).as_slice() {
            [] => crate::errln!("warning: no test named '{name}'"),
            [_] => {}
            found => {
                let names: Vec<_> = found.iter().map(|kind| kind.suite_name()).collect();
                crate::errln!(
                    "warning: test '{name}' is defined in several groups: {}",
                    names.join(", ")
                );
            }
        }
    }

    let dispatch_options = DispatchOptions {
        verbosity: options.verbosity,
        default_timeout: settings.test_timeout,
    };
    let result = dispatcher::run(&groups, filter, dispatch_options, log);
    Ok(dispatcher::finish(&result))
}

fn run_coverage(
    options: &ExecutionOptions,
    settings: &HarnessSettings,
    run_id: &str,
    log: &mut LogEmitter,
) -> Result<u8, HarnessError> {
    let registry = PluginRegistry::scan(&options.etype_dir, DEFAULT_PLUGIN_EXTENSION)?;
    let required = registry.required_modules();

    let program = options.program.clone().ok_or(HarnessError::MissingProgram)?;
    let mut config = CoverageConfig {
        tool: settings.coverage_tool.clone(),
        omit_matching: options.omit_matching.clone(),
        timeout: settings.coverage_timeout,
        ..CoverageConfig::default()
    };
    config.support_globs.extend(options.extra_omit.iter().cloned());
    let request = CoverageRequest {
        program: &program,
        required: &required,
        build_dir: &options.build_dir,
        verbosity: options.verbosity,
        artifacts_dir: options.artifacts_dir.as_deref(),
        run_id,
    };

    let mut backend = ToolBackend::new(&config);
    coverage::run(&mut backend, &request, &config, log)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::config::Verbosity;
    use crate::console::with_captured_output;
    use crate::engine::EngineError;

    #[derive(Default)]
    struct RecordingEngine {
        built: parking_lot::Mutex<Vec<Vec<String>>>,
        docs: parking_lot::Mutex<Vec<BTreeSet<String>>>,
        exit_code: i32,
    }

    impl Engine for RecordingEngine {
        fn build(&self, args: &[String]) -> Result<i32, EngineError> {
            self.built.lock().push(args.to_vec());
            Ok(self.exit_code)
        }

        fn write_entry_docs(&self, modules: &BTreeSet<String>) -> Result<(), EngineError> {
            self.docs.lock().push(modules.clone());
            Ok(())
        }
    }

    fn unique_tmp_dir(prefix: &str) -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!("{prefix}-{}-{n}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn build_mode_forwards_args_and_exit_code() {
        let engine = RecordingEngine {
            exit_code: 3,
            ..RecordingEngine::default()
        };
        let options = ExecutionOptions {
            engine_args: vec!["-d".into(), "board.dtb".into()],
            ..ExecutionOptions::default()
        };
        let code = run(&options, &HarnessSettings::default(), &engine);
        assert_eq!(code, 3);
        assert_eq!(engine.built.lock().as_slice(), [vec!["-d".to_string(), "board.dtb".to_string()]]);
    }

    #[test]
    fn entry_docs_include_testing_modules() {
        let dir = unique_tmp_dir("fwimage-app-docs");
        for name in ["blob.py", "fill.py", "_testing.py"] {
            std::fs::write(dir.join(name), "").unwrap();
        }
        let engine = RecordingEngine::default();
        let options = ExecutionOptions {
            entry_docs: true,
            etype_dir: dir.clone(),
            ..ExecutionOptions::default()
        };
        assert_eq!(run(&options, &HarnessSettings::default(), &engine), 0);
        let docs = engine.docs.lock();
        assert_eq!(docs.len(), 1);
        assert!(docs[0].contains("_testing"));
        assert_eq!(docs[0].len(), 3);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_manifest_is_reported_and_fails() {
        let engine = RecordingEngine::default();
        let options = ExecutionOptions {
            run_tests: true,
            manifest: PathBuf::from("/nonexistent/test_groups.v1.json"),
            ..ExecutionOptions::default()
        };
        let (code, captured) =
            with_captured_output(|| run(&options, &HarnessSettings::default(), &engine));
        assert_eq!(code, 1);
        assert!(captured.stderr.starts_with("fwimage: failed to read test manifest"));
        assert!(engine.built.lock().is_empty());
    }

    #[test]
    fn coverage_with_missing_plugin_dir_fails() {
        let engine = RecordingEngine::default();
        let options = ExecutionOptions {
            run_coverage: true,
            etype_dir: PathBuf::from("/nonexistent/etype"),
            verbosity: Verbosity::Debug,
            ..ExecutionOptions::default()
        };
        let (code, captured) =
            with_captured_output(|| run(&options, &HarnessSettings::default(), &engine));
        assert_eq!(code, 1);
        assert!(captured.stderr.contains("/nonexistent/etype"));
    }

    #[test]
    fn coverage_without_program_fails_before_measuring() {
        let dir = unique_tmp_dir("fwimage-app-noprog");
        std::fs::write(dir.join("blob.py"), "").unwrap();
        let options = ExecutionOptions {
            run_coverage: true,
            etype_dir: dir.clone(),
            ..ExecutionOptions::default()
        };
        let settings = HarnessSettings {
            coverage_tool: vec!["/nonexistent/coverage-tool".into()],
            ..HarnessSettings::default()
        };
        let (code, captured) =
            with_captured_output(|| run(&options, &settings, &RecordingEngine::default()));
        assert_eq!(code, 1);
        assert_eq!(
            captured.stderr,
            "fwimage: coverage mode needs the entry script to measure (--program)\n"
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn tests_mode_takes_precedence_over_coverage() {
        let dir = unique_tmp_dir("fwimage-app-tests");
        let manifest = dir.join("test_groups.v1.json");
        std::fs::write(&manifest, r#"{"schema_version":1,"groups":{}}"#).unwrap();
        let options = ExecutionOptions {
            run_tests: true,
            run_coverage: true,
            manifest,
            ..ExecutionOptions::default()
        };
        let (code, captured) = with_captured_output(|| {
            run(&options, &HarnessSettings::default(), &RecordingEngine::default())
        });
        assert_eq!(code, 0);
        assert!(captured.stdout.contains("run=0"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
