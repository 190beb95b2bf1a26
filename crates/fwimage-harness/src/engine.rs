//! The image-building engine, reached as an opaque collaborator.

use std::collections::BTreeSet;
use std::process::Command;

use thiserror::Error;

use crate::config::ENGINE_ENV;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no image engine configured (set {ENGINE_ENV})")]
    NotConfigured,
    #[error("failed to start engine '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("engine terminated by signal")]
    Signaled,
    #[error("entry documentation failed (exit code {code})")]
    DocsFailed { code: i32 },
}

/// What the harness asks of the image builder.
pub trait Engine {
    /// Build images from `args`; returns the engine's exit code.
    fn build(&self, args: &[String]) -> Result<i32, EngineError>;

    /// Emit documentation for the given entry types.
    fn write_entry_docs(&self, modules: &BTreeSet<String>) -> Result<(), EngineError>;
}

/// Engine run as a separate executable with inherited stdio.
///
/// Builds forward the harness arguments verbatim; docs are requested with
/// `--entry-docs <module>...`.
#[derive(Debug, Clone)]
pub struct ExternalEngine {
    argv: Vec<String>,
}

impl ExternalEngine {
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn command(&self) -> Result<Command, EngineError> {
        let (program, args) = self.argv.split_first().ok_or(EngineError::NotConfigured)?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }

    fn status(&self, mut cmd: Command) -> Result<i32, EngineError> {
        crate::console::flush();
        let status = cmd.status().map_err(|source| EngineError::Spawn {
            program: self.argv.first().cloned().unwrap_or_default(),
            source,
        })?;
        status.code().ok_or(EngineError::Signaled)
    }
}

impl Engine for ExternalEngine {
    fn build(&self, args: &[String]) -> Result<i32, EngineError> {
        let mut cmd = self.command()?;
        cmd.args(args);
        self.status(cmd)
    }

    fn write_entry_docs(&self, modules: &BTreeSet<String>) -> Result<(), EngineError> {
        let mut cmd = self.command()?;
        cmd.arg("--entry-docs").args(modules);
        match self.status(cmd)? {
            0 => Ok(()),
            code => Err(EngineError::DocsFailed { code }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_engine_is_an_error() {
        let engine = ExternalEngine::new(Vec::new());
        assert!(matches!(engine.build(&[]), Err(EngineError::NotConfigured)));
        assert!(matches!(
            engine.write_entry_docs(&BTreeSet::new()),
            Err(EngineError::NotConfigured)
        ));
    }

    #[cfg(unix)]
    #[test]
    fn build_returns_engine_exit_code() {
        let engine = ExternalEngine::new(vec!["sh".into(), "-c".into(), "exit \"$0\"".into()]);
        assert_eq!(engine.build(&["4".to_string()]).unwrap(), 4);
    }

    #[test]
    fn missing_engine_binary_reports_spawn_error() {
        let engine = ExternalEngine::new(vec!["/nonexistent/fwimage-engine".into()]);
        let err = engine.build(&[]).unwrap_err();
        assert!(matches!(err, EngineError::Spawn { .. }));
    }
}
