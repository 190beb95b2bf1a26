//! Top-level harness error.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::Verbosity;
use crate::coverage::CoverageError;
use crate::discovery::DiscoveryError;
use crate::engine::EngineError;
use crate::manifest::ManifestError;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Coverage(#[from] CoverageError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to open structured log {}: {source}", path.display())]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("coverage mode needs the entry script to measure (--program)")]
    MissingProgram,
}

/// Print `err` as `fwimage: <message>`; at debug verbosity also print every
/// underlying cause.
pub fn report_error(err: &(dyn std::error::Error + 'static), verbosity: Verbosity) {
    crate::errln!("fwimage: {err}");
    if verbosity.is_debug() {
        let mut source = err.source();
        if source.is_some() {
            crate::errln!();
        }
        while let Some(cause) = source {
            crate::errln!("caused by: {cause}");
            source = cause.source();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::with_captured_output;

    fn nested() -> HarnessError {
        HarnessError::Log {
            path: PathBuf::from("/ro/run.jsonl"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        }
    }

    #[test]
    fn terse_report_is_message_only() {
        let ((), captured) = with_captured_output(|| report_error(&nested(), Verbosity::Terse));
        assert_eq!(
            captured.stderr,
            "fwimage: failed to open structured log /ro/run.jsonl: read-only\n"
        );
    }

    #[test]
    fn debug_report_walks_causes() {
        let ((), captured) = with_captured_output(|| report_error(&nested(), Verbosity::Debug));
        assert!(captured.stderr.ends_with("\ncaused by: read-only\n"));
    }
}
