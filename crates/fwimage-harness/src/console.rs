//! Console sinks with scoped capture.
//!
//! Everything the harness prints goes through [`write_out`] / [`write_err`]
//! (usually via the [`outln!`](crate::outln) and [`errln!`](crate::errln)
//! macros). A [`CaptureGuard`] swaps both sinks for in-memory buffers until it
//! is dropped, which keeps nested tool invocations from polluting the primary
//! output while still letting the caller inspect what was written.
//!
//! The sinks live in thread-local storage. The harness drives everything from
//! one thread, so for the binary this is the process-wide console; in the test
//! binary it keeps parallel tests from stealing each other's output.
//!
//! Scopes must nest: a guard restores exactly the sinks that were active when
//! it was created, so dropping an outer guard before an inner one is not
//! supported.

use std::cell::RefCell;
use std::fmt;
use std::io::{self, Write};
use std::panic;
use std::sync::{Arc, Once};
use std::thread;

use parking_lot::Mutex;

type Sink = Box<dyn Write>;

struct Sinks {
    out: Sink,
    err: Sink,
}

thread_local! {
    // `None` means the real stdout/stderr.
    static SINKS: RefCell<Option<Sinks>> = const { RefCell::new(None) };
}

/// Write formatted text to the current stdout sink.
pub fn write_out(args: fmt::Arguments<'_>) {
    SINKS.with(|sinks| match sinks.borrow_mut().as_mut() {
        Some(sinks) => {
            let _ = sinks.out.write_fmt(args);
        }
        None => {
            let _ = io::stdout().lock().write_fmt(args);
        }
    });
}

/// Write formatted text to the current stderr sink.
pub fn write_err(args: fmt::Arguments<'_>) {
    SINKS.with(|sinks| match sinks.borrow_mut().as_mut() {
        Some(sinks) => {
            let _ = sinks.err.write_fmt(args);
        }
        None => {
            let _ = io::stderr().lock().write_fmt(args);
        }
    });
}

/// Flush both active sinks.
pub fn flush() {
    SINKS.with(|sinks| match sinks.borrow_mut().as_mut() {
        Some(sinks) => {
            let _ = sinks.out.flush();
            let _ = sinks.err.flush();
        }
        None => {
            let _ = io::stdout().flush();
            let _ = io::stderr().flush();
        }
    });
}

/// Returns true while a [`CaptureGuard`] is active on this thread.
#[must_use]
pub fn is_capturing() -> bool {
    SINKS.with(|sinks| sinks.borrow().is_some())
}

/// Send panic messages through the stderr sink while this thread is
/// capturing; other panics go to the previously installed hook. Installed
/// once per process.
pub fn route_panics_through_console() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let thread = thread::current();
            let name = thread.name().unwrap_or("<unnamed>");
            // A panic raised while a sink is borrowed falls back to the old hook.
            let routed = SINKS
                .try_with(|sinks| match sinks.try_borrow_mut() {
                    Ok(mut sinks) => match sinks.as_mut() {
                        Some(sinks) => {
                            let _ = writeln!(sinks.err, "thread '{name}' {info}");
                            true
                        }
                        None => false,
                    },
                    Err(_) => false,
                })
                .unwrap_or(false);
            if !routed {
                previous(info);
            }
        }));
    });
}

/// Print a line to the harness stdout sink.
#[macro_export]
macro_rules! outln {
    () => {
        $crate::console::write_out(format_args!("\n"))
    };
    ($($arg:tt)*) => {
        $crate::console::write_out(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Print a line to the harness stderr sink.
#[macro_export]
macro_rules! errln {
    () => {
        $crate::console::write_err(format_args!("\n"))
    };
    ($($arg:tt)*) => {
        $crate::console::write_err(format_args!("{}\n", format_args!($($arg)*)))
    };
}

/// Shared, clonable byte buffer usable as a [`Write`] sink.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured bytes decoded lossily as UTF-8.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Text captured by a finished [`CaptureGuard`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Active output capture. The previous sinks come back when this is dropped,
/// including during unwinding.
#[must_use = "output is only captured while the guard is alive"]
pub struct CaptureGuard {
    previous: Option<Sinks>,
    stdout: CaptureBuffer,
    stderr: CaptureBuffer,
}

/// Divert stdout and stderr sinks into fresh buffers.
pub fn capture_output() -> CaptureGuard {
    let stdout = CaptureBuffer::new();
    let stderr = CaptureBuffer::new();
    let previous = SINKS.with(|sinks| {
        sinks.borrow_mut().replace(Sinks {
            out: Box::new(stdout.clone()),
            err: Box::new(stderr.clone()),
        })
    });
    CaptureGuard {
        previous,
        stdout,
        stderr,
    }
}

impl CaptureGuard {
    /// Handle to the stdout buffer; stays readable after the guard is gone.
    #[must_use]
    pub fn stdout(&self) -> CaptureBuffer {
        self.stdout.clone()
    }

    /// Handle to the stderr buffer; stays readable after the guard is gone.
    #[must_use]
    pub fn stderr(&self) -> CaptureBuffer {
        self.stderr.clone()
    }

    /// End the capture scope and return what was written.
    pub fn finish(self) -> Captured {
        let stdout = self.stdout.clone();
        let stderr = self.stderr.clone();
        drop(self);
        Captured {
            stdout: stdout.contents(),
            stderr: stderr.contents(),
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        SINKS.with(|sinks| *sinks.borrow_mut() = previous);
    }
}

/// Run `f` with output captured, returning its value and the captured text.
pub fn with_captured_output<R>(f: impl FnOnce() -> R) -> (R, Captured) {
    let guard = capture_output();
    let value = f();
    (value, guard.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn capture_collects_both_streams() {
        let ((), captured) = with_captured_output(|| {
            outln!("hello {}", 42);
            errln!("warning");
        });
        assert_eq!(captured.stdout, "hello 42\n");
        assert_eq!(captured.stderr, "warning\n");
        assert!(!is_capturing());
    }

    #[test]
    fn nested_scopes_restore_outer_sinks() {
        let outer = capture_output();
        outln!("outer-1");
        {
            let ((), inner) = with_captured_output(|| outln!("inner"));
            assert_eq!(inner.stdout, "inner\n");
        }
        outln!("outer-2");
        let captured = outer.finish();
        assert_eq!(captured.stdout, "outer-1\nouter-2\n");
        assert!(!is_capturing());
    }

    #[test]
    fn sinks_restored_when_block_panics() {
        let outer = capture_output();
        let outer_stdout = outer.stdout();

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _inner = capture_output();
            outln!("swallowed");
            panic!("boom");
        }));
        assert!(result.is_err());

        // The outer capture must be active again, not the inner one.
        outln!("after");
        assert_eq!(outer_stdout.contents(), "after\n");
        drop(outer);
        assert!(!is_capturing());
    }

    #[test]
    fn buffers_stay_readable_after_scope_ends() {
        let guard = capture_output();
        let err = guard.stderr();
        errln!("kept");
        drop(guard);
        assert_eq!(err.contents(), "kept\n");
    }
}
