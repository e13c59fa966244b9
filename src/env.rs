//! Execution environment abstraction.
//!
//! The driver never touches process globals directly; it goes through the
//! [`Environment`] trait for argv, environment variables, the working
//! directory, and the output stream. [`OsEnvironment`] is the production
//! implementation; [`TestEnvironment`] lets tests run the full driver with
//! a scripted argv and a captured stdout buffer.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

/// Environment variable overriding the program name shown in help text.
pub const BIN_NAME_ENV: &str = "TARG_BIN_NAME";

/// Process environment seen by the driver and the flag binder.
pub trait Environment: Send + Sync {
    /// Full argv, program name included.
    fn args(&self) -> Vec<String>;

    /// Look up an environment variable. `None` when unset; callers treat
    /// empty values as unset as well.
    fn getenv(&self, key: &str) -> Option<String>;

    /// Current working directory (the root for watch/cache file walks).
    fn getwd(&self) -> io::Result<PathBuf>;

    /// A fresh handle onto the output stream. Handles may be short-lived;
    /// all handles from one environment reach the same underlying stream.
    fn stdout(&self) -> Box<dyn Write + Send>;

    /// Whether the process can receive interrupt signals (false under some
    /// embedded/test harnesses; gates the driver's ctrl-c wiring).
    fn supports_signals(&self) -> bool {
        true
    }

    /// The program name for usage text, honoring [`BIN_NAME_ENV`].
    fn binary_name(&self) -> String {
        if let Some(name) = self.getenv(BIN_NAME_ENV).filter(|n| !n.is_empty()) {
            return name;
        }
        self.args()
            .first()
            .map(|arg0| {
                PathBuf::from(arg0)
                    .file_name()
                    .map_or_else(|| arg0.clone(), |n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "targ".to_string())
    }
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnvironment;

impl Environment for OsEnvironment {
    fn args(&self) -> Vec<String> {
        std::env::args().collect()
    }

    fn getenv(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn getwd(&self) -> io::Result<PathBuf> {
        std::env::current_dir()
    }

    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(io::stdout())
    }
}

/// Scripted environment for tests: fixed argv and variables, stdout
/// captured into a shared buffer.
#[derive(Clone)]
pub struct TestEnvironment {
    args: Vec<String>,
    vars: HashMap<String, String>,
    cwd: PathBuf,
    output: Arc<Mutex<Vec<u8>>>,
}

impl TestEnvironment {
    /// Create a test environment with the given argv (program name
    /// included).
    #[must_use]
    pub fn new(args: &[&str]) -> Self {
        Self {
            args: args.iter().map(ToString::to_string).collect(),
            vars: HashMap::new(),
            cwd: PathBuf::from("."),
            output: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set an environment variable.
    #[must_use]
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Everything written to stdout so far.
    #[must_use]
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.output.lock()).into_owned()
    }
}

/// Write handle into a [`TestEnvironment`] buffer.
struct BufferWriter(Arc<Mutex<Vec<u8>>>);

impl Write for BufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Environment for TestEnvironment {
    fn args(&self) -> Vec<String> {
        self.args.clone()
    }

    fn getenv(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }

    fn getwd(&self) -> io::Result<PathBuf> {
        Ok(self.cwd.clone())
    }

    fn stdout(&self) -> Box<dyn Write + Send> {
        Box::new(BufferWriter(Arc::clone(&self.output)))
    }

    fn supports_signals(&self) -> bool {
        false
    }
}
