//! Error types for targ.
//!
//! One error enum covers every failure class the engine can surface:
//! argument binding, tree construction, registry resolution, execution,
//! and the cache/watch collaborators. Errors are values all the way up to
//! the driver, which translates them to stderr output and an exit code.

use std::time::Duration;

use thiserror::Error;

/// Primary error type for targ operations.
#[derive(Error, Debug)]
pub enum TargError {
    /// A long or short flag that is not in the node's schema.
    #[error("unknown flag {flag} for '{node}'")]
    UnknownFlag {
        /// The flag as it appeared on the command line.
        flag: String,
        /// Command path of the node being parsed.
        node: String,
    },

    /// A short-flag cluster contains a value-taking flag before the end.
    #[error("short flag -{flag} takes a value and must be last in group '-{cluster}'")]
    ShortGroupNotBool {
        /// The cluster without its leading dash.
        cluster: String,
        /// The offending member.
        flag: char,
    },

    /// A single-dash token spelled a known long flag name.
    #[error("flag -{flag} looks like a long flag; use --{flag}")]
    LongFlagFormat {
        /// The long name that was spelled with one dash.
        flag: String,
    },

    /// A required flag received no value from argv, environment, or default.
    #[error("missing required flag {flag}")]
    MissingRequired {
        /// Rendered as `--name` or `--name, -x`.
        flag: String,
    },

    /// Fewer positional arguments than the schema requires.
    #[error("missing required argument <{name}> for '{node}'")]
    MissingPositional {
        /// The positional parameter name.
        name: String,
        /// Command path of the node being parsed.
        node: String,
    },

    /// Coercion or enum validation failed for a parameter value.
    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        /// The parameter the value was bound to.
        name: String,
        /// The raw value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// An argv token matched no command at the current level.
    #[error("unknown command '{name}'{context}")]
    UnknownCommand {
        /// The token that failed to match.
        name: String,
        /// Either empty or ` under '<parent>'`.
        context: String,
    },

    /// A function target carried no callable.
    #[error("target '{target}' has a nil function body")]
    NilFunction {
        /// The target name.
        target: String,
    },

    /// A nil target or group reached the registry or tree builder.
    #[error("nil target")]
    NilTarget,

    /// A function body's shape does not match its parameter schema.
    #[error("invalid function signature for '{target}': {reason}")]
    InvalidFunctionSignature {
        /// The target name.
        target: String,
        /// What was wrong with the shape.
        reason: String,
    },

    /// A node declares a flag also declared by an ancestor (or twice).
    #[error("flag --{flag} on '{node}' conflicts with {ancestor}")]
    FlagConflict {
        /// The conflicting flag name.
        flag: String,
        /// Command path of the declaring node.
        node: String,
        /// Where the flag was already declared.
        ancestor: String,
    },

    /// Two registered entries share a CLI name but come from different
    /// packages.
    #[error("target name '{name}' is provided by both {first} and {second}")]
    NameConflict {
        /// The contested CLI name.
        name: String,
        /// First source package (or "local").
        first: String,
        /// Second source package (or "local").
        second: String,
    },

    /// A per-target timeout fired.
    #[error("target '{target}' timed out after {}", humantime::format_duration(*.timeout))]
    DeadlineExceeded {
        /// The target that was cancelled.
        target: String,
        /// The configured timeout.
        timeout: Duration,
    },

    /// The shell runner's subprocess exited non-zero.
    #[error("command failed{}: {command}", exit_suffix(.code))]
    ShellFailure {
        /// The substituted command string.
        command: String,
        /// The subprocess exit code, if any.
        code: Option<i32>,
    },

    /// A function target body returned an error.
    #[error("target '{target}' failed: {source}")]
    TargetFailed {
        /// The target that failed.
        target: String,
        /// The error the body returned.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Deregistration attempted after registry resolution.
    #[error("cannot deregister '{package}' after the registry has been resolved; deregister during initialization")]
    PostResolutionDeregister {
        /// The package path that was passed.
        package: String,
    },

    /// An invalid argument reached an engine API.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// Name of the invalid argument.
        name: String,
        /// Reason why the argument is invalid.
        reason: String,
    },

    /// The fingerprint store failed; by policy this is logged and treated
    /// as a cache miss by the orchestrator.
    #[error("cache store error: {context}")]
    CacheIo {
        /// Context describing the operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The watcher collaborator failed.
    #[error("watch error: {context}")]
    Watch {
        /// Context describing the watch operation.
        context: String,
        /// Underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// I/O error with context.
    #[error("I/O error: {context}")]
    Io {
        /// Context describing the operation that failed.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A target requested a specific process exit code.
    #[error("exit {code}")]
    Exited {
        /// The requested exit code.
        code: i32,
    },
}

impl TargError {
    /// Create a new I/O error with context.
    #[must_use]
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a new cache store error with context.
    #[must_use]
    pub fn cache(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CacheIo {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Create a new watch error with context.
    #[must_use]
    pub fn watch(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Watch {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Get the process exit code for this error.
    ///
    /// Any error exits `1` unless a target explicitly propagated an exit
    /// code through [`TargError::Exited`].
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Exited { code } => *code,
            _ => 1,
        }
    }

    /// Whether this error came from argument parsing, in which case the
    /// driver appends a short usage hint for the current node.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(
            self,
            Self::UnknownFlag { .. }
                | Self::ShortGroupNotBool { .. }
                | Self::LongFlagFormat { .. }
                | Self::MissingRequired { .. }
                | Self::MissingPositional { .. }
                | Self::InvalidValue { .. }
        )
    }
}

/// Result type alias for targ operations.
pub type Result<T> = std::result::Result<T, TargError>;

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {code}"),
        None => String::new(),
    }
}

impl From<std::io::Error> for TargError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            context: "I/O operation failed".to_string(),
            source: err,
        }
    }
}
