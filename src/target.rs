//! Target and group descriptions.
//!
//! These are the records collaborator layers hand to the registry: a named
//! unit of work carrying exactly one body (a function, a shell template,
//! or nothing), its dependencies, and its execution configuration. The
//! engine consumes them; how a user spells them in source is a concern of
//! the declaration layer, not this crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Result, TargError};
use crate::exec::ExecContext;
use crate::params::{MetaHook, ParamDecl, ParamValues};

/// Valid CLI target names: kebab-case, starting with a letter.
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("static pattern"));

/// Whether `name` is a valid CLI identifier for a target or group.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

/// Error type target function bodies may return.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for target function bodies.
pub type FnResult = std::result::Result<(), DynError>;

/// The accepted function shapes: no arguments, a context, a parameter
/// record, or both. Any other shape is unrepresentable; a missing
/// callable ([`TargetFn::Nil`]) is rejected when the command tree is
/// built.
#[derive(Clone)]
pub enum TargetFn {
    /// `fn() -> Result<(), _>`
    Plain(Arc<dyn Fn() -> FnResult + Send + Sync>),
    /// `fn(&ExecContext) -> Result<(), _>`
    Ctx(Arc<dyn Fn(&ExecContext) -> FnResult + Send + Sync>),
    /// `fn(&ParamValues) -> Result<(), _>`
    Params(Arc<dyn Fn(&ParamValues) -> FnResult + Send + Sync>),
    /// `fn(&ExecContext, &ParamValues) -> Result<(), _>`
    CtxParams(Arc<dyn Fn(&ExecContext, &ParamValues) -> FnResult + Send + Sync>),
    /// Placeholder for a callable resolved later; never executable.
    Nil,
}

impl TargetFn {
    /// Whether the shape receives the parameter record.
    #[must_use]
    pub fn takes_params(&self) -> bool {
        matches!(self, Self::Params(_) | Self::CtxParams(_))
    }
}

impl fmt::Debug for TargetFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self {
            Self::Plain(_) => "fn()",
            Self::Ctx(_) => "fn(ctx)",
            Self::Params(_) => "fn(params)",
            Self::CtxParams(_) => "fn(ctx, params)",
            Self::Nil => "nil",
        };
        f.write_str(shape)
    }
}

/// A function body: the callable, its parameter schema, and an optional
/// programmatic metadata hook applied when the tree is built.
#[derive(Clone)]
pub struct FuncBody {
    /// The callable.
    pub func: TargetFn,
    /// Parameter declarations, in declaration order.
    pub params: Vec<ParamDecl>,
    /// Metadata hook run over each declaration at tree build.
    pub meta_hook: Option<MetaHook>,
}

impl fmt::Debug for FuncBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuncBody")
            .field("func", &self.func)
            .field("params", &self.params.len())
            .finish_non_exhaustive()
    }
}

/// A target's body: exactly one of function, shell template, or nothing.
#[derive(Debug, Clone)]
pub enum Body {
    /// Invoke a function.
    Func(FuncBody),
    /// Substitute `$var` placeholders and hand the string to the shell
    /// runner.
    Shell(String),
    /// Dependencies only.
    None,
}

/// Ordering of a target's dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepMode {
    /// Declaration order, fail-fast.
    #[default]
    Serial,
    /// Concurrent; first error in declaration order wins and cancels the
    /// other branches.
    Parallel,
}

impl DepMode {
    /// Parse the `--dep-mode` value.
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        match raw {
            "serial" => Ok(Self::Serial),
            "parallel" => Ok(Self::Parallel),
            _ => Err(format!("dep-mode must be serial or parallel, got '{raw}'")),
        }
    }
}

/// Retry backoff: the wait before the k-th re-run is
/// `initial * multiplier^(k-1)`. A zero `initial` disables backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// First delay; zero disables backoff.
    pub initial: Duration,
    /// Growth factor across iterations.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

impl Backoff {
    /// The delay before re-run number `k` (1-based). Zero when backoff is
    /// disabled.
    #[must_use]
    pub fn delay(&self, k: u32) -> Duration {
        if self.initial.is_zero() {
            return Duration::ZERO;
        }
        self.initial
            .mul_f64(self.multiplier.powi(k.saturating_sub(1) as i32))
    }
}

/// Execution configuration carried by a target description.
#[derive(Debug, Clone, Default)]
pub struct RunConfig {
    /// Ordered dependencies, executed before the body.
    pub deps: Vec<Arc<TargetSpec>>,
    /// Serial or parallel dependency execution.
    pub dep_mode: DepMode,
    /// Per-invocation timeout; zero means none.
    pub timeout: Duration,
    /// Repetition count; zero means once.
    pub times: u32,
    /// Continue iterating (and let the chain continue) on failure.
    pub retry: bool,
    /// Delay between retry iterations.
    pub backoff: Backoff,
    /// Glob patterns that re-trigger the target on change.
    pub watch_patterns: Vec<String>,
    /// Glob patterns feeding the content fingerprint.
    pub cache_patterns: Vec<String>,
    /// Ignore watch patterns even when set.
    pub watch_disabled: bool,
    /// Ignore cache patterns even when set.
    pub cache_disabled: bool,
}

/// A target description: the input record the engine consumes.
#[derive(Debug)]
pub struct TargetSpec {
    name: String,
    description: String,
    body: Body,
    config: RunConfig,
    source_package: String,
    source_file: String,
}

impl TargetSpec {
    /// Start building a target with the given CLI name.
    #[must_use]
    pub fn builder(name: &str) -> TargetBuilder {
        TargetBuilder {
            name: name.to_string(),
            description: String::new(),
            body: Body::None,
            config: RunConfig::default(),
            source_package: String::new(),
            source_file: String::new(),
        }
    }

    /// Stable CLI identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The body.
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Ordered dependencies.
    #[must_use]
    pub fn deps(&self) -> &[Arc<TargetSpec>] {
        &self.config.deps
    }

    /// Dependency execution mode.
    #[must_use]
    pub fn dep_mode(&self) -> DepMode {
        self.config.dep_mode
    }

    /// Execution configuration.
    #[must_use]
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Origin package; empty for local targets.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source_package
    }

    /// Declaring source file, when known.
    #[must_use]
    pub fn source_file(&self) -> &str {
        &self.source_file
    }
}

/// Builder for [`TargetSpec`].
pub struct TargetBuilder {
    name: String,
    description: String,
    body: Body,
    config: RunConfig,
    source_package: String,
    source_file: String,
}

impl TargetBuilder {
    /// Set the human description.
    #[must_use]
    pub fn description(mut self, d: &str) -> Self {
        self.description = d.to_string();
        self
    }

    /// Use a shell-template body.
    #[must_use]
    pub fn shell(mut self, template: &str) -> Self {
        self.body = Body::Shell(template.to_string());
        self
    }

    /// Use a paramless function body.
    #[must_use]
    pub fn run(mut self, f: impl Fn() -> FnResult + Send + Sync + 'static) -> Self {
        self.body = Body::Func(FuncBody {
            func: TargetFn::Plain(Arc::new(f)),
            params: Vec::new(),
            meta_hook: None,
        });
        self
    }

    /// Use a context-taking function body.
    #[must_use]
    pub fn run_ctx(mut self, f: impl Fn(&ExecContext) -> FnResult + Send + Sync + 'static) -> Self {
        self.body = Body::Func(FuncBody {
            func: TargetFn::Ctx(Arc::new(f)),
            params: Vec::new(),
            meta_hook: None,
        });
        self
    }

    /// Use a params-taking function body with its schema.
    #[must_use]
    pub fn run_params(
        mut self,
        params: Vec<ParamDecl>,
        f: impl Fn(&ParamValues) -> FnResult + Send + Sync + 'static,
    ) -> Self {
        self.body = Body::Func(FuncBody {
            func: TargetFn::Params(Arc::new(f)),
            params,
            meta_hook: None,
        });
        self
    }

    /// Use a context-and-params function body with its schema.
    #[must_use]
    pub fn run_ctx_params(
        mut self,
        params: Vec<ParamDecl>,
        f: impl Fn(&ExecContext, &ParamValues) -> FnResult + Send + Sync + 'static,
    ) -> Self {
        self.body = Body::Func(FuncBody {
            func: TargetFn::CtxParams(Arc::new(f)),
            params,
            meta_hook: None,
        });
        self
    }

    /// Use an explicit function body (for collaborator layers that build
    /// [`FuncBody`] values themselves).
    #[must_use]
    pub fn func(mut self, body: FuncBody) -> Self {
        self.body = Body::Func(body);
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn dep(mut self, dep: &Arc<TargetSpec>) -> Self {
        self.config.deps.push(Arc::clone(dep));
        self
    }

    /// Set the dependency mode.
    #[must_use]
    pub fn dep_mode(mut self, mode: DepMode) -> Self {
        self.config.dep_mode = mode;
        self
    }

    /// Set the per-invocation timeout.
    #[must_use]
    pub fn timeout(mut self, d: Duration) -> Self {
        self.config.timeout = d;
        self
    }

    /// Set the repetition count.
    #[must_use]
    pub fn times(mut self, n: u32) -> Self {
        self.config.times = n;
        self
    }

    /// Continue on failure.
    #[must_use]
    pub fn retry(mut self) -> Self {
        self.config.retry = true;
        self
    }

    /// Set retry backoff.
    #[must_use]
    pub fn backoff(mut self, initial: Duration, multiplier: f64) -> Self {
        self.config.backoff = Backoff {
            initial,
            multiplier,
        };
        self
    }

    /// Add watch patterns.
    #[must_use]
    pub fn watch(mut self, patterns: &[&str]) -> Self {
        self.config
            .watch_patterns
            .extend(patterns.iter().map(ToString::to_string));
        self
    }

    /// Add cache patterns.
    #[must_use]
    pub fn cache(mut self, patterns: &[&str]) -> Self {
        self.config
            .cache_patterns
            .extend(patterns.iter().map(ToString::to_string));
        self
    }

    /// Disable watching even when patterns are set.
    #[must_use]
    pub fn no_watch(mut self) -> Self {
        self.config.watch_disabled = true;
        self
    }

    /// Disable caching even when patterns are set.
    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.config.cache_disabled = true;
        self
    }

    /// Set the origin package explicitly.
    #[must_use]
    pub fn source(mut self, package: &str) -> Self {
        self.source_package = package.to_string();
        self
    }

    /// Set the declaring source file.
    #[must_use]
    pub fn source_file(mut self, file: &str) -> Self {
        self.source_file = file.to_string();
        self
    }

    /// Validate and build the description.
    ///
    /// The name must match `^[a-z][a-z0-9-]*$`. Body well-typedness
    /// (function shape vs schema) is validated when the command tree is
    /// built.
    pub fn build(self) -> Result<Arc<TargetSpec>> {
        if !NAME_PATTERN.is_match(&self.name) {
            return Err(TargError::InvalidArgument {
                name: "name".to_string(),
                reason: format!(
                    "'{}' is not a valid target name (want kebab-case: ^[a-z][a-z0-9-]*$)",
                    self.name
                ),
            });
        }
        Ok(Arc::new(TargetSpec {
            name: self.name,
            description: self.description,
            body: self.body,
            config: self.config,
            source_package: self.source_package,
            source_file: self.source_file,
        }))
    }
}

/// A named container of targets and groups, forming a subcommand
/// namespace.
#[derive(Debug)]
pub struct GroupSpec {
    name: String,
    members: Vec<Member>,
    source_package: String,
}

impl GroupSpec {
    /// Create a group. Name validity is checked at tree build along with
    /// the rest of the structure.
    #[must_use]
    pub fn new(name: &str, members: Vec<Member>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            members,
            source_package: String::new(),
        })
    }

    /// Create a group with an explicit origin package.
    #[must_use]
    pub fn with_source(name: &str, members: Vec<Member>, source: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            members,
            source_package: source.to_string(),
        })
    }

    /// Group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered members.
    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Origin package; empty for local groups.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source_package
    }
}

/// A registrable entry: a target or a group.
#[derive(Debug, Clone)]
pub enum Member {
    /// A target description.
    Target(Arc<TargetSpec>),
    /// A nested group.
    Group(Arc<GroupSpec>),
}

impl Member {
    /// The entry's CLI name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Target(t) => t.name(),
            Self::Group(g) => g.name(),
        }
    }

    /// The entry's declared origin package.
    #[must_use]
    pub fn source(&self) -> &str {
        match self {
            Self::Target(t) => t.source(),
            Self::Group(g) => g.source(),
        }
    }
}

impl From<Arc<TargetSpec>> for Member {
    fn from(t: Arc<TargetSpec>) -> Self {
        Self::Target(t)
    }
}

impl From<Arc<GroupSpec>> for Member {
    fn from(g: Arc<GroupSpec>) -> Self {
        Self::Group(g)
    }
}
