//! Execution orchestrator.
//!
//! Runs a selected command node: dependencies first (serial or parallel,
//! deduplicated within one chain step), then the body under its wrapper
//! stack — watch, cache, repetition with retry/backoff, timeout. A single
//! cancellation context threads through every path; parallel fan-outs
//! derive per-branch children and the first failing branch cancels its
//! siblings. All branch output goes through the line-atomic multiplexer.

pub mod cache;
pub mod mux;
pub mod shell;
pub mod watch;

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::StepRunner;
use crate::env::Environment;
use crate::error::{Result, TargError};
use crate::params::ParamValues;
use crate::target::{Backoff, DepMode, RunConfig, TargetFn, TargetSpec};
use crate::tree::{self, bind, CommandTree, NodeId, NodeKind, NodeSchema};

use cache::{FingerprintStore, JsonFileStore, MemoryStore};
use mux::{BranchPrinter, MuxSender, OutputMux};
use shell::{ShRunner, ShellRunner};
use watch::{NotifyWatcher, WatchCallback, WatchOptions, Watcher};

/// Poll interval between `--while` rounds.
const WHILE_POLL: Duration = Duration::from_millis(500);

/// Branch metadata threaded through the cancellation carrier so nested
/// calls observe and share the parallel group's printer.
pub struct ExecInfo {
    /// True inside a parallel fan-out.
    pub parallel: bool,
    /// The branch name.
    pub name: String,
    /// Widest branch name in the group (prefix padding).
    pub max_name_len: usize,
    /// The branch's view of the group multiplexer.
    pub printer: BranchPrinter,
}

/// The cancellation carrier: a cancel token, optional parallel-branch
/// info, and the output stream for direct (non-parallel) printing.
#[derive(Clone)]
pub struct ExecContext {
    cancel: CancellationToken,
    info: Option<Arc<ExecInfo>>,
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl ExecContext {
    /// Root context writing to the given stream.
    #[must_use]
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            info: None,
            out: Arc::new(Mutex::new(out)),
        }
    }

    /// Derive a child context; cancelling the parent cancels the child.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            info: self.info.clone(),
            out: Arc::clone(&self.out),
        }
    }

    /// Derive a branch context for a parallel group member.
    pub(crate) fn branch(&self, name: &str, max_name_len: usize, sender: MuxSender) -> Self {
        let printer = BranchPrinter::new(sender, name, max_name_len);
        Self {
            cancel: self.cancel.child_token(),
            info: Some(Arc::new(ExecInfo {
                parallel: true,
                name: name.to_string(),
                max_name_len,
                printer,
            })),
            out: Arc::clone(&self.out),
        }
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve when cancellation is requested.
    pub async fn cancelled_wait(&self) {
        self.cancel.cancelled().await;
    }

    /// Branch metadata, inside a parallel fan-out.
    #[must_use]
    pub fn info(&self) -> Option<&ExecInfo> {
        self.info.as_deref()
    }

    /// The branch printer, inside a parallel fan-out.
    #[must_use]
    pub fn printer(&self) -> Option<&BranchPrinter> {
        self.info.as_deref().map(|i| &i.printer)
    }

    /// Print one line of target output: through the group multiplexer in
    /// a parallel branch, directly to the output stream otherwise.
    /// Callable from function targets (they run on the blocking pool).
    pub fn println(&self, line: &str) {
        match self.printer() {
            Some(printer) => printer.line_blocking(line),
            None => {
                let mut out = self.out.lock();
                let _ = writeln!(out, "{line}");
                let _ = out.flush();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn root_for_test() -> Self {
        Self::new(Box::new(std::io::sink()))
    }
}

/// Per-invocation execution overrides from the top-level flags, merged
/// over each step's own configuration.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--times <n>`.
    pub times: Option<u32>,
    /// `--retry`.
    pub retry: bool,
    /// `--backoff <duration,multiplier>`.
    pub backoff: Option<Backoff>,
    /// `--watch <pattern>` (repeatable; replaces the step's patterns).
    pub watch_patterns: Vec<String>,
    /// `--cache <pattern>` (repeatable; replaces the step's patterns).
    pub cache_patterns: Vec<String>,
    /// `--dep-mode <serial|parallel>`.
    pub dep_mode: Option<DepMode>,
    /// `--parallel`: run the chain's steps as one parallel group.
    pub parallel: bool,
    /// `--while <cmd>`: re-run each step while the probe succeeds.
    pub while_cmd: Option<String>,
}

/// What one body invocation needs, independent of whether it came from a
/// command node or a bare dependency spec.
#[derive(Clone)]
struct Unit {
    name: String,
    /// Stable identity for cache keys (the command path for nodes).
    key: String,
    kind: UnitKind,
    config: RunConfig,
}

#[derive(Clone)]
enum UnitKind {
    Func(TargetFn, ParamValues),
    Shell(String, ParamValues),
    NoOp,
}

/// Within one chain step, each target description runs at most once;
/// concurrent branches wanting the same dependency await its first run.
#[derive(Clone, Default)]
struct StepDedup(Arc<Mutex<HashMap<usize, Arc<OnceCell<()>>>>>);

impl StepDedup {
    fn cell(&self, key: usize) -> Arc<OnceCell<()>> {
        Arc::clone(self.0.lock().entry(key).or_default())
    }
}

/// The execution orchestrator. Cheap to clone; parallel branches run on
/// clones so spawned tasks own everything they touch.
#[derive(Clone)]
pub struct Executor {
    tree: Arc<CommandTree>,
    env: Arc<dyn Environment>,
    shell: Arc<dyn ShellRunner>,
    watcher: Arc<dyn Watcher>,
    store: Arc<dyn FingerprintStore>,
    overrides: Arc<Overrides>,
    root: ExecContext,
}

impl Executor {
    /// Orchestrator with the default collaborators: `sh -c` runner,
    /// notify-based watcher, JSON fingerprint store in the user cache dir
    /// (in-memory when no cache dir resolves).
    #[must_use]
    pub fn new(tree: Arc<CommandTree>, env: Arc<dyn Environment>, overrides: Overrides) -> Self {
        let store: Arc<dyn FingerprintStore> = match JsonFileStore::default_location() {
            Some(path) => Arc::new(JsonFileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        };
        let root = ExecContext::new(env.stdout());
        Self {
            tree,
            env,
            shell: Arc::new(ShRunner),
            watcher: Arc::new(NotifyWatcher),
            store,
            overrides: Arc::new(overrides),
            root,
        }
    }

    /// Replace the shell runner.
    #[must_use]
    pub fn with_shell(mut self, shell: Arc<dyn ShellRunner>) -> Self {
        self.shell = shell;
        self
    }

    /// Replace the watcher.
    #[must_use]
    pub fn with_watcher(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.watcher = watcher;
        self
    }

    /// Replace the fingerprint store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn FingerprintStore>) -> Self {
        self.store = store;
        self
    }

    /// The root cancellation context (the driver cancels it on ctrl-c).
    #[must_use]
    pub fn context(&self) -> &ExecContext {
        &self.root
    }

    fn unit_from_node(&self, id: NodeId, values: ParamValues) -> Unit {
        let node = self.tree.node(id);
        let kind = match &node.kind {
            NodeKind::Func(f) => UnitKind::Func(f.clone(), values),
            NodeKind::Shell { template, .. } => UnitKind::Shell(template.clone(), values),
            NodeKind::DepsOnly | NodeKind::Group => UnitKind::NoOp,
        };
        Unit {
            name: node.name.clone(),
            key: self.tree.path(id),
            kind,
            config: node.config.clone(),
        }
    }

    /// Build a unit for a bare dependency spec: its parameters bind from
    /// environment variables and defaults only (deps get no argv).
    fn unit_from_spec(&self, spec: &Arc<TargetSpec>) -> Result<Unit> {
        use crate::target::Body;
        let (kind, _params) = match spec.body() {
            Body::Func(body) => {
                let params = tree::function_schema(spec.name(), body)?;
                let values = self.bind_defaults(spec.name(), &params)?;
                (UnitKind::Func(body.func.clone(), values), params)
            }
            Body::Shell(template) => {
                let vars = tree::extract_vars(template);
                let params = tree::shell_schema(&vars);
                let values = self.bind_defaults(spec.name(), &params)?;
                (UnitKind::Shell(template.clone(), values), params)
            }
            Body::None => (UnitKind::NoOp, Vec::new()),
        };
        Ok(Unit {
            name: spec.name().to_string(),
            key: spec.name().to_string(),
            kind,
            config: spec.config().clone(),
        })
    }

    fn bind_defaults(
        &self,
        path: &str,
        params: &[crate::params::ParamDecl],
    ) -> Result<ParamValues> {
        let schema = NodeSchema {
            params,
            inherited: Vec::new(),
            path: path.to_string(),
        };
        let mut visited = std::collections::HashSet::new();
        Ok(bind(&schema, &[], self.env.as_ref(), &mut visited)?.values)
    }

    fn effective_config(&self, cfg: &RunConfig, use_overrides: bool) -> RunConfig {
        let mut out = cfg.clone();
        if !use_overrides {
            return out;
        }
        let ov = &self.overrides;
        if let Some(times) = ov.times {
            out.times = times;
        }
        if ov.retry {
            out.retry = true;
        }
        if let Some(backoff) = ov.backoff {
            out.backoff = backoff;
        }
        if !ov.watch_patterns.is_empty() {
            out.watch_patterns = ov.watch_patterns.clone();
            out.watch_disabled = false;
        }
        if !ov.cache_patterns.is_empty() {
            out.cache_patterns = ov.cache_patterns.clone();
            out.cache_disabled = false;
        }
        if let Some(mode) = ov.dep_mode {
            out.dep_mode = mode;
        }
        out
    }

    /// Run one dependency spec at most once per chain step.
    fn run_spec<'a>(
        &'a self,
        ctx: &'a ExecContext,
        spec: &'a Arc<TargetSpec>,
        dedup: &'a StepDedup,
        stack: &'a [usize],
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = Arc::as_ptr(spec) as usize;
            if stack.contains(&key) {
                return Err(TargError::InvalidArgument {
                    name: spec.name().to_string(),
                    reason: "dependency cycle".to_string(),
                });
            }
            let cell = dedup.cell(key);
            cell.get_or_try_init(|| async {
                let mut stack = stack.to_vec();
                stack.push(key);
                let unit = self.unit_from_spec(spec)?;
                self.run_deps(ctx, spec.config(), false, dedup, &stack).await?;
                self.run_unit(ctx, &unit, false).await
            })
            .await
            .map(|_| ())
        })
    }

    /// Run a target's dependencies per the (possibly overridden) mode.
    async fn run_deps(
        &self,
        ctx: &ExecContext,
        cfg: &RunConfig,
        use_overrides: bool,
        dedup: &StepDedup,
        stack: &[usize],
    ) -> Result<()> {
        if cfg.deps.is_empty() {
            return Ok(());
        }
        let mode = if use_overrides {
            self.overrides.dep_mode.unwrap_or(cfg.dep_mode)
        } else {
            cfg.dep_mode
        };
        match mode {
            DepMode::Serial => {
                for dep in &cfg.deps {
                    self.run_spec(ctx, dep, dedup, stack).await?;
                }
                Ok(())
            }
            DepMode::Parallel => self.run_parallel_specs(ctx, &cfg.deps, dedup, stack).await,
        }
    }

    /// Fan dependency specs out as parallel branches.
    async fn run_parallel_specs(
        &self,
        ctx: &ExecContext,
        deps: &[Arc<TargetSpec>],
        dedup: &StepDedup,
        stack: &[usize],
    ) -> Result<()> {
        let max_name_len = deps.iter().map(|d| d.name().len()).max().unwrap_or(0);

        // Nested groups share the enclosing multiplexer; the outermost
        // group owns one over the environment's output stream.
        let (sender, owned_mux) = match ctx.printer() {
            Some(printer) => (printer.sender(), None),
            None => {
                let m = OutputMux::new(self.env.stdout(), mux::DEFAULT_CAPACITY);
                (m.sender(), Some(m))
            }
        };

        let group = ctx.child();
        let mut handles = Vec::with_capacity(deps.len());
        for dep in deps {
            let exec = self.clone();
            let spec = Arc::clone(dep);
            let dedup = dedup.clone();
            let stack = stack.to_vec();
            let branch_ctx = group.branch(spec.name(), max_name_len, sender.clone());
            let group_cancel = group.clone();
            handles.push(tokio::spawn(async move {
                let result = exec.run_spec(&branch_ctx, &spec, &dedup, &stack).await;
                if result.is_err() {
                    group_cancel.cancel();
                }
                result
            }));
        }
        drop(sender);

        let result = join_branches(handles).await;
        if let Some(m) = owned_mux {
            m.close().await;
        }
        result
    }

    /// Run a parallel group of chain steps (`--parallel`).
    async fn run_parallel_steps(&self, steps: Vec<(NodeId, ParamValues)>) -> Result<()> {
        let max_name_len = steps
            .iter()
            .map(|(id, _)| self.tree.node(*id).name.len())
            .max()
            .unwrap_or(0);

        let (sender, owned_mux) = match self.root.printer() {
            Some(printer) => (printer.sender(), None),
            None => {
                let m = OutputMux::new(self.env.stdout(), mux::DEFAULT_CAPACITY);
                (m.sender(), Some(m))
            }
        };

        let group = self.root.child();
        let mut handles = Vec::with_capacity(steps.len());
        for (id, values) in steps {
            let exec = self.clone();
            let name = self.tree.node(id).name.clone();
            let branch_ctx = group.branch(&name, max_name_len, sender.clone());
            let group_cancel = group.clone();
            handles.push(tokio::spawn(async move {
                let result = exec.run_step(&branch_ctx, id, values).await;
                if result.is_err() {
                    group_cancel.cancel();
                }
                result
            }));
        }
        drop(sender);

        let result = join_branches(handles).await;
        if let Some(m) = owned_mux {
            m.close().await;
        }
        result
    }

    /// One chain step: dependencies, then the body under its wrappers,
    /// with the run overrides applied.
    async fn run_step(&self, ctx: &ExecContext, id: NodeId, values: ParamValues) -> Result<()> {
        let unit = self.unit_from_node(id, values);
        let dedup = StepDedup::default();
        let mut stack = Vec::new();
        if let Some(spec) = &self.tree.node(id).spec {
            stack.push(Arc::as_ptr(spec) as usize);
        }
        self.run_deps(ctx, &unit.config, true, &dedup, &stack).await?;
        self.run_unit(ctx, &unit, true).await
    }

    /// The wrapper stack: while/watch, then cache, then times (with
    /// retry/backoff) around the timed body.
    async fn run_unit(&self, ctx: &ExecContext, unit: &Unit, use_overrides: bool) -> Result<()> {
        let cfg = self.effective_config(&unit.config, use_overrides);
        if use_overrides {
            if let Some(probe) = self.overrides.while_cmd.clone() {
                return self.run_while(ctx, &cfg, unit, &probe).await;
            }
        }
        if !cfg.watch_patterns.is_empty() && !cfg.watch_disabled {
            return self.run_watch(ctx, &cfg, unit).await;
        }
        self.run_cached(ctx, &cfg, unit).await
    }

    /// Watch loop: run once, then re-run the cache→body stack per change
    /// set. Run failures are logged and the loop keeps watching; only
    /// cancellation (or a watcher failure) ends it.
    async fn run_watch(&self, ctx: &ExecContext, cfg: &RunConfig, unit: &Unit) -> Result<()> {
        info!(task = %unit.name, patterns = ?cfg.watch_patterns, "watching for changes");
        if let Err(e) = self.run_cached(ctx, cfg, unit).await {
            tracing::error!(task = %unit.name, error = %e, "target failed; still watching");
        }

        let root = self.env.getwd().map_err(|e| {
            TargError::io("failed to resolve the working directory", e)
        })?;
        let callback: WatchCallback<'_> = Box::new(move |changes| {
            Box::pin(async move {
                info!(task = %unit.name, files = changes.paths.len(), "changes detected; re-running");
                if let Err(e) = self.run_cached(ctx, cfg, unit).await {
                    tracing::error!(task = %unit.name, error = %e, "target failed; still watching");
                }
                Ok(())
            })
        });
        self.watcher
            .watch(ctx, &root, &cfg.watch_patterns, WatchOptions::default(), callback)
            .await
    }

    /// `--while` loop: probe, run, sleep, repeat; a failing probe ends
    /// the loop successfully.
    async fn run_while(
        &self,
        ctx: &ExecContext,
        cfg: &RunConfig,
        unit: &Unit,
        probe: &str,
    ) -> Result<()> {
        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }
            if self.shell.run(ctx, probe).await.is_err() {
                debug!(task = %unit.name, probe, "while-probe failed; stopping");
                return Ok(());
            }
            self.run_cached(ctx, cfg, unit).await?;
            tokio::select! {
                () = ctx.cancelled_wait() => return Ok(()),
                () = tokio::time::sleep(WHILE_POLL) => {}
            }
        }
    }

    /// Fingerprint gate around the times/retry/timeout stack. Store
    /// failures are logged and treated as a miss.
    async fn run_cached(&self, ctx: &ExecContext, cfg: &RunConfig, unit: &Unit) -> Result<()> {
        if cfg.cache_patterns.is_empty() || cfg.cache_disabled {
            return self.run_times(ctx, cfg, unit).await;
        }

        let root = match self.env.getwd() {
            Ok(root) => root,
            Err(e) => {
                warn!(task = %unit.name, error = %e, "cannot resolve cwd; cache disabled for this run");
                return self.run_times(ctx, cfg, unit).await;
            }
        };
        let fp = match cache::fingerprint(&root, &unit.key, &cfg.cache_patterns) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(task = %unit.name, error = %e, "fingerprint failed; running anyway");
                return self.run_times(ctx, cfg, unit).await;
            }
        };
        match self.store.lookup(&unit.key) {
            Ok(Some(prev)) if prev == fp => {
                info!(task = %unit.name, "inputs unchanged; skipping");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(task = %unit.name, error = %e, "cache lookup failed; treating as miss"),
        }

        self.run_times(ctx, cfg, unit).await?;
        if let Err(e) = self.store.store(&unit.key, &fp) {
            warn!(task = %unit.name, error = %e, "failed to record fingerprint");
        }
        Ok(())
    }

    /// Repetition with retry/backoff. The aggregate result is the first
    /// failure; without `retry` the first failure also stops iterating.
    async fn run_times(&self, ctx: &ExecContext, cfg: &RunConfig, unit: &Unit) -> Result<()> {
        let rounds = cfg.times.max(1);
        let mut first_err = None;
        for round in 1..=rounds {
            if ctx.is_cancelled() {
                break;
            }
            if round > 1 {
                let delay = cfg.backoff.delay(round - 1);
                if !delay.is_zero() {
                    debug!(task = %unit.name, round, ?delay, "backing off");
                    tokio::select! {
                        () = ctx.cancelled_wait() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
            match self.run_timed(ctx, cfg, unit).await {
                Ok(()) => {}
                Err(e) if cfg.retry => {
                    warn!(task = %unit.name, round, error = %e, "target failed; continuing");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Per-invocation timeout via a derived cancellation.
    async fn run_timed(&self, ctx: &ExecContext, cfg: &RunConfig, unit: &Unit) -> Result<()> {
        if cfg.timeout.is_zero() {
            return self.run_body(ctx, unit).await;
        }
        let child = ctx.child();
        match tokio::time::timeout(cfg.timeout, self.run_body(&child, unit)).await {
            Ok(result) => result,
            Err(_) => {
                child.cancel();
                Err(TargError::DeadlineExceeded {
                    target: unit.name.clone(),
                    timeout: cfg.timeout,
                })
            }
        }
    }

    /// The body itself: function, substituted shell command, or no-op.
    async fn run_body(&self, ctx: &ExecContext, unit: &Unit) -> Result<()> {
        if ctx.is_cancelled() {
            return Ok(());
        }
        match &unit.kind {
            UnitKind::NoOp => Ok(()),
            UnitKind::Shell(template, values) => {
                let command = shell::substitute(template, values);
                debug!(task = %unit.name, %command, "running shell target");
                self.shell.run(ctx, &command).await
            }
            UnitKind::Func(func, values) => {
                debug!(task = %unit.name, "running function target");
                let func = func.clone();
                let fn_ctx = ctx.clone();
                let values = values.clone();
                let joined =
                    tokio::task::spawn_blocking(move || call_target_fn(&func, &fn_ctx, &values))
                        .await;
                match joined {
                    Ok(Ok(())) => Ok(()),
                    // A body returning TargError (e.g. an explicit exit
                    // code) propagates as-is instead of being wrapped.
                    Ok(Err(source)) => Err(match source.downcast::<TargError>() {
                        Ok(err) => *err,
                        Err(source) => TargError::TargetFailed {
                            target: unit.name.clone(),
                            source,
                        },
                    }),
                    Err(join) => Err(TargError::TargetFailed {
                        target: unit.name.clone(),
                        source: Box::new(join),
                    }),
                }
            }
        }
    }
}

impl StepRunner for Executor {
    fn run<'a>(&'a self, id: NodeId, values: ParamValues) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.run_step(&self.root, id, values).await })
    }

    fn continues_after_failure(&self, id: NodeId) -> bool {
        self.tree.node(id).config.retry || self.overrides.retry
    }

    fn wants_group(&self) -> bool {
        self.overrides.parallel
    }

    fn run_group<'a>(&'a self, steps: Vec<(NodeId, ParamValues)>) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.run_parallel_steps(steps))
    }
}

/// Dispatch onto the accepted function shapes.
fn call_target_fn(
    func: &TargetFn,
    ctx: &ExecContext,
    values: &ParamValues,
) -> crate::target::FnResult {
    match func {
        TargetFn::Plain(f) => f(),
        TargetFn::Ctx(f) => f(ctx),
        TargetFn::Params(f) => f(values),
        TargetFn::CtxParams(f) => f(ctx, values),
        TargetFn::Nil => Err("nil function body".into()),
    }
}

/// Await every branch; the aggregate error is the first failure in
/// declaration order, after all branches have finished or been cancelled.
async fn join_branches(handles: Vec<tokio::task::JoinHandle<Result<()>>>) -> Result<()> {
    let mut first = None;
    for handle in handles {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join) => Err(TargError::TargetFailed {
                target: "parallel branch".to_string(),
                source: Box::new(join),
            }),
        };
        if let Err(e) = outcome {
            if first.is_none() {
                first = Some(e);
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
