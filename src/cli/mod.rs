//! Top-level driver.
//!
//! Parses the run-level flags off the front of argv, resolves the
//! registry, builds the command tree, and dispatches: completion and
//! machine-readable listing for the reserved subcommands, help when
//! requested at any node, otherwise the chain interpreter under a tokio
//! runtime with ctrl-c wired to the root cancellation. Errors are printed
//! to stderr and translated to the exit code policy (1 unless a target
//! propagated an explicit code).

pub mod complete;
pub mod help;
pub mod list;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::chain;
use crate::env::{Environment, OsEnvironment};
use crate::error::{Result, TargError};
use crate::exec::cache::FingerprintStore;
use crate::exec::shell::ShellRunner;
use crate::exec::watch::Watcher;
use crate::exec::{Executor, Overrides};
use crate::params::parse_duration;
use crate::registry::{self, Registry, Resolution};
use crate::target::{Backoff, DepMode};
use crate::tree::{CommandTree, NodeId};

/// Reserved subcommand for tab-completion candidates.
const COMPLETE_SUBCOMMAND: &str = "__complete";
/// Reserved subcommand for the machine-readable listing.
const LIST_SUBCOMMAND: &str = "__list";

/// Run against the process environment and the process-wide registry.
/// This is the whole `main` of a consumer binary.
#[must_use]
pub fn run() -> i32 {
    let env: Arc<dyn Environment> = Arc::new(OsEnvironment);
    init_logging(env.as_ref());
    match registry::resolve() {
        Ok(resolution) => Driver::new(env).run(&resolution),
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

/// Run with an explicit environment and registry (tests and embedders).
#[must_use]
pub fn run_with(env: Arc<dyn Environment>, registry: &mut Registry) -> i32 {
    match registry.resolve() {
        Ok(resolution) => Driver::new(env).run(&resolution),
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

/// The driver, parameterized over the execution collaborators.
pub struct Driver {
    env: Arc<dyn Environment>,
    shell: Option<Arc<dyn ShellRunner>>,
    watcher: Option<Arc<dyn Watcher>>,
    store: Option<Arc<dyn FingerprintStore>>,
}

/// The run-level flags parsed off the front of argv.
#[derive(Debug, Default)]
struct TopFlags {
    help: bool,
    completion: Option<String>,
    source: Option<String>,
    timeout: Option<Duration>,
    overrides: Overrides,
}

impl Driver {
    /// Driver with the default collaborators.
    #[must_use]
    pub fn new(env: Arc<dyn Environment>) -> Self {
        Self {
            env,
            shell: None,
            watcher: None,
            store: None,
        }
    }

    /// Replace the shell runner.
    #[must_use]
    pub fn with_shell(mut self, shell: Arc<dyn ShellRunner>) -> Self {
        self.shell = Some(shell);
        self
    }

    /// Replace the watcher.
    #[must_use]
    pub fn with_watcher(mut self, watcher: Arc<dyn Watcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Replace the fingerprint store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn FingerprintStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Run the resolved registry against argv; returns the exit code.
    #[must_use]
    pub fn run(self, resolution: &Resolution) -> i32 {
        match self.dispatch(resolution) {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {e}");
                if e.is_usage() {
                    let bin = self.env.binary_name();
                    eprintln!("{}", help::usage_hint(&bin, error_node(&e)));
                }
                e.exit_code()
            }
        }
    }

    fn dispatch(&self, resolution: &Resolution) -> Result<i32> {
        let args = self.env.args();
        let mut rest: Vec<String> = args.iter().skip(1).cloned().collect();
        let mut top = parse_top_flags(&mut rest)?;
        strip_help_anywhere(&mut rest, &mut top);

        let tree = Arc::new(CommandTree::build(&resolution.entries)?);

        if let Some(shell) = &top.completion {
            let bin = self.env.binary_name();
            let script = complete::completion_script(shell, &bin).ok_or_else(|| {
                TargError::InvalidValue {
                    name: "--completion".to_string(),
                    value: shell.clone(),
                    reason: "supported shells: bash, zsh".to_string(),
                }
            })?;
            self.print(&script);
            return Ok(0);
        }

        match rest.first().map(String::as_str) {
            Some(COMPLETE_SUBCOMMAND) => {
                let words = &rest[1..];
                let lines = complete::candidates(&tree, words).join("\n");
                if !lines.is_empty() {
                    self.print(&format!("{lines}\n"));
                }
                return Ok(0);
            }
            Some(LIST_SUBCOMMAND) => {
                self.print(&format!("{}\n", list::render(&tree)));
                return Ok(0);
            }
            _ => {}
        }

        if top.help || rest.is_empty() {
            let text = match walk_names(&tree, &rest) {
                Some(id) => help::node_help(&tree, id, self.env.as_ref(), top.source.as_deref()),
                None => help::root_help(&tree, self.env.as_ref(), resolution),
            };
            self.print(&text);
            return Ok(0);
        }

        self.execute(tree, rest, top)
    }

    /// Run the chain under a fresh runtime.
    fn execute(&self, tree: Arc<CommandTree>, rest: Vec<String>, top: TopFlags) -> Result<i32> {
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|e| TargError::io("failed to start the async runtime", e))?;

        let mut executor = Executor::new(Arc::clone(&tree), Arc::clone(&self.env), top.overrides);
        if let Some(shell) = &self.shell {
            executor = executor.with_shell(Arc::clone(shell));
        }
        if let Some(watcher) = &self.watcher {
            executor = executor.with_watcher(Arc::clone(watcher));
        }
        if let Some(store) = &self.store {
            executor = executor.with_store(Arc::clone(store));
        }

        if self.env.supports_signals() {
            let ctx = executor.context().clone();
            runtime.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    debug!("interrupt received; cancelling");
                    ctx.cancel();
                }
            });
        }

        let outcome = runtime.block_on(async {
            let walk = chain::run_chain(&tree, &rest, self.env.as_ref(), &executor);
            match top.timeout {
                Some(limit) if !limit.is_zero() => {
                    match tokio::time::timeout(limit, walk).await {
                        Ok(result) => result,
                        Err(_) => {
                            executor.context().cancel();
                            Err(TargError::DeadlineExceeded {
                                target: "run".to_string(),
                                timeout: limit,
                            })
                        }
                    }
                }
                _ => walk.await,
            }
        })?;

        if let Some(id) = outcome.trailing_group {
            self.print(&help::node_help(
                &tree,
                id,
                self.env.as_ref(),
                top.source.as_deref(),
            ));
        }
        Ok(0)
    }

    fn print(&self, text: &str) {
        use std::io::Write;
        let mut out = self.env.stdout();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

/// Initialize tracing to stderr, honoring the `TARG_LOG` filter.
pub fn init_logging(env: &dyn Environment) {
    use tracing_subscriber::EnvFilter;
    let filter = env
        .getenv("TARG_LOG")
        .filter(|v| !v.is_empty())
        .map_or_else(|| EnvFilter::new("warn"), EnvFilter::new);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Consume run-level flags from the front of argv.
fn parse_top_flags(rest: &mut Vec<String>) -> Result<TopFlags> {
    let mut top = TopFlags::default();
    while let Some(token) = rest.first().cloned() {
        match token.as_str() {
            "--help" | "-h" => {
                top.help = true;
                rest.remove(0);
            }
            "--completion" => {
                rest.remove(0);
                let shell = match rest.first() {
                    Some(next) if !next.starts_with('-') => rest.remove(0),
                    _ => "bash".to_string(),
                };
                top.completion = Some(shell);
            }
            "--source" => {
                rest.remove(0);
                top.source = Some(take_value(rest, "--source")?);
            }
            "--timeout" => {
                rest.remove(0);
                let raw = take_value(rest, "--timeout")?;
                top.timeout = Some(parse_duration(&raw).map_err(|reason| {
                    TargError::InvalidValue {
                        name: "--timeout".to_string(),
                        value: raw,
                        reason,
                    }
                })?);
            }
            "--parallel" | "-p" => {
                top.overrides.parallel = true;
                rest.remove(0);
            }
            "--times" => {
                rest.remove(0);
                let raw = take_value(rest, "--times")?;
                top.overrides.times =
                    Some(raw.parse().map_err(|_| TargError::InvalidValue {
                        name: "--times".to_string(),
                        value: raw,
                        reason: "expected a positive integer".to_string(),
                    })?);
            }
            "--retry" => {
                top.overrides.retry = true;
                rest.remove(0);
            }
            "--backoff" => {
                rest.remove(0);
                let raw = take_value(rest, "--backoff")?;
                top.overrides.backoff = Some(parse_backoff(&raw)?);
            }
            "--watch" => {
                rest.remove(0);
                top.overrides.watch_patterns.push(take_value(rest, "--watch")?);
            }
            "--cache" => {
                rest.remove(0);
                top.overrides.cache_patterns.push(take_value(rest, "--cache")?);
            }
            "--while" => {
                rest.remove(0);
                top.overrides.while_cmd = Some(take_value(rest, "--while")?);
            }
            "--dep-mode" => {
                rest.remove(0);
                let raw = take_value(rest, "--dep-mode")?;
                top.overrides.dep_mode =
                    Some(DepMode::parse(&raw).map_err(|reason| TargError::InvalidValue {
                        name: "--dep-mode".to_string(),
                        value: raw,
                        reason,
                    })?);
            }
            _ => break,
        }
    }
    Ok(top)
}

fn take_value(rest: &mut Vec<String>, flag: &str) -> Result<String> {
    if rest.is_empty() || rest[0].starts_with("--") {
        return Err(TargError::InvalidValue {
            name: flag.to_string(),
            value: String::new(),
            reason: "expected a value".to_string(),
        });
    }
    Ok(rest.remove(0))
}

/// `--backoff <duration,multiplier>`, e.g. `1s,2.0`.
fn parse_backoff(raw: &str) -> Result<Backoff> {
    let err = |reason: String| TargError::InvalidValue {
        name: "--backoff".to_string(),
        value: raw.to_string(),
        reason,
    };
    let (dur, mult) = raw
        .split_once(',')
        .ok_or_else(|| err("expected <duration>,<multiplier>".to_string()))?;
    let initial = parse_duration(dur.trim()).map_err(&err)?;
    let multiplier: f64 = mult
        .trim()
        .parse()
        .map_err(|_| err("multiplier must be a number".to_string()))?;
    Ok(Backoff {
        initial,
        multiplier,
    })
}

/// A help token anywhere in the chain requests help for the node named
/// by the tokens before it.
fn strip_help_anywhere(rest: &mut Vec<String>, top: &mut TopFlags) {
    if let Some(pos) = rest.iter().position(|t| t == "--help" || t == "-h") {
        rest.truncate(pos);
        top.help = true;
    }
}

/// Walk name tokens (ignoring flags and values) to the deepest matching
/// node, for help rendering.
fn walk_names(tree: &CommandTree, tokens: &[String]) -> Option<NodeId> {
    let mut current: Option<NodeId> = None;
    for token in tokens {
        if token == chain::RESET_TOKEN {
            current = None;
            continue;
        }
        if token.starts_with('-') {
            continue;
        }
        let next = match current {
            None => tree.find_root(token),
            Some(id) => tree
                .find_child(id, token)
                .or_else(|| tree.find_sibling(id, token)),
        };
        match next {
            Some(id) => current = Some(id),
            None => break,
        }
    }
    current
}

/// The node path embedded in a usage error, for the help hint.
fn error_node(err: &TargError) -> &str {
    match err {
        TargError::UnknownFlag { node, .. } | TargError::MissingPositional { node, .. } => node,
        _ => "",
    }
}
