//! Chaining interpreter.
//!
//! One argv is a sequence of target invocations: `targ a b ^ c` runs `a`,
//! descends (or moves sideways) to `b`, then resets to the root and runs
//! `c`. Each matched node binds its flags and positionals off the front
//! of the remaining argv; what it leaves behind selects the next node.
//!
//! Command names match case-insensitively (flag binding stays
//! case-sensitive). A name containing `*` is a glob and fans out over the
//! root targets in declaration order; globs never descend.

use std::collections::HashSet;

use futures::future::BoxFuture;

use crate::env::Environment;
use crate::error::{Result, TargError};
use crate::params::ParamValues;
use crate::tree::{bind, CommandTree, NodeId};

/// The argv token that resets the chain to the root.
pub const RESET_TOKEN: &str = "^";

/// Executes one selected node with its bound values. Implemented by the
/// execution orchestrator; tests substitute recorders.
pub trait StepRunner: Send + Sync {
    /// Run the node to completion.
    fn run<'a>(&'a self, id: NodeId, values: ParamValues) -> BoxFuture<'a, Result<()>>;

    /// Whether a failure of this node lets the chain continue (the
    /// target's `retry` setting, merged with the run overrides).
    fn continues_after_failure(&self, id: NodeId) -> bool;

    /// Whether the walk should collect all steps and hand them to
    /// [`StepRunner::run_group`] instead of executing one at a time (the
    /// top-level `--parallel` override).
    fn wants_group(&self) -> bool {
        false
    }

    /// Run the collected steps as one parallel group.
    fn run_group<'a>(
        &'a self,
        steps: Vec<(NodeId, ParamValues)>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for (id, values) in steps {
                self.run(id, values).await?;
            }
            Ok(())
        })
    }
}

/// What the walk produced, for the driver.
#[derive(Debug, Default)]
pub struct ChainOutcome {
    /// Set when the final step was a bare group invocation; the driver
    /// responds by printing that group's help.
    pub trailing_group: Option<NodeId>,
}

/// Walk the argv across the tree, executing each selected node in order.
///
/// The first recorded failure becomes the walk's result; a failing step
/// aborts the chain unless its effective config says to continue.
pub async fn run_chain(
    tree: &CommandTree,
    argv: &[String],
    env: &dyn Environment,
    runner: &dyn StepRunner,
) -> Result<ChainOutcome> {
    let mut rest: Vec<String> = argv.to_vec();
    let mut current: Option<NodeId> = None;
    let mut visited: HashSet<String> = HashSet::new();
    let mut first_error: Option<TargError> = None;
    let mut outcome = ChainOutcome::default();
    let mut collected: Vec<(NodeId, ParamValues)> = Vec::new();

    while !rest.is_empty() || current.is_some() {
        match current {
            None => {
                let token = rest.remove(0);
                if token == RESET_TOKEN {
                    continue;
                }
                if token.contains('*') {
                    run_glob(tree, &token, env, runner, &mut collected, &mut first_error)
                        .await?;
                    continue;
                }
                match tree.find_root(&token) {
                    Some(id) => current = Some(id),
                    None => return Err(unknown_token(&token, None, tree)),
                }
            }
            Some(id) => {
                let schema = tree.schema_for(id);
                let bound = bind(&schema, &rest, env, &mut visited)?;
                rest = bound.remainder;

                // A flag-like leftover means this node's parse failed;
                // the node must not execute.
                if let Some(tail) = rest.first() {
                    if tail.len() > 1 && tail.starts_with('-') && tail != "--" {
                        return Err(unknown_token(tail, Some(id), tree));
                    }
                }

                outcome.trailing_group = tree.node(id).is_group().then_some(id);
                if runner.wants_group() {
                    collected.push((id, bound.values));
                } else {
                    step(runner, id, bound.values, &mut first_error).await?;
                }

                current = None;
                let Some(next) = rest.first().cloned() else {
                    break;
                };
                if next == RESET_TOKEN {
                    rest.remove(0);
                    visited.clear();
                    continue;
                }
                if let Some(sib) = tree.find_sibling(id, &next) {
                    rest.remove(0);
                    current = Some(sib);
                    outcome.trailing_group = None;
                } else if let Some(child) = tree.find_child(id, &next) {
                    rest.remove(0);
                    current = Some(child);
                    outcome.trailing_group = None;
                } else {
                    return Err(unknown_token(&next, Some(id), tree));
                }
            }
        }
    }

    if runner.wants_group() && !collected.is_empty() {
        outcome.trailing_group = None;
        runner.run_group(collected).await?;
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(outcome),
    }
}

/// Execute one step, routing failures through the retry-continue policy.
async fn step(
    runner: &dyn StepRunner,
    id: NodeId,
    values: ParamValues,
    first_error: &mut Option<TargError>,
) -> Result<()> {
    match runner.run(id, values).await {
        Ok(()) => Ok(()),
        Err(err) if runner.continues_after_failure(id) => {
            if first_error.is_none() {
                *first_error = Some(err);
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Fan a glob out over the matching roots, each with a fresh empty argv.
async fn run_glob(
    tree: &CommandTree,
    pattern: &str,
    env: &dyn Environment,
    runner: &dyn StepRunner,
    collected: &mut Vec<(NodeId, ParamValues)>,
    first_error: &mut Option<TargError>,
) -> Result<()> {
    for &id in tree.roots() {
        if !glob_matches(pattern, &tree.node(id).name) {
            continue;
        }
        let schema = tree.schema_for(id);
        let bound = bind(&schema, &[], env, &mut HashSet::new())?;
        if runner.wants_group() {
            collected.push((id, bound.values));
        } else {
            step(runner, id, bound.values, first_error).await?;
        }
    }
    Ok(())
}

/// Name glob semantics: `*` or `**` match everything, `*x*` is substring,
/// `*x` suffix, `x*` prefix, and `a*b` matches prefix-and-suffix.
/// Comparison is case-insensitive, like command-name matching.
#[must_use]
pub fn glob_matches(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let name = name.to_ascii_lowercase();
    if pattern == "*" || pattern == "**" {
        return true;
    }
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(rest), _) if rest.strip_suffix('*').is_some() => {
            name.contains(rest.trim_end_matches('*'))
        }
        (Some(suffix), None) => name.ends_with(suffix),
        (None, Some(prefix)) => match prefix.split_once('*') {
            Some((a, b)) => name.starts_with(a) && name.ends_with(b) && name.len() >= a.len() + b.len(),
            None => name.starts_with(prefix),
        },
        (None, None) => match pattern.split_once('*') {
            Some((a, b)) => name.starts_with(a) && name.ends_with(b) && name.len() >= a.len() + b.len(),
            None => name == pattern,
        },
        (Some(_), Some(_)) => unreachable!("covered by the first arm"),
    }
}

fn unknown_token(token: &str, at: Option<NodeId>, tree: &CommandTree) -> TargError {
    if token.starts_with('-') {
        return TargError::UnknownFlag {
            flag: token.to_string(),
            node: at.map_or_else(|| "targ".to_string(), |id| tree.path(id)),
        };
    }
    TargError::UnknownCommand {
        name: token.to_string(),
        context: at.map_or_else(String::new, |id| format!(" under '{}'", tree.path(id))),
    }
}
