//! File-watch collaborator.
//!
//! The orchestrator's watch wrapper re-runs a target whenever files
//! matching its patterns change. The seam is the [`Watcher`] trait: given
//! a cancellation context, a root directory, and glob patterns, invoke
//! the callback once per debounced change set until cancelled. The
//! default implementation bridges `notify` events onto the async side and
//! coalesces bursts within a settle window.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use notify::{RecursiveMode, Watcher as _};

use crate::error::{Result, TargError};
use crate::exec::cache::build_globset;
use crate::exec::ExecContext;

/// The paths behind one debounced change notification.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// Changed paths, sorted and deduplicated.
    pub paths: Vec<PathBuf>,
}

/// Options for a watch loop.
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    /// Quiet window before a burst of events becomes one callback.
    pub debounce: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(200),
        }
    }
}

/// Callback invoked per change set. Returning an error ends the watch
/// loop and propagates.
pub type WatchCallback<'a> =
    Box<dyn Fn(ChangeSet) -> BoxFuture<'a, Result<()>> + Send + Sync + 'a>;

/// The watch seam.
pub trait Watcher: Send + Sync {
    /// Watch `root` for changes matching `patterns`, invoking `callback`
    /// per debounced change set, until `ctx` is cancelled (returns Ok) or
    /// the callback errors.
    fn watch<'a>(
        &'a self,
        ctx: &'a ExecContext,
        root: &'a Path,
        patterns: &'a [String],
        options: WatchOptions,
        callback: WatchCallback<'a>,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Default watcher on top of `notify`'s recommended platform backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotifyWatcher;

impl Watcher for NotifyWatcher {
    fn watch<'a>(
        &'a self,
        ctx: &'a ExecContext,
        root: &'a Path,
        patterns: &'a [String],
        options: WatchOptions,
        callback: WatchCallback<'a>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let matcher = build_globset(patterns)?;
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<PathBuf>>();

            // The notify callback runs on the backend's own thread; an
            // unbounded send is the safe bridge onto the async side.
            let mut backend =
                notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                    if let Ok(event) = event {
                        let _ = tx.send(event.paths);
                    }
                })
                .map_err(|e| TargError::watch("failed to create file watcher", e))?;
            backend
                .watch(root, RecursiveMode::Recursive)
                .map_err(|e| {
                    TargError::watch(format!("failed to watch {}", root.display()), e)
                })?;

            loop {
                let first = tokio::select! {
                    () = ctx.cancelled_wait() => return Ok(()),
                    paths = rx.recv() => match paths {
                        Some(paths) => paths,
                        None => return Ok(()),
                    },
                };

                let mut changed = filter_paths(root, &matcher, first);
                // Let the burst settle before reporting.
                loop {
                    match tokio::time::timeout(options.debounce, rx.recv()).await {
                        Ok(Some(paths)) => changed.extend(filter_paths(root, &matcher, paths)),
                        Ok(None) | Err(_) => break,
                    }
                }
                changed.sort();
                changed.dedup();
                if changed.is_empty() {
                    continue;
                }
                if ctx.is_cancelled() {
                    return Ok(());
                }
                callback(ChangeSet { paths: changed }).await?;
            }
        })
    }
}

/// Keep only the event paths matching the target's patterns (matched
/// relative to the watch root).
fn filter_paths(root: &Path, matcher: &globset::GlobSet, paths: Vec<PathBuf>) -> Vec<PathBuf> {
    paths
        .into_iter()
        .filter(|path| {
            let rel = path.strip_prefix(root).unwrap_or(path);
            matcher.is_match(rel.to_string_lossy().replace('\\', "/"))
        })
        .collect()
}
