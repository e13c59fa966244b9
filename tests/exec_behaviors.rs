//! Cache idempotence and watch-wrapper behavior through the public
//! executor surface.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;

use targ::exec::cache::MemoryStore;
use targ::exec::watch::{ChangeSet, WatchCallback, WatchOptions, Watcher};
use targ::exec::ExecContext;
use targ::{
    CommandTree, Executor, Member, Overrides, ParamValues, Registry, TargetSpec, TestEnvironment,
};
use targ::chain::StepRunner;

fn build_tree(members: Vec<Member>) -> Arc<CommandTree> {
    let mut reg = Registry::new();
    reg.register(members);
    Arc::new(CommandTree::build(&reg.resolve().unwrap().entries).unwrap())
}

#[tokio::test]
async fn test_cache_idempotence_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("schema.sql"), "create table t (id int);").unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&runs);
    let gen = TargetSpec::builder("gen")
        .run(move || {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .cache(&["*.sql"])
        .build()
        .unwrap();

    let tree = build_tree(vec![Member::Target(gen)]);
    let env = Arc::new(TestEnvironment::new(&["targ"]).with_cwd(dir.path()));
    let exec = Executor::new(Arc::clone(&tree), env, Overrides::default())
        .with_store(Arc::new(MemoryStore::new()));

    let id = tree.find_root("gen").unwrap();
    // Two runs with unchanged inputs: the body runs exactly once and
    // both invocations succeed.
    exec.run(id, ParamValues::new()).await.unwrap();
    exec.run(id, ParamValues::new()).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Touching the input re-runs the body.
    std::fs::write(dir.path().join("schema.sql"), "create table t (id text);").unwrap();
    exec.run(id, ParamValues::new()).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Watcher that reports one synthetic change set, waits for the
/// callback, then ends the loop.
struct OneShotWatcher;

impl Watcher for OneShotWatcher {
    fn watch<'a>(
        &'a self,
        _ctx: &'a ExecContext,
        root: &'a Path,
        _patterns: &'a [String],
        _options: WatchOptions,
        callback: WatchCallback<'a>,
    ) -> BoxFuture<'a, targ::Result<()>> {
        Box::pin(async move {
            callback(ChangeSet {
                paths: vec![root.join("src/lib.rs")],
            })
            .await
        })
    }
}

#[tokio::test]
async fn test_watch_wrapper_reruns_on_change() {
    let runs = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&runs);
    let dev = TargetSpec::builder("dev")
        .run(move || {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .watch(&["src/**/*.rs"])
        .build()
        .unwrap();

    let tree = build_tree(vec![Member::Target(dev)]);
    let env = Arc::new(TestEnvironment::new(&["targ"]));
    let exec = Executor::new(Arc::clone(&tree), env, Overrides::default())
        .with_watcher(Arc::new(OneShotWatcher))
        .with_store(Arc::new(MemoryStore::new()));

    let id = tree.find_root("dev").unwrap();
    exec.run(id, ParamValues::new()).await.unwrap();
    // One initial run plus one change-triggered re-run.
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_watch_disabled_flag_suppresses_watching() {
    let runs = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&runs);
    let dev = TargetSpec::builder("dev")
        .run(move || {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .watch(&["src/**/*.rs"])
        .no_watch()
        .build()
        .unwrap();

    let tree = build_tree(vec![Member::Target(dev)]);
    let env = Arc::new(TestEnvironment::new(&["targ"]));
    let exec = Executor::new(Arc::clone(&tree), env, Overrides::default())
        .with_watcher(Arc::new(OneShotWatcher))
        .with_store(Arc::new(MemoryStore::new()));

    let id = tree.find_root("dev").unwrap();
    exec.run(id, ParamValues::new()).await.unwrap();
    // The watch wrapper never engaged; the body ran exactly once.
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
