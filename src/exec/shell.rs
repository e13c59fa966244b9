//! Shell-target dispatch.
//!
//! A shell target's template has its `$var`/`${var}` placeholders replaced
//! by the bound flag values (matched by lowercased name; unmatched
//! placeholders stay literal), then the string goes to the injected
//! [`ShellRunner`] — the sole point of subprocess invocation. The default
//! runner execs `sh -c` with inherited stdio, or pipes line-by-line
//! through the group's multiplexer inside a parallel branch.

use std::process::Stdio;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use crate::error::{Result, TargError};
use crate::exec::ExecContext;
use crate::exec::mux::BranchPrinter;
use crate::params::ParamValues;
use crate::tree;

/// The subprocess seam. `run` resolves when the command finishes or the
/// context is cancelled; cancellation kills the child and returns Ok
/// (the cancellation's cause carries the failure).
pub trait ShellRunner: Send + Sync {
    /// Run one command string to completion.
    fn run<'a>(&'a self, ctx: &'a ExecContext, command: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Substitute `$var`/`${var}` placeholders from bound values. Lookup is
/// by lowercased variable name; placeholders with no bound value are left
/// as-is.
#[must_use]
pub fn substitute(template: &str, values: &ParamValues) -> String {
    tree::var_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = caps[1].to_ascii_lowercase();
            match values.get_str(&name) {
                Some(value) => value,
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Default shell runner: `sh -c <command>`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShRunner;

impl ShellRunner for ShRunner {
    fn run<'a>(&'a self, ctx: &'a ExecContext, command: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match ctx.printer() {
                Some(printer) => run_piped(ctx, command, printer).await,
                None => run_inherited(ctx, command).await,
            }
        })
    }
}

/// Plain invocation: the child shares the process stdio. On
/// cancellation the child is killed when it drops (`kill_on_drop`).
async fn run_inherited(ctx: &ExecContext, command: &str) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TargError::io(format!("failed to spawn shell for '{command}'"), e))?;

    tokio::select! {
        status = child.wait() => {
            let status = status
                .map_err(|e| TargError::io(format!("failed to wait for '{command}'"), e))?;
            exit_result(command, status.code(), status.success())
        }
        () = ctx.cancelled_wait() => Ok(()),
    }
}

/// Parallel-branch invocation: stdout and stderr are piped and forwarded
/// line-by-line through the branch printer.
async fn run_piped(ctx: &ExecContext, command: &str, printer: &BranchPrinter) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TargError::io(format!("failed to spawn shell for '{command}'"), e))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_task = forward_lines(stdout, printer.clone());
    let err_task = forward_lines(stderr, printer.clone());

    let run = async {
        let (status, (), ()) = tokio::join!(child.wait(), out_task, err_task);
        let status =
            status.map_err(|e| TargError::io(format!("failed to wait for '{command}'"), e))?;
        exit_result(command, status.code(), status.success())
    };

    tokio::select! {
        result = run => result,
        () = ctx.cancelled_wait() => Ok(()),
    }
}

/// Forward every line from a child pipe through the printer.
async fn forward_lines<R>(pipe: Option<R>, printer: BranchPrinter)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else { return };
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        printer.line(&line).await;
    }
}

fn exit_result(command: &str, code: Option<i32>, success: bool) -> Result<()> {
    if success {
        Ok(())
    } else {
        Err(TargError::ShellFailure {
            command: command.to_string(),
            code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParamValue, ValueSource};

    fn values(pairs: &[(&str, &str)]) -> ParamValues {
        let mut v = ParamValues::new();
        for (name, value) in pairs {
            v.set(name, ParamValue::Str((*value).to_string()), ValueSource::Argv);
        }
        v
    }

    #[test]
    fn test_substitute_both_forms() {
        let v = values(&[("namespace", "prod"), ("file", "x.yaml")]);
        assert_eq!(
            substitute("kubectl apply -n $namespace -f ${file}", &v),
            "kubectl apply -n prod -f x.yaml"
        );
    }

    #[test]
    fn test_substitute_is_case_insensitive() {
        let v = values(&[("namespace", "prod")]);
        assert_eq!(substitute("echo $NAMESPACE", &v), "echo prod");
        assert_eq!(substitute("echo ${Namespace}", &v), "echo prod");
    }

    #[test]
    fn test_unmatched_placeholder_left_literal() {
        let v = values(&[("namespace", "prod")]);
        assert_eq!(
            substitute("echo $namespace $HOME", &v),
            "echo prod $HOME"
        );
    }

    #[test]
    fn test_repeated_placeholder() {
        let v = values(&[("tag", "v1")]);
        assert_eq!(
            substitute("git tag $tag && git push origin $tag", &v),
            "git tag v1 && git push origin v1"
        );
    }

    #[tokio::test]
    async fn test_sh_runner_success_and_failure() {
        let ctx = ExecContext::root_for_test();
        let runner = ShRunner;
        assert!(runner.run(&ctx, "true").await.is_ok());

        let err = runner.run(&ctx, "exit 3").await.unwrap_err();
        match err {
            TargError::ShellFailure { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_runner_returns_promptly() {
        let ctx = ExecContext::root_for_test();
        ctx.cancel();
        let runner = ShRunner;
        // A cancelled context short-circuits even a long sleep.
        let start = std::time::Instant::now();
        assert!(runner.run(&ctx, "sleep 5").await.is_ok());
        assert!(start.elapsed() < std::time::Duration::from_secs(2));
    }
}
