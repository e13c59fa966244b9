//! Output multiplexer for parallel groups.
//!
//! Branches of a parallel group never touch the output writer directly:
//! they send fully-formed lines into a bounded channel, and a dedicated
//! worker writes them FIFO. Lines are atomic — two branches can interleave
//! only at line boundaries. The channel bound provides backpressure: a
//! chatty branch blocks on send instead of flooding memory.

use std::io::Write;
use std::thread::JoinHandle;

use tokio::sync::mpsc;

/// Default channel capacity for a parallel group's multiplexer.
pub const DEFAULT_CAPACITY: usize = 64;

/// Serializes lines from concurrent branches into one writer.
pub struct OutputMux {
    tx: mpsc::Sender<String>,
    worker: JoinHandle<()>,
}

impl OutputMux {
    /// Start a multiplexer over `writer` with the given channel capacity.
    #[must_use]
    pub fn new(mut writer: Box<dyn Write + Send>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
        let worker = std::thread::spawn(move || {
            while let Some(line) = rx.blocking_recv() {
                if writer.write_all(line.as_bytes()).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });
        Self { tx, worker }
    }

    /// A sender handle for one branch. All handles must be dropped before
    /// [`OutputMux::close`] can drain.
    #[must_use]
    pub fn sender(&self) -> MuxSender {
        MuxSender {
            tx: self.tx.clone(),
        }
    }

    /// Close the channel and wait for the worker to drain. Callers must
    /// not send after this.
    pub async fn close(self) {
        let Self { tx, worker } = self;
        drop(tx);
        let _ = tokio::task::spawn_blocking(move || worker.join()).await;
    }
}

/// Clonable handle for enqueuing lines onto a multiplexer.
#[derive(Clone)]
pub struct MuxSender {
    tx: mpsc::Sender<String>,
}

impl MuxSender {
    /// Enqueue a fully-formed line (trailing newline included). Blocks
    /// only when the channel is full; a closed channel drops the line.
    pub async fn send(&self, line: String) {
        let _ = self.tx.send(line).await;
    }

    /// Enqueue from non-async code (target function bodies run on the
    /// blocking pool).
    pub fn send_blocking(&self, line: String) {
        let _ = self.tx.blocking_send(line);
    }
}

/// A branch's view of the multiplexer: every line goes out prefixed with
/// the branch name, padded to the widest name in the group.
#[derive(Clone)]
pub struct BranchPrinter {
    sender: MuxSender,
    prefix: String,
}

impl BranchPrinter {
    /// Create a printer for `name`, padding to `max_name_len` columns.
    #[must_use]
    pub fn new(sender: MuxSender, name: &str, max_name_len: usize) -> Self {
        Self {
            sender,
            prefix: format!("{name:<max_name_len$} | "),
        }
    }

    /// Emit one line of branch output.
    pub async fn line(&self, text: &str) {
        self.sender.send(format!("{}{}\n", self.prefix, text)).await;
    }

    /// Emit one line from non-async code.
    pub fn line_blocking(&self, text: &str) {
        self.sender.send_blocking(format!("{}{}\n", self.prefix, text));
    }

    /// The underlying sender, for nested parallel groups that share the
    /// same writer.
    #[must_use]
    pub fn sender(&self) -> MuxSender {
        self.sender.clone()
    }
}
