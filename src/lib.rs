//! targ: declare build/dev/ops targets in code and run them by name.
//!
//! This crate is the execution core of a CLI task runner:
//!
//! - **Chaining**: one argv runs several targets (`targ build test ^ docs`),
//!   with `^` resetting to the root and `*` globs fanning out.
//! - **Arguments**: each target binds its own flags and positionals, with
//!   short-flag clustering, `=` forms, environment and default fallbacks.
//! - **Orchestration**: per-target dependencies run serially or in
//!   parallel with timeouts, repetition, retry with exponential backoff,
//!   file-watch loops, and content-fingerprint caching.
//! - **Registry**: remote packages contribute targets; consumers can
//!   deregister a package wholesale and re-register selected targets.
//!
//! Consumers declare [`target::TargetSpec`] values, register them (the
//! [`register_targets!`] macro stamps origin attribution), and hand
//! control to [`cli::run`].

pub mod chain;
pub mod cli;
pub mod env;
pub mod error;
pub mod exec;
pub mod params;
pub mod registry;
pub mod target;
pub mod tree;

pub use env::{Environment, OsEnvironment, TestEnvironment};
pub use error::{Result, TargError};
pub use exec::{ExecContext, Executor, Overrides};
pub use params::{ParamDecl, ParamValue, ParamValues, ValueKind};
pub use registry::{Registry, Resolution};
pub use target::{Backoff, Body, DepMode, GroupSpec, Member, TargetSpec};
pub use tree::CommandTree;
