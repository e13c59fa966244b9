//! targ: run this repository's own development targets.
//!
//! The binary dogfoods the engine: it registers the crate's dev targets
//! (shell targets over cargo) and hands argv to the driver.

use std::process::ExitCode;
use std::time::Duration;

use targ::{register_targets, DepMode, TargetSpec};

fn register_dev_targets() -> targ::Result<()> {
    let fmt = TargetSpec::builder("fmt")
        .description("Format the workspace")
        .shell("cargo fmt --all")
        .build()?;
    let lint = TargetSpec::builder("lint")
        .description("Lint with clippy")
        .shell("cargo clippy --all-targets -- -D warnings")
        .cache(&["src/**/*.rs", "tests/**/*.rs", "Cargo.toml"])
        .build()?;
    let build = TargetSpec::builder("build")
        .description("Compile the workspace")
        .shell("cargo build --all-targets")
        .cache(&["src/**/*.rs", "Cargo.toml"])
        .build()?;
    let test = TargetSpec::builder("test")
        .description("Run the test suite")
        .shell("cargo test")
        .dep(&build)
        .timeout(Duration::from_secs(1800))
        .build()?;
    let ci = TargetSpec::builder("ci")
        .description("Everything the merge gate runs")
        .dep(&fmt)
        .dep(&lint)
        .dep(&test)
        .dep_mode(DepMode::Serial)
        .build()?;

    targ::registry::set_main_module(module_path!());
    register_targets![fmt, lint, build, test, ci];
    Ok(())
}

fn main() -> ExitCode {
    if let Err(e) = register_dev_targets() {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }
    let code = targ::cli::run();
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
