//! Reference vector engine process: answers bridge requests on stdin/stdout.

use std::io;

use anyhow::{Context, Result};
use ndvem::timing::ScopedTimer;
use ndvem::vem::engine::{serve, VemEngine};

fn main() -> Result<()> {
    // stdout carries the protocol; logs go to stderr.
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stderr)
        .init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ndvem-engine".to_string());
    let _session = ScopedTimer::new(format!("{name} session"));
    let mut engine = VemEngine::new(name);
    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(&mut engine, stdin.lock(), stdout.lock()).context("engine session failed")?;
    log::debug!(
        "engine exiting with {} live allocations",
        engine.live_allocations()
    );
    Ok(())
}
