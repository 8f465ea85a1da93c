use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use codex_hud_engine::app;
use codex_hud_engine::cli::{Cli, Commands};
use codex_hud_engine::config::RuntimeSettings;
use codex_hud_engine::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("codex-hud error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();
    let settings = RuntimeSettings::resolve(&cli.overrides())?;

    match cli.command {
        Some(Commands::Status { json }) => app::print_status(&settings, json),
        Some(Commands::Sessions) => app::list_sessions(&settings),
        Some(Commands::Watch) | None => app::watch(&settings),
    }
}
