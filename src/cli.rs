use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Overrides;

#[derive(Parser, Debug)]
#[command(
    name = "codex-hud",
    version,
    about = "Follow the active Codex rollout log and summarize live session activity"
)]
pub struct Cli {
    /// Only follow sessions started in this working directory.
    #[arg(long, global = true, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Prefer the session whose rollout started closest to this RFC3339 time.
    #[arg(long, global = true, value_name = "RFC3339")]
    pub session_start: Option<String>,

    /// Sessions root to scan instead of `$CODEX_HOME/sessions`.
    #[arg(long, global = true, value_name = "DIR")]
    pub sessions_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Follow the active session and print a summary line whenever it changes.
    Watch,
    /// Locate the active session once and print its parsed state.
    Status {
        /// Print the aggregate as JSON.
        #[arg(long)]
        json: bool,
    },
    /// List rollout logs inside the lookback window.
    Sessions,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            sessions_dir: self.sessions_dir.clone(),
            target_cwd: self.cwd.clone(),
            target_session_start: self.session_start.clone(),
        }
    }
}
