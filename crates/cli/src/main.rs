// telesync CLI - reconcile TeslaLogger / TeslaMate telemetry exports

mod exit_codes;
mod logging;
mod recon;
mod sink;

use std::process::ExitCode;

use clap::Parser;

use exit_codes::EXIT_SUCCESS;
use recon::SyncCommands;

#[derive(Parser)]
#[command(name = "telesync")]
#[command(about = "Reconcile vehicle telemetry between two logging sources")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: SyncCommands,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init();

    match recon::cmd_sync(cli.command) {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}
