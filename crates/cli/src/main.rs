use std::process::ExitCode;

use clap::Parser;
use commands::{Cli, Commands, Context};
use common::{
    config::{Loaded, Settings},
    logging,
};
use interrupt::{Cancelled, Interrupt, CANCELLED_EXIT_CODE};
use tracing::{debug, level_filters::LevelFilter};

mod api;
mod archiver;
mod commands;
mod config;
mod interrupt;
mod process;
mod prompt;

#[cfg(test)]
mod testing;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let Loaded { settings, ignored } = match Settings::new() {
        Ok(loaded) => loaded,
        Err(error) => {
            eprintln!("Unable to load settings: {error}");
            return ExitCode::FAILURE;
        }
    };

    let level = if cli.verbose {
        LevelFilter::DEBUG
    } else {
        settings.logging.level
    };

    logging::init(level);

    if let Some(ignored) = ignored {
        ignored.warn();
    }

    match run(cli.command, settings) {
        Ok(code) => code,
        Err(error) if error.chain().any(|cause| cause.is::<Cancelled>()) => {
            eprintln!("🟡 Cancelled.");
            ExitCode::from(CANCELLED_EXIT_CODE)
        }
        Err(error) => {
            debug!(?error, "command failed");
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands, settings: Settings) -> Result<ExitCode, anyhow::Error> {
    let ctx = Context {
        settings,
        interrupt: Interrupt::install()?,
    };

    match command {
        Commands::Login => commands::login(&ctx)?,
        Commands::Logout => commands::logout()?,
        Commands::Whoami => commands::whoami(&ctx)?,
        Commands::Deploy(args) => {
            let outcome = commands::deploy(args, &ctx)?;
            return Ok(ExitCode::from(outcome.exit_code()));
        }
        Commands::Unlink(args) => commands::unlink(args)?,
        Commands::Logs(args) => commands::logs(args, &ctx)?,
        Commands::SetupCi(args) => commands::setup_ci(args, &ctx)?,
        Commands::New(args) => commands::new(args)?,
    }

    Ok(ExitCode::SUCCESS)
}
