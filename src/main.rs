use std::process::ExitCode;

use clap::Parser;
use tracing::error;

mod cli;
mod list;

use cli::{Cli, Commands};
use tapmux::config::Config;
use tapmux::daemon::{self, DaemonError, DaemonOpts};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<(), DaemonError> {
    let opts = DaemonOpts {
        timeout: cli.timeout,
        systemd: cli.systemd,
    };

    match &cli.command {
        Some(Commands::Local) => {
            let config = load_config(cli)?;
            let term = daemon::install_signal_handlers().map_err(DaemonError::Startup)?;
            daemon::run_local(&config, &opts, &term)
        }
        Some(Commands::Serve { port, host }) => {
            let config = load_config(cli)?;
            let term = daemon::install_signal_handlers().map_err(DaemonError::Startup)?;
            daemon::run_serve(&config, host, *port, &opts, &term)
        }
        Some(Commands::Connect { host, port }) => {
            let term = daemon::install_signal_handlers().map_err(DaemonError::Startup)?;
            daemon::run_connect(host, *port, &opts, &term)
        }
        Some(Commands::List) => {
            let config = load_config(cli)?;
            list::run_list(&config).map_err(DaemonError::Startup)
        }
        Some(Commands::Completion { shell }) => {
            cli::generate_completion(*shell);
            Ok(())
        }
        None => {
            cli::print_help();
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config, DaemonError> {
    Config::load(&cli.config).map_err(|err| DaemonError::Startup(anyhow::Error::new(err)))
}
