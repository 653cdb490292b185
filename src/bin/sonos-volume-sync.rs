//! sonos-volume-sync binary entry point
//!
//! Dispatches to daemon mode or subcommands based on CLI arguments.

use clap::Parser;
use color_eyre::eyre::Result;
use sonos_volume_sync::config::DEFAULT_KEY_STEP;
use sonos_volume_sync::{cli::Args, cli::Command, commands, config::Config, daemon, logging};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    let config_path = args.config.as_deref();

    match args.command {
        None if args.status => {
            logging::init_cli();
            let config = Config::load(config_path)?;
            commands::status(&config, config_path).await
        }

        // Daemon handles its own logging initialization (stderr + optional file)
        None => {
            let config = Config::load(config_path)?;
            daemon::run(config).await
        }

        Some(Command::Key { direction }) => {
            logging::init_cli();
            // Keys must keep working without a config; fall back to the default step
            let step = Config::load(config_path).map_or(DEFAULT_KEY_STEP, |c| c.local.key_step);
            commands::key(direction, step).await
        }

        Some(Command::Validate) => {
            logging::init_cli();
            let config = Config::load(config_path)?;
            config.print_summary();
            Ok(())
        }

        Some(Command::Shutdown) => {
            logging::init_cli();
            commands::shutdown().await
        }
    }
}
