use std::process::ExitCode;
use clap::Parser;
use log::{error, info, LevelFilter};
use lighthouse_power::cli::Cli;
use lighthouse_power::error::{AppRunError, ConfigError};
use lighthouse_power::{init_logging, run};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(if cli.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    info!(concat!("lighthouse-power ", env!("CARGO_PKG_VERSION")));

    match run(cli) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another lighthouse-power process is already using the config file");
            ExitCode::FAILURE
        },
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        },
        Ok(_) => ExitCode::SUCCESS,
    }
}
