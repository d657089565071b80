use anyhow::{Context, Result};
use bydhvs_lib::poller::{Poller, PollerConfig};
use bydhvs_lib::transport::TcpConnector;
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod exporter;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let connector = TcpConnector::new(&args.host, args.port);
    let address = connector.address().to_string();
    info!(
        "BYD Battery-Box exporter v{} polling {} ({:?})",
        env!("CARGO_PKG_VERSION"),
        address,
        args.variant
    );

    let config = PollerConfig {
        variant: args.variant.into(),
        exchange_timeout: args.timeout,
        message_delay: args.delay,
        settle_delay: args.settle,
    };
    let mut poller = Poller::new(connector, config);

    match args.command {
        CliCommands::Cycle { json } => {
            let snapshot = poller
                .poll_cycle()
                .with_context(|| format!("Cannot poll battery at '{}'", address))?;
            daemon::print_snapshot(&snapshot, json)?;
        }
        CliCommands::Daemon { output, interval } => daemon::run(poller, output, interval)?,
    }

    Ok(())
}
