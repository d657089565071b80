use bydhvs_lib::protocol::Variant;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::net::IpAddr;
use std::time::Duration;

/// Accepts humantime durations ("30s", "1m 30s") as well as plain seconds, which is
/// what the environment variables of existing deployments carry.
fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    match value.trim().parse::<u64>() {
        Ok(seconds) => Ok(Duration::from_secs(seconds)),
        Err(_) => humantime::parse_duration(value),
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum VariantArg {
    /// HVS style: one tower, tower count in the identity reply is ignored
    SingleTower,
    /// HVM style: every tower reported by the identity reply is measured
    MultiTower,
}

impl From<VariantArg> for Variant {
    fn from(value: VariantArg) -> Self {
        match value {
            VariantArg::SingleTower => Variant::SingleTower,
            VariantArg::MultiTower => Variant::MultiTower,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run a single poll cycle and print the decoded telemetry
    Cycle {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run in daemon mode, polling the battery periodically
    Daemon {
        /// Output destination for completed cycles
        #[command(subcommand)]
        output: DaemonOutput,
        /// Pause between poll cycles (e.g., "30s", "1m")
        #[arg(long, short, value_parser = parse_duration, env = "POLLING_INTERVAL", default_value = "30s")]
        interval: Duration,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print every completed cycle to the standard output (console).
    Console {
        /// Print snapshots as JSON
        #[arg(long)]
        json: bool,
    },
    /// Serve the latest completed cycle as Prometheus metrics on /metrics.
    Prometheus {
        /// Address the metrics server binds to
        #[arg(long, env = "PROMETHEUS_BIND", default_value = "0.0.0.0")]
        bind: IpAddr,
        /// Port the metrics server listens on
        #[arg(long, env = "PROMETHEUS_PORT", default_value_t = 3425)]
        metrics_port: u16,
    },
}

const fn about_text() -> &'static str {
    "BYD Battery-Box HVS/HVM poller and Prometheus exporter"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Battery host name or IP address
    #[arg(long, env = "BATTERY_IP", default_value = "192.168.2.22")]
    pub host: String,

    /// Battery TCP port
    #[arg(short, long, env = "BATTERY_PORT", default_value_t = 8080)]
    pub port: u16,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Timeout for a single request/response exchange (e.g., "500ms", "1s")
    #[arg(value_parser = parse_duration, long, default_value = "1s")]
    pub timeout: Duration,

    /// Delay after every successful exchange (e.g., "200ms")
    #[arg(value_parser = parse_duration, long, default_value = "200ms")]
    pub delay: Duration,

    /// Time the battery needs to measure all cells after the start request (e.g., "3s")
    #[arg(value_parser = parse_duration, long, env = "SETTLE_DELAY", default_value = "3s")]
    pub settle: Duration,

    /// Protocol variant of the battery
    #[arg(long, value_enum, default_value_t = VariantArg::SingleTower)]
    pub variant: VariantArg,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_seconds_and_humantime() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn daemon_arguments() {
        let args = CliArgs::try_parse_from([
            "bydhvs",
            "--host",
            "10.0.0.5",
            "--variant",
            "multi-tower",
            "daemon",
            "--interval",
            "10",
            "prometheus",
            "--metrics-port",
            "9100",
        ])
        .unwrap();
        assert_eq!(args.host, "10.0.0.5");
        assert_eq!(args.settle, Duration::from_secs(3));
        assert_eq!(Variant::from(args.variant), Variant::MultiTower);
        match args.command {
            CliCommands::Daemon { output, interval } => {
                assert_eq!(interval, Duration::from_secs(10));
                assert!(matches!(
                    output,
                    DaemonOutput::Prometheus {
                        metrics_port: 9100,
                        ..
                    }
                ));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
