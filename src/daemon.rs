use anyhow::{Context, Result};
use bydhvs_lib::poller::Poller;
use bydhvs_lib::telemetry::Snapshot;
use bydhvs_lib::transport::Connector;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::{commandline, exporter};

pub fn print_snapshot(snapshot: &Snapshot, json: bool) -> Result<()> {
    if json {
        let payload = serde_json::to_string(snapshot)
            .with_context(|| "Failed to serialize snapshot to JSON")?;
        println!("{payload}");
        return Ok(());
    }

    let telemetry = &snapshot.telemetry;
    let completed_at = chrono::DateTime::<chrono::Local>::from(snapshot.completed_at);
    println!("--- Data at {} ---", completed_at.to_rfc3339());
    println!("Identity: {:?}", telemetry.identity);
    println!("Measurement: {:?}", telemetry.measurement);
    println!("Geometry: {:?}", telemetry.geometry);
    for (index, tower) in &telemetry.towers {
        println!(
            "Tower {index}: max={}mV (cell {}) min={}mV (cell {}) voltage={} out={} soc_diagnosis={} soh={} state={} eta={:.3}",
            tower.max_cell_voltage,
            tower.max_cell_voltage_index,
            tower.min_cell_voltage,
            tower.min_cell_voltage_index,
            tower.voltage,
            tower.output_voltage,
            tower.soc_diagnosis,
            tower.soh,
            tower.state,
            tower.eta,
        );
        println!(
            "Tower {index} balancing: {} cells ({})",
            tower.balancing_count,
            tower.balancing_hex()
        );
        if let Some(delta) = snapshot.energy.get(index) {
            println!(
                "Tower {index} energy: charge={} (+{}) discharge={} (+{})",
                tower.charge_total, delta.charge, tower.discharge_total, delta.discharge
            );
        }
        println!("Tower {index} cell voltages: {:?}", tower.cell_voltages);
        println!("Tower {index} cell temperatures: {:?}", tower.cell_temperatures);
    }
    println!("--------------------------");
    Ok(())
}

pub fn run<C: Connector>(
    mut poller: Poller<C>,
    output: commandline::DaemonOutput,
    interval: Duration,
) -> Result<()> {
    info!("Starting daemon mode: output={output:?}, interval={interval:?}");

    let mut metrics: Option<(exporter::BydMetrics, exporter::MetricsServer)> = None;
    if let commandline::DaemonOutput::Prometheus { bind, metrics_port } = &output {
        let bydmetrics = exporter::BydMetrics::new(Arc::new(prometheus::Registry::new()))
            .with_context(|| "Failed to register metrics")?;
        let server = exporter::spawn_http_server(
            bydmetrics.registry(),
            SocketAddr::new(*bind, *metrics_port),
        )?;
        info!("Serving Prometheus metrics on http://{}/metrics", server.addr());
        metrics = Some((bydmetrics, server));
    }

    loop {
        match poller.poll_cycle() {
            Ok(snapshot) => match &output {
                commandline::DaemonOutput::Console { json } => {
                    if let Err(e) = print_snapshot(&snapshot, *json) {
                        error!("Failed to print snapshot: {e:#}");
                    }
                }
                commandline::DaemonOutput::Prometheus { .. } => {
                    if let Some((bydmetrics, _)) = &metrics {
                        bydmetrics.publish(&snapshot);
                    }
                }
            },
            Err(e) => {
                error!("Poll cycle failed, retrying in {interval:?}: {e}");
                if let Some((bydmetrics, _)) = &metrics {
                    bydmetrics.record_failure();
                }
            }
        }
        std::thread::sleep(interval);
    }
}
