use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use bydhvs_lib::telemetry::Snapshot;
use log::{error, info};
use prometheus::{
    CounterVec, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder,
    TEXT_FORMAT,
};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;

pub type SharedRegistry = Arc<Registry>;

/// Serves `registry` on `/metrics` from a small dedicated runtime, so the poll loop can
/// stay blocking.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("metrics-http")
        .enable_io()
        .build()
        .with_context(|| "failed to build metrics runtime")?;

    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    let addr = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = {
        let _guard = runtime.enter();
        TcpListener::from_std(std_listener)
            .with_context(|| "failed to convert std listener into tokio listener")?
    };

    info!("Metrics server listening on {addr}");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    runtime.spawn(async move {
        let served = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
        if let Err(err) = served {
            error!("metrics server encountered an error: {err}");
        }
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        _runtime: runtime,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!("failed to encode metrics: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter, stops serving when dropped.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    _runtime: Runtime,
}

impl MetricsServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Battery gauges and counters, named as the earlier Python exporter named them.
#[derive(Clone)]
pub struct BydMetrics {
    registry: SharedRegistry,
    soc: Gauge,
    max_voltage: Gauge,
    min_voltage: Gauge,
    soh: Gauge,
    current: Gauge,
    battery_voltage: Gauge,
    max_temp: Gauge,
    min_temp: Gauge,
    battery_temp: Gauge,
    eta: GaugeVec,
    charge_total: CounterVec,
    discharge_total: CounterVec,
    tower_voltage: GaugeVec,
    tower_soc_diagnosis: GaugeVec,
    tower_balancing: GaugeVec,
    cell_temp: GaugeVec,
    cell_voltage: GaugeVec,
    info: GaugeVec,
    cycles: IntCounterVec,
    last_success: Gauge,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter_vec(registry: &Registry, name: &str, help: &str) -> Result<CounterVec> {
    let counter = CounterVec::new(Opts::new(name, help), &["tower"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl BydMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let r = registry.as_ref();
        let cycles = IntCounterVec::new(
            Opts::new("byd_poll_cycles_total", "Poll cycles by outcome"),
            &["result"],
        )?;
        r.register(Box::new(cycles.clone()))?;

        Ok(Self {
            soc: gauge(r, "byd_soc", "State of Charge")?,
            max_voltage: gauge(r, "byd_max_voltage", "Maximum Voltage")?,
            min_voltage: gauge(r, "byd_min_voltage", "Minimum Voltage")?,
            soh: gauge(r, "byd_soh", "State of Health")?,
            current: gauge(r, "byd_current", "Battery Current")?,
            battery_voltage: gauge(r, "byd_battery_voltage", "Battery Voltage")?,
            max_temp: gauge(r, "byd_max_temp", "Maximum Temperature")?,
            min_temp: gauge(r, "byd_min_temp", "Minimum Temperature")?,
            battery_temp: gauge(r, "byd_battery_temp", "Battery Temperature")?,
            eta: gauge_vec(r, "byd_eta", "Battery ETA", &["tower"])?,
            charge_total: counter_vec(r, "byd_charge_total", "Total Charge")?,
            discharge_total: counter_vec(r, "byd_discharge_total", "Total Discharge")?,
            tower_voltage: gauge_vec(r, "byd_tower_voltage", "Tower Voltage", &["tower"])?,
            tower_soc_diagnosis: gauge_vec(
                r,
                "byd_tower_soc_diagnosis",
                "Tower SOC Diagnosis",
                &["tower"],
            )?,
            tower_balancing: gauge_vec(
                r,
                "byd_tower_balancing",
                "Tower Balancing Count",
                &["tower"],
            )?,
            cell_temp: gauge_vec(
                r,
                "byd_battery_cell_temp_celsius",
                "Battery Cell Temperature in Celsius",
                &["tower", "cell_group"],
            )?,
            cell_voltage: gauge_vec(
                r,
                "byd_battery_cell_voltage_volt",
                "Battery Cell Voltage in Volts",
                &["tower", "cell"],
            )?,
            info: gauge_vec(
                r,
                "byd_info",
                "Battery identity, always 1",
                &["serial", "family", "bmu", "bms", "grid"],
            )?,
            last_success: gauge(
                r,
                "byd_last_success_timestamp_seconds",
                "Unix time of the last completed poll cycle",
            )?,
            cycles,
            registry,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn publish(&self, snapshot: &Snapshot) {
        let telemetry = &snapshot.telemetry;
        let identity = &telemetry.identity;
        self.info.reset();
        self.info
            .with_label_values(&[
                identity.serial.trim_end_matches(['\0', ' ']),
                &identity.family.to_string(),
                &identity.bmu,
                &identity.bms,
                &identity.grid.to_string(),
            ])
            .set(1.0);

        let measurement = &telemetry.measurement;
        self.soc.set(f64::from(measurement.soc));
        self.max_voltage.set(measurement.max_cell_voltage);
        self.min_voltage.set(measurement.min_cell_voltage);
        self.soh.set(f64::from(measurement.soh));
        self.current.set(measurement.current);
        self.battery_voltage.set(measurement.voltage);
        self.max_temp.set(f64::from(measurement.max_temperature));
        self.min_temp.set(f64::from(measurement.min_temperature));
        self.battery_temp.set(f64::from(measurement.temperature));

        for (index, tower) in &telemetry.towers {
            let tower_label = index.to_string();
            let labels = [tower_label.as_str()];
            self.eta.with_label_values(&labels).set(tower.eta);
            self.tower_voltage
                .with_label_values(&labels)
                .set(f64::from(tower.voltage));
            self.tower_soc_diagnosis
                .with_label_values(&labels)
                .set(tower.soc_diagnosis);
            self.tower_balancing
                .with_label_values(&labels)
                .set(f64::from(tower.balancing_count));
            if let Some(delta) = snapshot.energy.get(index) {
                self.charge_total
                    .with_label_values(&labels)
                    .inc_by(f64::from(delta.charge));
                self.discharge_total
                    .with_label_values(&labels)
                    .inc_by(f64::from(delta.discharge));
            }
            for (cell, voltage) in &tower.cell_voltages {
                self.cell_voltage
                    .with_label_values(&[tower_label.as_str(), &cell.to_string()])
                    .set(f64::from(*voltage) / 1000.0);
            }
            for (group, temperature) in &tower.cell_temperatures {
                self.cell_temp
                    .with_label_values(&[tower_label.as_str(), &group.to_string()])
                    .set(f64::from(*temperature));
            }
        }

        self.cycles.with_label_values(&["success"]).inc();
        if let Ok(since_epoch) = snapshot.completed_at.duration_since(UNIX_EPOCH) {
            self.last_success.set(since_epoch.as_secs_f64());
        }
    }

    pub fn record_failure(&self) {
        self.cycles.with_label_values(&["failure"]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bydhvs_lib::telemetry::{EnergyDelta, Telemetry, Tower};
    use prometheus::proto::MetricFamily;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn value(families: &[MetricFamily], name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let family = families.iter().find(|f| f.get_name() == name)?;
        family
            .get_metric()
            .iter()
            .find(|m| {
                labels.iter().all(|(k, v)| {
                    m.get_label()
                        .iter()
                        .any(|l| l.get_name() == *k && l.get_value() == *v)
                })
            })
            .map(|m| {
                if m.has_counter() {
                    m.get_counter().get_value()
                } else {
                    m.get_gauge().get_value()
                }
            })
    }

    fn snapshot(charge_delta: u32) -> Snapshot {
        let mut telemetry = Telemetry::default();
        telemetry.identity.serial = "P03T10123456789ABCD".into();
        telemetry.measurement.soc = 77;
        telemetry.measurement.current = -5.2;
        telemetry.towers.insert(
            0,
            Tower {
                voltage: 155,
                balancing_count: 10,
                cell_voltages: BTreeMap::from([(1, 3301), (2, 3302)]),
                cell_temperatures: BTreeMap::from([(1, 21)]),
                ..Default::default()
            },
        );
        Snapshot {
            telemetry,
            energy: BTreeMap::from([(
                0,
                EnergyDelta {
                    charge: charge_delta,
                    discharge: 0,
                },
            )]),
            completed_at: UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        }
    }

    #[test]
    fn publish_sets_gauges() {
        let metrics = BydMetrics::new(Arc::new(Registry::new())).unwrap();
        metrics.publish(&snapshot(0));
        let families = metrics.registry().gather();

        assert_eq!(value(&families, "byd_soc", &[]), Some(77.0));
        assert_eq!(value(&families, "byd_current", &[]), Some(-5.2));
        assert_eq!(
            value(&families, "byd_tower_voltage", &[("tower", "0")]),
            Some(155.0)
        );
        assert_eq!(
            value(&families, "byd_tower_balancing", &[("tower", "0")]),
            Some(10.0)
        );
        assert_eq!(
            value(
                &families,
                "byd_battery_cell_voltage_volt",
                &[("tower", "0"), ("cell", "2")]
            ),
            Some(3.302)
        );
        assert_eq!(
            value(
                &families,
                "byd_battery_cell_temp_celsius",
                &[("cell_group", "1")]
            ),
            Some(21.0)
        );
        assert_eq!(
            value(&families, "byd_info", &[("serial", "P03T10123456789ABCD")]),
            Some(1.0)
        );
        assert_eq!(
            value(&families, "byd_last_success_timestamp_seconds", &[]),
            Some(1_700_000_000.0)
        );
    }

    #[test]
    fn counters_advance_by_delta() {
        let metrics = BydMetrics::new(Arc::new(Registry::new())).unwrap();
        metrics.publish(&snapshot(2000));
        metrics.publish(&snapshot(600));
        metrics.record_failure();
        let families = metrics.registry().gather();

        assert_eq!(
            value(&families, "byd_charge_total", &[("tower", "0")]),
            Some(2600.0)
        );
        assert_eq!(
            value(&families, "byd_poll_cycles_total", &[("result", "success")]),
            Some(2.0)
        );
        assert_eq!(
            value(&families, "byd_poll_cycles_total", &[("result", "failure")]),
            Some(1.0)
        );
    }

    #[test]
    fn server_binds_and_stops() {
        let metrics = BydMetrics::new(Arc::new(Registry::new())).unwrap();
        let server =
            spawn_http_server(metrics.registry(), "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_eq!(server.addr().ip().to_string(), "127.0.0.1");
        assert_ne!(server.addr().port(), 0);
        drop(server);
    }
}
