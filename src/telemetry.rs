use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Battery family as advertised by the serial number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum BatteryFamily {
    Hvs,
    Lvs,
    #[default]
    Unknown,
}

impl BatteryFamily {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'3' => BatteryFamily::Hvs,
            b'1' | b'2' => BatteryFamily::Lvs,
            _ => BatteryFamily::Unknown,
        }
    }
}

impl fmt::Display for BatteryFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BatteryFamily::Hvs => write!(f, "HVS"),
            BatteryFamily::Lvs => write!(f, "LVS"),
            BatteryFamily::Unknown => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum GridMode {
    OffGrid,
    OnGrid,
    Backup,
    #[default]
    Unknown,
}

impl GridMode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0 => GridMode::OffGrid,
            1 => GridMode::OnGrid,
            2 => GridMode::Backup,
            _ => GridMode::Unknown,
        }
    }
}

impl fmt::Display for GridMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GridMode::OffGrid => write!(f, "OffGrid"),
            GridMode::OnGrid => write!(f, "OnGrid"),
            GridMode::Backup => write!(f, "Backup"),
            GridMode::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Identity of the battery stack, decoded from the first reply of a cycle.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PackIdentity {
    pub serial: String,
    pub family: BatteryFamily,
    pub bmu_a: String,
    pub bmu_b: String,
    /// Whichever of the two BMU firmware versions is active, suffixed `-A` or `-B`.
    pub bmu: String,
    pub bms: String,
    pub modules: u8,
    /// Only reported by the multi-tower variant.
    pub towers: Option<u8>,
    pub grid: GridMode,
}

/// Pack-wide measurements.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PackMeasurement {
    pub soc: i16,
    pub max_cell_voltage: f64,
    pub min_cell_voltage: f64,
    pub soh: i16,
    pub current: f64,
    pub voltage: f64,
    pub max_temperature: i16,
    pub min_temperature: i16,
    pub temperature: i16,
}

/// Cell and temperature-sensor counts of one tower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PackGeometry {
    pub battery_type: u8,
    pub inverter_type: u8,
    pub cells: u16,
    pub temperatures: u16,
}

impl PackGeometry {
    /// Returns `(cells, temperatures)` for the given battery type byte, or `None` when
    /// the type is not known and the family does not override it.
    pub fn counts(battery_type: u8, family: BatteryFamily, modules: u8) -> Option<(u16, u16)> {
        let modules = u16::from(modules);
        if family == BatteryFamily::Lvs {
            return Some((modules * 7, 0));
        }
        match battery_type {
            1 => Some((modules * 16, modules * 8)),
            2 => Some((modules * 32, modules * 12)),
            _ => None,
        }
    }
}

/// Aggregate of one tower. Voltages are in millivolts as reported by the device.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Tower {
    pub max_cell_voltage: i16,
    pub min_cell_voltage: i16,
    pub max_cell_voltage_index: u8,
    pub min_cell_voltage_index: u8,
    pub max_temperature_index: u8,
    pub min_temperature_index: u8,
    pub balancing: Vec<u8>,
    pub balancing_count: u32,
    pub charge_total: u32,
    pub discharge_total: u32,
    pub eta: f64,
    pub voltage: i16,
    pub output_voltage: i16,
    pub soc_diagnosis: f64,
    pub soh: i16,
    pub state: String,
    /// 1-based cell index to millivolts.
    pub cell_voltages: BTreeMap<u16, i16>,
    /// 1-based sensor group index to degrees Celsius.
    pub cell_temperatures: BTreeMap<u16, u8>,
}

impl Tower {
    pub fn balancing_hex(&self) -> String {
        self.balancing.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Everything known about one battery stack.
///
/// Lives as long as the poller and is overwritten piecewise; nothing is ever cleared,
/// so values from an aborted cycle stay in place until the next successful decode.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Telemetry {
    pub identity: PackIdentity,
    pub measurement: PackMeasurement,
    pub geometry: PackGeometry,
    pub towers: BTreeMap<u8, Tower>,
}

impl Telemetry {
    pub fn tower_mut(&mut self, index: u8) -> &mut Tower {
        self.towers.entry(index).or_default()
    }
}

/// Energy counter increase of one tower since the previous completed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct EnergyDelta {
    pub charge: u32,
    pub discharge: u32,
}

impl EnergyDelta {
    /// A device counter that went backwards contributes nothing.
    pub fn between(previous: Option<&Tower>, current: &Tower) -> Self {
        let (charge, discharge) = previous
            .map(|t| (t.charge_total, t.discharge_total))
            .unwrap_or_default();
        Self {
            charge: current.charge_total.saturating_sub(charge),
            discharge: current.discharge_total.saturating_sub(discharge),
        }
    }
}

/// Read-only result of a completed cycle.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Snapshot {
    pub telemetry: Telemetry,
    pub energy: BTreeMap<u8, EnergyDelta>,
    pub completed_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_by_battery_type() {
        assert_eq!(
            PackGeometry::counts(1, BatteryFamily::Hvs, 3),
            Some((48, 24))
        );
        assert_eq!(
            PackGeometry::counts(2, BatteryFamily::Hvs, 2),
            Some((64, 24))
        );
        assert_eq!(PackGeometry::counts(7, BatteryFamily::Hvs, 2), None);
    }

    #[test]
    fn geometry_lvs_overrides_type() {
        assert_eq!(
            PackGeometry::counts(1, BatteryFamily::Lvs, 4),
            Some((28, 0))
        );
        assert_eq!(
            PackGeometry::counts(9, BatteryFamily::Lvs, 4),
            Some((28, 0))
        );
    }

    #[test]
    fn family_and_grid_bytes() {
        assert_eq!(BatteryFamily::from_byte(51), BatteryFamily::Hvs);
        assert_eq!(BatteryFamily::from_byte(49), BatteryFamily::Lvs);
        assert_eq!(BatteryFamily::from_byte(50), BatteryFamily::Lvs);
        assert_eq!(BatteryFamily::from_byte(0), BatteryFamily::Unknown);
        assert_eq!(GridMode::from_byte(2), GridMode::Backup);
        assert_eq!(GridMode::from_byte(9), GridMode::Unknown);
    }

    #[test]
    fn energy_delta_against_previous_cycle() {
        let previous = Tower {
            charge_total: 100,
            discharge_total: 80,
            ..Default::default()
        };
        let current = Tower {
            charge_total: 130,
            discharge_total: 70,
            ..Default::default()
        };
        assert_eq!(
            EnergyDelta::between(Some(&previous), &current),
            EnergyDelta {
                charge: 30,
                discharge: 0
            }
        );
        assert_eq!(
            EnergyDelta::between(None, &current),
            EnergyDelta {
                charge: 130,
                discharge: 70
            }
        );
    }
}
