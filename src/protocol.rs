use crate::telemetry::{BatteryFamily, GridMode, PackGeometry, PackIdentity, PackMeasurement, Tower};
use crate::{Error, Result};
use crc::{Crc, CRC_16_MODBUS};
use std::time::Duration;

pub const DEVICE_ADDRESS: u8 = 0x01;

/// Deadline for a single request/response exchange.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause after every successful exchange, the BMU drops requests that arrive too fast.
pub const MESSAGE_DELAY: Duration = Duration::from_millis(200);
/// Time the BMU needs to sweep all cells after a start-measuring request.
pub const SETTLE_DELAY: Duration = Duration::from_secs(3);

const READ_HOLDING_REGISTERS: u8 = 0x03;
const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
const EXCEPTION_FLAG: u8 = 0x80;
const CRC_LENGTH: usize = 2;
const MAX_WRITE_REGISTERS: usize = 123;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// MODBUS CRC-16 (polynomial 0xA001 reflected, seed 0xFFFF).
pub fn crc16(buffer: &[u8]) -> u16 {
    CRC_MODBUS.checksum(buffer)
}

/// Appends the CRC-16 of `frame`, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Checks the trailing checksum of a reply and rejects MODBUS exception replies.
pub fn validate_frame(buffer: &[u8]) -> Result<()> {
    if buffer.len() <= CRC_LENGTH {
        log::warn!("Invalid reply size - received={}", buffer.len());
        return Err(Error::ReplySize(buffer.len()));
    }
    let (body, tail) = buffer.split_at(buffer.len() - CRC_LENGTH);
    let calculated = crc16(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if calculated != received {
        log::warn!(
            "Invalid checksum - calculated={:04X} received={:04X} buffer={:02X?}",
            calculated,
            received,
            buffer
        );
        return Err(Error::ChecksumMismatch {
            calculated,
            received,
        });
    }
    if body.len() >= 3 && body[1] & EXCEPTION_FLAG != 0 {
        let function = body[1] & !EXCEPTION_FLAG;
        let code = body[2];
        log::warn!("Exception reply - function={:02X} code={:02X}", function, code);
        return Err(Error::Exception { function, code });
    }
    Ok(())
}

/// Length of the complete reply once its header is known, `None` while the header is
/// incomplete or the function code is not one this protocol uses.
pub fn expected_reply_len(header: &[u8]) -> Option<usize> {
    let function = *header.get(1)?;
    if function & EXCEPTION_FLAG != 0 {
        return Some(5);
    }
    match function {
        READ_HOLDING_REGISTERS => header.get(2).map(|n| 3 + usize::from(*n) + CRC_LENGTH),
        WRITE_MULTIPLE_REGISTERS => Some(8),
        _ => None,
    }
}

fn read_registers(start: u16, count: u16) -> Vec<u8> {
    let mut tx_buffer = vec![DEVICE_ADDRESS, READ_HOLDING_REGISTERS];
    tx_buffer.extend_from_slice(&start.to_be_bytes());
    tx_buffer.extend_from_slice(&count.to_be_bytes());
    append_crc(&mut tx_buffer);
    tx_buffer
}

fn write_registers(start: u16, values: &[u16]) -> Result<Vec<u8>> {
    if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
        return Err(Error::MalformedRequest("register count out of range"));
    }
    let count = values.len() as u16;
    let mut tx_buffer = vec![DEVICE_ADDRESS, WRITE_MULTIPLE_REGISTERS];
    tx_buffer.extend_from_slice(&start.to_be_bytes());
    tx_buffer.extend_from_slice(&count.to_be_bytes());
    tx_buffer.push((values.len() * 2) as u8);
    for value in values {
        tx_buffer.extend_from_slice(&value.to_be_bytes());
    }
    append_crc(&mut tx_buffer);
    Ok(tx_buffer)
}

/// Requests understood by the BMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Identity,
    Measurement,
    Geometry,
    /// Starts the cell sweep of one tower (0-based).
    StartMeasuring {
        tower: u8,
    },
    MeasuringProgress,
    /// Reads the next page of tower details, the device advances the page on every read.
    TowerDetail,
}

impl Request {
    pub fn frame(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Request::Identity => read_registers(0x0000, 0x66),
            Request::Measurement => read_registers(0x0500, 0x19),
            Request::Geometry => read_registers(0x0010, 0x03),
            Request::StartMeasuring { tower } => {
                write_registers(0x0550, &[u16::from(*tower) + 1, 0x8100])?
            }
            Request::MeasuringProgress => read_registers(0x0551, 0x01),
            Request::TowerDetail => read_registers(0x0558, 0x41),
        })
    }
}

/// Device flavour. The HVS exporter always reports a single tower, the HVM one reads the
/// tower count from the identity reply and walks every tower.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Variant {
    #[default]
    SingleTower,
    MultiTower,
}

impl Variant {
    pub fn tower_count(&self, identity: &PackIdentity) -> u8 {
        match self {
            Variant::SingleTower => 1,
            Variant::MultiTower => identity.towers.unwrap_or(1).max(1),
        }
    }
}

/// Signed big-endian 16-bit word at `pos`.
pub fn read_i16(buffer: &[u8], pos: usize) -> Option<i16> {
    let b = buffer.get(pos..pos + 2)?;
    Some(i16::from_be_bytes([b[0], b[1]]))
}

/// Unsigned 32-bit value stored as two big-endian words, low word first.
pub fn read_u32_swapped(buffer: &[u8], pos: usize) -> Option<u32> {
    let b = buffer.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([b[2], b[3], b[0], b[1]]))
}

pub fn count_set_bits(buffer: &[u8]) -> u32 {
    buffer.iter().map(|b| b.count_ones()).sum()
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    U8,
    I16,
    U32Swapped,
}

/// Location and encoding of a value inside a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub encoding: Encoding,
    pub divisor: u32,
    pub decimals: i32,
}

impl Field {
    pub const fn byte(offset: usize) -> Self {
        Self {
            offset,
            encoding: Encoding::U8,
            divisor: 1,
            decimals: 0,
        }
    }

    pub const fn i16(offset: usize) -> Self {
        Self {
            offset,
            encoding: Encoding::I16,
            divisor: 1,
            decimals: 0,
        }
    }

    pub const fn u32_swapped(offset: usize) -> Self {
        Self {
            offset,
            encoding: Encoding::U32Swapped,
            divisor: 1,
            decimals: 0,
        }
    }

    pub const fn scaled(self, divisor: u32, decimals: i32) -> Self {
        Self {
            divisor,
            decimals,
            ..self
        }
    }

    /// Unscaled integer, `None` if the buffer ends before the field.
    pub fn raw(&self, buffer: &[u8]) -> Option<i64> {
        match self.encoding {
            Encoding::U8 => buffer.get(self.offset).map(|b| i64::from(*b)),
            Encoding::I16 => read_i16(buffer, self.offset).map(i64::from),
            Encoding::U32Swapped => read_u32_swapped(buffer, self.offset).map(i64::from),
        }
    }

    pub fn value(&self, buffer: &[u8]) -> Option<f64> {
        self.raw(buffer)
            .map(|raw| round_to(raw as f64 / f64::from(self.divisor), self.decimals))
    }

    fn set<T: TryFrom<i64>>(&self, buffer: &[u8], target: &mut T) {
        if let Some(value) = self.raw(buffer).and_then(|raw| T::try_from(raw).ok()) {
            *target = value;
        }
    }

    fn set_scaled(&self, buffer: &[u8], target: &mut f64) {
        if let Some(value) = self.value(buffer) {
            *target = value;
        }
    }
}

/// Byte offsets of every value this crate decodes. Offsets count from the address byte.
pub mod fields {
    pub mod identity {
        use super::super::Field;

        pub const SERIAL: std::ops::Range<usize> = 3..22;
        pub const FAMILY: Field = Field::byte(5);
        pub const BMU_A_MAJOR: Field = Field::byte(27);
        pub const BMU_A_MINOR: Field = Field::byte(28);
        pub const BMU_B_MAJOR: Field = Field::byte(29);
        pub const BMU_B_MINOR: Field = Field::byte(30);
        pub const BMS_MAJOR: Field = Field::byte(31);
        pub const BMS_MINOR: Field = Field::byte(32);
        pub const BMU_SELECTOR: Field = Field::byte(33);
        pub const BMS_SUFFIX: Field = Field::byte(34);
        pub const MODULES_TOWERS: Field = Field::byte(36);
        pub const GRID: Field = Field::byte(38);
    }

    pub mod measurement {
        use super::super::Field;

        pub const SOC: Field = Field::i16(3);
        pub const MAX_CELL_VOLTAGE: Field = Field::i16(5).scaled(100, 2);
        pub const MIN_CELL_VOLTAGE: Field = Field::i16(7).scaled(100, 2);
        pub const SOH: Field = Field::i16(9);
        pub const CURRENT: Field = Field::i16(11).scaled(10, 1);
        pub const VOLTAGE: Field = Field::u32_swapped(13).scaled(100, 1);
        pub const MAX_TEMPERATURE: Field = Field::i16(15);
        pub const MIN_TEMPERATURE: Field = Field::i16(17);
        pub const TEMPERATURE: Field = Field::i16(19);
    }

    pub mod geometry {
        use super::super::Field;

        pub const INVERTER_TYPE: Field = Field::byte(3);
        pub const BATTERY_TYPE: Field = Field::byte(5);
    }

    pub mod tower {
        use super::super::Field;

        pub const MAX_CELL_VOLTAGE: Field = Field::i16(5);
        pub const MIN_CELL_VOLTAGE: Field = Field::i16(7);
        pub const MAX_CELL_VOLTAGE_INDEX: Field = Field::byte(9);
        pub const MIN_CELL_VOLTAGE_INDEX: Field = Field::byte(10);
        pub const MAX_TEMPERATURE_INDEX: Field = Field::byte(15);
        pub const MIN_TEMPERATURE_INDEX: Field = Field::byte(16);
        pub const BALANCING: std::ops::Range<usize> = 17..33;
        pub const CHARGE_TOTAL: Field = Field::u32_swapped(33);
        pub const DISCHARGE_TOTAL: Field = Field::u32_swapped(37);
        pub const VOLTAGE: Field = Field::i16(45);
        pub const OUTPUT_VOLTAGE: Field = Field::i16(51);
        pub const SOC_DIAGNOSIS: Field = Field::i16(53).scaled(10, 1);
        pub const SOH: Field = Field::i16(55);
        pub const STATE_HIGH: Field = Field::byte(59);
        pub const STATE_LOW: Field = Field::byte(60);
    }
}

/// A run of cell or temperature slots carried by one tower detail page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRange {
    /// 1-based index of the first slot.
    pub first: u16,
    pub offset: usize,
    /// Most slots this page can carry.
    pub cap: u16,
    /// Bytes per slot.
    pub width: usize,
}

impl SlotRange {
    const fn cells(first: u16, offset: usize, cap: u16) -> Self {
        Self {
            first,
            offset,
            cap,
            width: 2,
        }
    }

    const fn temperatures(first: u16, offset: usize, cap: u16) -> Self {
        Self {
            first,
            offset,
            cap,
            width: 1,
        }
    }

    /// Number of slots to read, bounded by the pack `total` and by the bytes present.
    pub fn count(&self, total: u16, payload_len: usize) -> u16 {
        let wanted = total.saturating_sub(self.first - 1).min(self.cap);
        let available = payload_len.saturating_sub(self.offset) / self.width;
        wanted.min(u16::try_from(available).unwrap_or(u16::MAX))
    }

    /// `(slot index, byte position)` pairs to read.
    pub fn slots(&self, total: u16, payload_len: usize) -> impl Iterator<Item = (u16, usize)> {
        let range = *self;
        (0..range.count(total, payload_len))
            .map(move |i| (range.first + i, range.offset + usize::from(i) * range.width))
    }
}

pub const CELLS_SUMMARY: SlotRange = SlotRange::cells(1, 101, 16);
pub const CELLS_LOW: SlotRange = SlotRange::cells(17, 5, 64);
pub const CELLS_HIGH: SlotRange = SlotRange::cells(81, 5, 48);
pub const CELLS_EXTENDED: SlotRange = SlotRange::cells(129, 101, 16);
pub const TEMPERATURES_LOW: SlotRange = SlotRange::temperatures(1, 103, 30);
pub const TEMPERATURES_HIGH: SlotRange = SlotRange::temperatures(31, 5, 34);

/// Pages returned by consecutive [`Request::TowerDetail`] reads, in device order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailPage {
    Summary,
    Cells,
    CellsAndTemperatures,
    Temperatures,
    ExtendedCells,
}

impl DetailPage {
    pub fn next(&self) -> Option<Self> {
        match self {
            DetailPage::Summary => Some(DetailPage::Cells),
            DetailPage::Cells => Some(DetailPage::CellsAndTemperatures),
            DetailPage::CellsAndTemperatures => Some(DetailPage::Temperatures),
            DetailPage::Temperatures => Some(DetailPage::ExtendedCells),
            DetailPage::ExtendedCells => None,
        }
    }

    pub fn decode(&self, rx_buffer: &[u8], geometry: &PackGeometry, tower: &mut Tower) {
        match self {
            DetailPage::Summary => decode_tower_summary(rx_buffer, geometry, tower),
            DetailPage::Cells => decode_cells(rx_buffer, &CELLS_LOW, geometry, tower),
            DetailPage::CellsAndTemperatures => {
                decode_cells(rx_buffer, &CELLS_HIGH, geometry, tower);
                decode_temperatures(rx_buffer, &TEMPERATURES_LOW, geometry, tower);
            }
            DetailPage::Temperatures => {
                decode_temperatures(rx_buffer, &TEMPERATURES_HIGH, geometry, tower)
            }
            DetailPage::ExtendedCells => decode_cells(rx_buffer, &CELLS_EXTENDED, geometry, tower),
        }
    }
}

fn payload(rx_buffer: &[u8]) -> &[u8] {
    &rx_buffer[..rx_buffer.len().saturating_sub(CRC_LENGTH)]
}

pub fn decode_identity(rx_buffer: &[u8], variant: Variant, identity: &mut PackIdentity) {
    use fields::identity::*;
    let buffer = payload(rx_buffer);

    if let Some(serial) = buffer.get(SERIAL) {
        identity.serial = serial.iter().map(|b| char::from(*b)).collect();
    }
    if let Some(family) = buffer.get(FAMILY.offset) {
        identity.family = BatteryFamily::from_byte(*family);
    }
    let version = |major: Field, minor: Field| -> Option<String> {
        Some(format!("V{}.{}", major.raw(buffer)?, minor.raw(buffer)?))
    };
    if let (Some(bmu_a), Some(bmu_b), Some(selector)) = (
        version(BMU_A_MAJOR, BMU_A_MINOR),
        version(BMU_B_MAJOR, BMU_B_MINOR),
        BMU_SELECTOR.raw(buffer),
    ) {
        identity.bmu = if selector == 0 {
            format!("{bmu_a}-A")
        } else {
            format!("{bmu_b}-B")
        };
        identity.bmu_a = bmu_a;
        identity.bmu_b = bmu_b;
    }
    if let (Some(bms), Some(suffix)) = (
        version(BMS_MAJOR, BMS_MINOR),
        buffer.get(BMS_SUFFIX.offset),
    ) {
        identity.bms = format!("{bms}-{}", char::from(suffix.wrapping_add(b'A')));
    }
    if let Some(byte) = buffer.get(MODULES_TOWERS.offset) {
        identity.modules = byte % 16;
        identity.towers = match variant {
            Variant::SingleTower => None,
            Variant::MultiTower => Some(byte / 16),
        };
    }
    if let Some(grid) = buffer.get(GRID.offset) {
        identity.grid = GridMode::from_byte(*grid);
    }
    log::debug!("Identity: {:?}", identity);
}

pub fn decode_measurement(rx_buffer: &[u8], measurement: &mut PackMeasurement) {
    use fields::measurement::*;
    let buffer = payload(rx_buffer);

    SOC.set(buffer, &mut measurement.soc);
    MAX_CELL_VOLTAGE.set_scaled(buffer, &mut measurement.max_cell_voltage);
    MIN_CELL_VOLTAGE.set_scaled(buffer, &mut measurement.min_cell_voltage);
    SOH.set(buffer, &mut measurement.soh);
    CURRENT.set_scaled(buffer, &mut measurement.current);
    VOLTAGE.set_scaled(buffer, &mut measurement.voltage);
    MAX_TEMPERATURE.set(buffer, &mut measurement.max_temperature);
    MIN_TEMPERATURE.set(buffer, &mut measurement.min_temperature);
    TEMPERATURE.set(buffer, &mut measurement.temperature);
    log::debug!("Measurement: {:?}", measurement);
}

/// Derives cell and sensor counts. An unknown battery type keeps the previous counts.
pub fn decode_geometry(rx_buffer: &[u8], identity: &PackIdentity, geometry: &mut PackGeometry) {
    use fields::geometry::*;
    let buffer = payload(rx_buffer);

    INVERTER_TYPE.set(buffer, &mut geometry.inverter_type);
    let Some(battery_type) = buffer.get(BATTERY_TYPE.offset).copied() else {
        return;
    };
    geometry.battery_type = battery_type;
    match PackGeometry::counts(battery_type, identity.family, identity.modules) {
        Some((cells, temperatures)) => {
            geometry.cells = cells;
            geometry.temperatures = temperatures;
        }
        None => log::warn!(
            "Unknown battery type {} - keeping cells={} temperatures={}",
            battery_type,
            geometry.cells,
            geometry.temperatures
        ),
    }
    log::debug!("Geometry: {:?}", geometry);
}

pub fn decode_tower_summary(rx_buffer: &[u8], geometry: &PackGeometry, tower: &mut Tower) {
    use fields::tower::*;
    let buffer = payload(rx_buffer);

    MAX_CELL_VOLTAGE.set(buffer, &mut tower.max_cell_voltage);
    MIN_CELL_VOLTAGE.set(buffer, &mut tower.min_cell_voltage);
    MAX_CELL_VOLTAGE_INDEX.set(buffer, &mut tower.max_cell_voltage_index);
    MIN_CELL_VOLTAGE_INDEX.set(buffer, &mut tower.min_cell_voltage_index);
    MAX_TEMPERATURE_INDEX.set(buffer, &mut tower.max_temperature_index);
    MIN_TEMPERATURE_INDEX.set(buffer, &mut tower.min_temperature_index);

    if let Some(bitmap) = buffer.get(BALANCING) {
        tower.balancing = bitmap.to_vec();
        tower.balancing_count = count_set_bits(bitmap);
    }
    if let (Some(charge), Some(discharge)) = (
        read_u32_swapped(buffer, CHARGE_TOTAL.offset),
        read_u32_swapped(buffer, DISCHARGE_TOTAL.offset),
    ) {
        tower.charge_total = charge;
        tower.discharge_total = discharge;
        tower.eta = if charge > 0 {
            f64::from(discharge) / f64::from(charge)
        } else {
            0.0
        };
    }
    VOLTAGE.set(buffer, &mut tower.voltage);
    OUTPUT_VOLTAGE.set(buffer, &mut tower.output_voltage);
    SOC_DIAGNOSIS.set_scaled(buffer, &mut tower.soc_diagnosis);
    SOH.set(buffer, &mut tower.soh);
    if let (Some(high), Some(low)) = (STATE_HIGH.raw(buffer), STATE_LOW.raw(buffer)) {
        tower.state = format!("{high:02x}{low:02x}");
    }

    decode_cells(rx_buffer, &CELLS_SUMMARY, geometry, tower);
}

pub fn decode_cells(rx_buffer: &[u8], range: &SlotRange, geometry: &PackGeometry, tower: &mut Tower) {
    let buffer = payload(rx_buffer);
    for (cell, pos) in range.slots(geometry.cells, buffer.len()) {
        if let Some(voltage) = read_i16(buffer, pos) {
            log::trace!("Cell #{} mV={}", cell, voltage);
            tower.cell_voltages.insert(cell, voltage);
        }
    }
}

pub fn decode_temperatures(
    rx_buffer: &[u8],
    range: &SlotRange,
    geometry: &PackGeometry,
    tower: &mut Tower,
) {
    let buffer = payload(rx_buffer);
    for (group, pos) in range.slots(geometry.temperatures, buffer.len()) {
        if let Some(temperature) = buffer.get(pos) {
            log::trace!("Cell group #{} °C={}", group, temperature);
            tower.cell_temperatures.insert(group, *temperature);
        }
    }
}
