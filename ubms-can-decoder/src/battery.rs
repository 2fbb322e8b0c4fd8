//! In-memory model of one U-BMS battery pack.
//!
//! All mutation happens in [`UbmsBattery::apply`]; everything else is
//! read-only access for the aggregation and publishing side.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::{DecodeError, UbmsFrame};

/// Cells per module is fixed by the U-BMS hardware.
pub const CELLS_PER_MODULE: usize = 4;

/// Coded operating state reported on the bus while in standby.
const STATE_STANDBY: u8 = 14;
/// Coded operating state reported on the bus while charging or driving.
const STATE_ACTIVE: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{modules} modules cannot be split into {strings} equal strings")]
    ModulesNotDivisible { modules: usize, strings: usize },
    #[error("need at least one string and at least as many modules as strings")]
    TooSmall,
}

/// Immutable pack geometry and ratings, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackConfig {
    pub number_of_modules: usize,
    pub number_of_strings: usize,
    pub capacity_ah: f64,
    pub max_charge_voltage: f64,
    /// Whether the per-module temperature fan-out (0x76A..) is wired up
    pub has_module_temperatures: bool,
}

impl PackConfig {
    pub fn new(
        number_of_modules: usize,
        number_of_strings: usize,
        capacity_ah: f64,
        max_charge_voltage: f64,
    ) -> Result<Self, ConfigError> {
        if number_of_strings < 1 || number_of_modules < number_of_strings {
            return Err(ConfigError::TooSmall);
        }
        if number_of_modules % number_of_strings != 0 {
            return Err(ConfigError::ModulesNotDivisible {
                modules: number_of_modules,
                strings: number_of_strings,
            });
        }
        Ok(Self {
            number_of_modules,
            number_of_strings,
            capacity_ah,
            max_charge_voltage,
            has_module_temperatures: true,
        })
    }

    pub fn modules_in_series(&self) -> usize {
        self.number_of_modules / self.number_of_strings
    }

    pub fn cell_count(&self) -> usize {
        self.number_of_modules * CELLS_PER_MODULE
    }

    /// The BMS refreshes three modules per 0.6 s slot, so a full sweep of the
    /// pack takes this long.
    pub fn expected_module_period(&self) -> Duration {
        Duration::from_millis(600) * self.number_of_modules.div_ceil(3) as u32
    }
}

/// Operational mode as commanded to, and reported by, the BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpMode {
    Standby = 0,
    Charge = 1,
    Drive = 2,
}

impl OpMode {
    /// Low two bits of the raw status mode byte.
    pub fn from_status_byte(mode: u8) -> Option<Self> {
        match mode & 0x03 {
            0 => Some(OpMode::Standby),
            1 => Some(OpMode::Charge),
            2 => Some(OpMode::Drive),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Charge and drive may only be entered from standby; no direct
    /// charge/drive flips.
    pub fn can_switch_to(self, next: OpMode) -> bool {
        self == next || self == OpMode::Standby || next == OpMode::Standby
    }
}

impl TryFrom<u8> for OpMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(OpMode::Standby),
            1 => Ok(OpMode::Charge),
            2 => Ok(OpMode::Drive),
            other => Err(other),
        }
    }
}

/// Tracks which of the three identifying frames have been observed since
/// startup. Advisory: decoding continues even while incomplete.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    bits: u8,
}

impl Handshake {
    pub const SAW_CURRENT: u8 = 0x01;
    pub const SAW_STATUS: u8 = 0x02;
    pub const SAW_FIRMWARE: u8 = 0x04;

    fn note(&mut self, bit: u8) {
        self.bits |= bit;
    }

    pub fn bits(&self) -> u8 {
        self.bits
    }

    pub fn complete(&self) -> bool {
        self.bits == Self::SAW_CURRENT | Self::SAW_STATUS | Self::SAW_FIRMWARE
    }

    pub fn saw_status(&self) -> bool {
        self.bits & Self::SAW_STATUS != 0
    }
}

/// The decoded state of one pack. Zero cell millivolts mean "not yet
/// reported" and are excluded from every reduction.
#[derive(Debug, Clone, PartialEq)]
pub struct UbmsBattery {
    config: PackConfig,

    pub soc: u8,
    /// Raw mode byte from the status frame; the low two bits select the
    /// operational mode, the high bits qualify charge-parameter frames
    pub mode: u8,
    op_mode: OpMode,
    pub bms_state: u8,
    pub current_a: i16,

    pub voltage_and_cell_t_alarms: u8,
    pub internal_errors: u8,
    pub current_and_pcb_t_alarms: u8,
    pub shutdown_reason: u8,
    pub modules_communicating: u8,
    pub modules_balancing: u8,
    /// Module count adopted from a clean status frame
    pub reported_module_count: Option<u8>,

    pub charge_complete: bool,
    pub max_charge_current_a: f64,
    pub max_discharge_current_a: f64,
    pub max_charge_voltage_raw: u16,

    pub max_cell_temperature_c: i16,
    pub min_cell_temperature_c: i16,
    pub max_pcb_temperature_c: i16,
    pub reported_max_cell_millivolts: u16,
    pub reported_min_cell_millivolts: u16,

    pub firmware_version: u8,
    pub bms_type: u8,
    pub hw_rev: u8,

    cell_millivolts: Vec<[u16; CELLS_PER_MODULE]>,
    module_voltage_mv: Vec<u32>,
    module_soc: Vec<u8>,
    module_current_raw: Vec<Option<i16>>,
    module_temperature_c: Vec<Option<f64>>,
    pack_voltage_mv: u32,

    handshake: Handshake,
    last_frame: Option<Instant>,
    module_updated: Vec<Option<Instant>>,
}

impl UbmsBattery {
    pub fn new(config: PackConfig) -> Self {
        let n = config.number_of_modules;
        Self {
            config,
            soc: 0,
            mode: 0,
            op_mode: OpMode::Standby,
            bms_state: STATE_STANDBY,
            current_a: 0,
            voltage_and_cell_t_alarms: 0,
            internal_errors: 0,
            current_and_pcb_t_alarms: 0,
            shutdown_reason: 0,
            modules_communicating: 0,
            modules_balancing: 0,
            reported_module_count: None,
            charge_complete: false,
            max_charge_current_a: 0.0,
            max_discharge_current_a: 0.0,
            max_charge_voltage_raw: 0,
            max_cell_temperature_c: 0,
            min_cell_temperature_c: 0,
            max_pcb_temperature_c: 0,
            reported_max_cell_millivolts: 0,
            reported_min_cell_millivolts: 0,
            firmware_version: 0,
            bms_type: 0,
            hw_rev: 0,
            cell_millivolts: vec![[0; CELLS_PER_MODULE]; n],
            module_voltage_mv: vec![0; n],
            module_soc: vec![0; n],
            module_current_raw: vec![None; n],
            module_temperature_c: vec![None; n],
            pack_voltage_mv: 0,
            handshake: Handshake::default(),
            last_frame: None,
            module_updated: vec![None; n],
        }
    }

    pub fn config(&self) -> &PackConfig {
        &self.config
    }

    pub fn op_mode(&self) -> OpMode {
        self.op_mode
    }

    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    pub fn cell_millivolts(&self) -> &[[u16; CELLS_PER_MODULE]] {
        &self.cell_millivolts
    }

    pub fn module_voltage_mv(&self) -> &[u32] {
        &self.module_voltage_mv
    }

    pub fn module_soc(&self) -> &[u8] {
        &self.module_soc
    }

    pub fn module_current_raw(&self) -> &[Option<i16>] {
        &self.module_current_raw
    }

    pub fn module_temperature_c(&self) -> &[Option<f64>] {
        &self.module_temperature_c
    }

    /// Pack voltage as recomputed on the cell-carrier boundary of the last
    /// module in series.
    pub fn pack_voltage_v(&self) -> f64 {
        self.pack_voltage_mv as f64 / 1000.0
    }

    pub fn last_frame(&self) -> Option<Instant> {
        self.last_frame
    }

    pub fn module_updated(&self, module: usize) -> Option<Instant> {
        self.module_updated.get(module).copied().flatten()
    }

    /// Fresh frames within the timeout keep the pack "connected".
    pub fn connected(&self, now: Instant, timeout: Duration) -> bool {
        match self.last_frame {
            Some(at) => now.duration_since(at) < timeout,
            None => false,
        }
    }

    /// A module is stale once its last refresh is older than twice the
    /// expected sweep period. Never-reported modules are not stale, they are
    /// simply absent from every reduction.
    pub fn module_is_stale(&self, module: usize, now: Instant) -> bool {
        match self.module_updated.get(module).copied().flatten() {
            Some(at) => now.duration_since(at) > 2 * self.config.expected_module_period(),
            None => false,
        }
    }

    /// Apply one classified frame. On error the state keeps its previous
    /// values for the rejected fields; fan-outs may be partially applied.
    pub fn apply(&mut self, frame: &UbmsFrame, now: Instant) -> Result<(), DecodeError> {
        self.last_frame = Some(now);
        match frame {
            UbmsFrame::Status {
                soc,
                mode,
                voltage_and_cell_t_alarms,
                internal_errors,
                current_and_pcb_t_alarms,
                modules_communicating,
                modules_balancing,
                shutdown_reason,
            } => {
                self.handshake.note(Handshake::SAW_STATUS);
                self.soc = *soc;
                self.mode = *mode;
                if let Some(op) = OpMode::from_status_byte(*mode) {
                    self.op_mode = op;
                    self.bms_state = match op {
                        OpMode::Standby => STATE_STANDBY,
                        OpMode::Charge | OpMode::Drive => STATE_ACTIVE,
                    };
                }
                self.voltage_and_cell_t_alarms = *voltage_and_cell_t_alarms;
                self.internal_errors = *internal_errors;
                self.current_and_pcb_t_alarms = *current_and_pcb_t_alarms;
                self.modules_communicating = *modules_communicating;
                self.modules_balancing = *modules_balancing;
                self.shutdown_reason = *shutdown_reason;
                // A clean status frame is authoritative for the module count
                if voltage_and_cell_t_alarms & 0x01 == 0 && internal_errors & 0x02 == 0 {
                    self.reported_module_count = Some(*modules_communicating);
                }
                Ok(())
            }
            UbmsFrame::CurrentAndLimits {
                current_a,
                drive_limits,
                ..
            } => {
                self.handshake.note(Handshake::SAW_CURRENT);
                self.current_a = *current_a as i16;
                if self.op_mode == OpMode::Drive {
                    if let Some(limits) = drive_limits {
                        self.max_discharge_current_a = limits.max_discharge_a as f64;
                        self.max_charge_current_a = limits.max_charge_a as f64;
                    }
                }
                Ok(())
            }
            UbmsFrame::ChargeParameters {
                charge_current_raw,
                max_charge_voltage_raw,
                charge_complete,
            } => {
                if self.op_mode == OpMode::Charge {
                    self.charge_complete = *charge_complete;
                    self.max_charge_voltage_raw = *max_charge_voltage_raw;
                    self.max_charge_current_a = if self.mode & 0x18 == 0x18 {
                        *charge_current_raw as f64
                    } else {
                        self.config.capacity_ah * 0.1
                    };
                }
                Ok(())
            }
            UbmsFrame::PackExtremes {
                max_cell_temperature_c,
                min_cell_temperature_c,
                max_pcb_temperature_c,
                max_cell_millivolts,
                min_cell_millivolts,
            } => {
                self.max_cell_temperature_c = *max_cell_temperature_c;
                self.min_cell_temperature_c = *min_cell_temperature_c;
                self.max_pcb_temperature_c = *max_pcb_temperature_c;
                self.reported_max_cell_millivolts = *max_cell_millivolts;
                self.reported_min_cell_millivolts = *min_cell_millivolts;
                Ok(())
            }
            UbmsFrame::Firmware {
                version,
                bms_type,
                hw_rev,
            } => {
                self.handshake.note(Handshake::SAW_FIRMWARE);
                self.firmware_version = *version;
                self.bms_type = *bms_type;
                self.hw_rev = *hw_rev;
                Ok(())
            }
            UbmsFrame::CellsOneToThree { module, millivolts } => {
                let m = self.check_module(*module)?;
                let mut first_error = None;
                for (cell, &mv) in millivolts.iter().enumerate() {
                    if let Err(e) = self.store_cell(m, cell, mv) {
                        first_error.get_or_insert(e);
                    }
                }
                self.refresh_module_voltage(m);
                self.module_updated[m] = Some(now);
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            UbmsFrame::CellFour { module, millivolts } => {
                let m = self.check_module(*module)?;
                let result = self.store_cell(m, CELLS_PER_MODULE - 1, *millivolts);
                self.refresh_module_voltage(m);
                self.module_updated[m] = Some(now);
                let in_series = self.config.modules_in_series();
                if m == in_series - 1 {
                    self.pack_voltage_mv = self.module_voltage_mv[..in_series].iter().sum();
                }
                result
            }
            UbmsFrame::ModuleSocs { first_module, raw } => {
                let mut first_error = None;
                for (i, &byte) in raw.iter().enumerate() {
                    let m = first_module + i;
                    if m >= self.config.number_of_modules {
                        first_error.get_or_insert(DecodeError::ModuleIndexOutOfRange {
                            module: m,
                            configured: self.config.number_of_modules,
                        });
                        break;
                    }
                    self.module_soc[m] = ((byte as u16 * 100) >> 8) as u8;
                    self.module_updated[m] = Some(now);
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            UbmsFrame::ModuleCurrents { first_module, raw } => {
                let mut first_error = None;
                for (i, &value) in raw.iter().enumerate() {
                    let m = first_module + i;
                    if m >= self.config.number_of_modules {
                        first_error.get_or_insert(DecodeError::ModuleIndexOutOfRange {
                            module: m,
                            configured: self.config.number_of_modules,
                        });
                        break;
                    }
                    self.module_current_raw[m] = Some(value);
                    self.module_updated[m] = Some(now);
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
            UbmsFrame::ModuleTemperatures { first_module, raw } => {
                let mut first_error = None;
                for (i, &word) in raw.iter().enumerate() {
                    let m = first_module + i;
                    if m >= self.config.number_of_modules {
                        first_error.get_or_insert(DecodeError::ModuleIndexOutOfRange {
                            module: m,
                            configured: self.config.number_of_modules,
                        });
                        break;
                    }
                    self.module_temperature_c[m] = Some(word as f64 * 0.01);
                    self.module_updated[m] = Some(now);
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    fn check_module(&self, module: usize) -> Result<usize, DecodeError> {
        if module < self.config.number_of_modules {
            Ok(module)
        } else {
            Err(DecodeError::ModuleIndexOutOfRange {
                module,
                configured: self.config.number_of_modules,
            })
        }
    }

    fn store_cell(&mut self, module: usize, cell: usize, millivolts: u16) -> Result<(), DecodeError> {
        if !(500..=5000).contains(&millivolts) {
            return Err(DecodeError::CellVoltageOutOfRange {
                module,
                cell,
                millivolts,
            });
        }
        self.cell_millivolts[module][cell] = millivolts;
        Ok(())
    }

    /// Module voltage is defined only while all four cells have reported.
    fn refresh_module_voltage(&mut self, module: usize) {
        let cells = &self.cell_millivolts[module];
        if cells.iter().all(|&mv| mv != 0) {
            self.module_voltage_mv[module] = cells.iter().map(|&mv| mv as u32).sum();
        }
    }
}
