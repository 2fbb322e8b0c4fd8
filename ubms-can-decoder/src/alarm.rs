//! Threshold-based alarm derivation.
//!
//! The alarm vector is recomputed from scratch on every publish tick; the
//! relay edge detection against the previous tick lives with the publisher.

use crate::battery::UbmsBattery;
use crate::pack::PackSummary;

/// Alarm thresholds, fixed at startup. Every field can be overridden from
/// the command line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmThresholds {
    pub min_cell_millivolts: u16,
    pub max_cell_millivolts: u16,
    pub cell_imbalance_millivolts: u16,
    pub max_cell_temperature_c: f64,
    pub min_cell_temperature_c: f64,
    pub max_charge_current_a: f64,
    pub max_discharge_current_a: f64,
    pub min_soc_pct: u8,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            min_cell_millivolts: 2700,
            max_cell_millivolts: 3600,
            cell_imbalance_millivolts: 50,
            max_cell_temperature_c: 55.0,
            min_cell_temperature_c: 0.0,
            max_charge_current_a: 100.0,
            max_discharge_current_a: 100.0,
            min_soc_pct: 5,
        }
    }
}

/// One evaluated alarm vector. Published as 0/1 per alarm path.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Alarms {
    pub low_cell_voltage: bool,
    pub high_cell_voltage: bool,
    pub cell_imbalance: bool,
    pub low_soc: bool,
    pub high_charge_current: bool,
    pub high_discharge_current: bool,
    pub low_temperature: bool,
    pub high_temperature: bool,
    pub internal_failure: bool,
}

impl Alarms {
    pub fn any(&self) -> bool {
        self.low_cell_voltage
            || self.high_cell_voltage
            || self.cell_imbalance
            || self.low_soc
            || self.high_charge_current
            || self.high_discharge_current
            || self.low_temperature
            || self.high_temperature
            || self.internal_failure
    }
}

/// Evaluate the alarm vector for one snapshot.
///
/// Voltage and SoC alarms only arm once the pack has actually reported:
/// an untouched state (all cells zero, no status frame yet) asserts nothing.
pub fn evaluate(
    thresholds: &AlarmThresholds,
    battery: &UbmsBattery,
    summary: &PackSummary,
) -> Alarms {
    // zero minimum means no usable cell reading at all
    let cells_known = summary.min_cell_millivolts != 0;
    let current = battery.current_a as f64;
    Alarms {
        low_cell_voltage: cells_known && summary.min_cell_millivolts < thresholds.min_cell_millivolts,
        high_cell_voltage: summary.max_cell_millivolts > thresholds.max_cell_millivolts,
        cell_imbalance: cells_known
            && summary.max_cell_millivolts - summary.min_cell_millivolts
                > thresholds.cell_imbalance_millivolts,
        low_soc: battery.handshake().saw_status() && battery.soc < thresholds.min_soc_pct,
        high_charge_current: current > thresholds.max_charge_current_a,
        high_discharge_current: current.abs() > thresholds.max_discharge_current_a,
        low_temperature: summary.min_temperature_c < thresholds.min_cell_temperature_c,
        high_temperature: summary.max_temperature_c > thresholds.max_cell_temperature_c,
        internal_failure: battery.internal_errors != 0,
    }
}
