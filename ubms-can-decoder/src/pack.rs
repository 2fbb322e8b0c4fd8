//! Derivation of pack-level quantities from the decoded battery state.

use std::time::Instant;

use crate::battery::{UbmsBattery, CELLS_PER_MODULE};

/// Position of a cell inside the pack, zero-based.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CellLocation {
    pub module: usize,
    pub cell: usize,
}

impl CellLocation {
    /// One-based label, e.g. module 2 cell 1 is `"M3C2"`.
    pub fn label(&self) -> String {
        format!("M{}C{}", self.module + 1, self.cell + 1)
    }
}

/// Pack-level quantities derived from one state snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PackSummary {
    /// Sum of the series modules, or `None` while any of them still has an
    /// unreported cell; the publisher then keeps its last good value
    pub pack_voltage_v: Option<f64>,
    pub min_cell_millivolts: u16,
    pub max_cell_millivolts: u16,
    pub min_cell_location: CellLocation,
    pub max_cell_location: CellLocation,
    /// Number of cells with a non-zero reading
    pub cells_reported: usize,
    /// Sum over every reported cell of the whole pack, in volts
    pub cell_sum_v: f64,
    pub min_temperature_c: f64,
    pub max_temperature_c: f64,
    pub min_temperature_location: CellLocation,
    pub max_temperature_location: CellLocation,
    /// Per-string series sums, in volts
    pub string_voltage_v: Vec<f64>,
}

/// Scan the battery state and derive the published pack quantities.
///
/// Cells at zero have not reported yet and never take part in any reduction.
/// Modules whose data has gone stale are skipped by the min/max scans until
/// they refresh, but keep contributing to the voltage sums.
pub fn summarize(battery: &UbmsBattery, now: Instant) -> PackSummary {
    let config = battery.config();
    let in_series = config.modules_in_series();

    let mut min_mv = u16::MAX;
    let mut max_mv = 0u16;
    let mut min_at = CellLocation::default();
    let mut max_at = CellLocation::default();
    let mut reported = 0usize;
    let mut sum_mv = 0u64;

    for (m, cells) in battery.cell_millivolts().iter().enumerate() {
        let stale = battery.module_is_stale(m, now);
        for (c, &mv) in cells.iter().enumerate() {
            if mv == 0 {
                continue;
            }
            reported += 1;
            sum_mv += mv as u64;
            if stale {
                continue;
            }
            if mv < min_mv {
                min_mv = mv;
                min_at = CellLocation { module: m, cell: c };
            }
            if mv > max_mv {
                max_mv = mv;
                max_at = CellLocation { module: m, cell: c };
            }
        }
    }
    if min_mv == u16::MAX {
        min_mv = 0;
    }

    let series_complete = (0..in_series).all(|m| {
        battery.cell_millivolts()[m]
            .iter()
            .all(|&mv| mv != 0)
    });
    let pack_voltage_v = series_complete.then(|| {
        battery.module_voltage_mv()[..in_series]
            .iter()
            .map(|&mv| mv as f64)
            .sum::<f64>()
            / 1000.0
    });

    let string_voltage_v = (0..config.number_of_strings)
        .map(|s| {
            battery.module_voltage_mv()[s * in_series..(s + 1) * in_series]
                .iter()
                .map(|&mv| mv as f64)
                .sum::<f64>()
                / 1000.0
        })
        .collect();

    let (min_temperature_c, min_temperature_location, max_temperature_c, max_temperature_location) =
        temperature_extremes(battery, now);

    PackSummary {
        pack_voltage_v,
        min_cell_millivolts: min_mv,
        max_cell_millivolts: max_mv,
        min_cell_location: min_at,
        max_cell_location: max_at,
        cells_reported: reported,
        cell_sum_v: sum_mv as f64 / 1000.0,
        min_temperature_c,
        max_temperature_c,
        min_temperature_location,
        max_temperature_location,
        string_voltage_v,
    }
}

/// Module temperature scan when the fan-out is wired, otherwise the
/// BMS-reported pack extremes located at the pack origin.
fn temperature_extremes(
    battery: &UbmsBattery,
    now: Instant,
) -> (f64, CellLocation, f64, CellLocation) {
    let config = battery.config();
    if config.has_module_temperatures {
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        let mut min_at = CellLocation::default();
        let mut max_at = CellLocation::default();
        let mut seen = false;
        for (m, temperature) in battery.module_temperature_c().iter().enumerate() {
            let Some(t) = *temperature else { continue };
            if battery.module_is_stale(m, now) {
                continue;
            }
            seen = true;
            if t < min {
                min = t;
                min_at = CellLocation { module: m, cell: 0 };
            }
            if t > max {
                max = t;
                max_at = CellLocation { module: m, cell: 0 };
            }
        }
        if seen {
            return (min, min_at, max, max_at);
        }
    }
    (
        battery.min_cell_temperature_c as f64,
        CellLocation::default(),
        battery.max_cell_temperature_c as f64,
        CellLocation::default(),
    )
}

/// Flat one-based cell index used by the per-cell bus paths.
pub fn cell_index(location: CellLocation) -> usize {
    location.module * CELLS_PER_MODULE + location.cell + 1
}
