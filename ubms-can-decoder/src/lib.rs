//! Decoder for the Valence U-BMS CAN protocol.
//!
//! Classification of a received [`CanFrame`] into a typed [`UbmsFrame`] is a
//! pure function; applying the frame to a [`battery::UbmsBattery`] performs
//! the stateful part (mode gating, plausibility checks, liveness). Unknown
//! ids classify to `Ok(None)` and are meant to be ignored by callers.

pub mod alarm;
pub mod battery;
pub mod can_frame;
pub mod pack;

use can_frame::CanFrame;
use thiserror::Error;

/// Base arbitration id of the per-module cell-voltage carriers.
pub const CELL_VOLTAGE_BASE: u16 = 0x350;
/// Base arbitration id of the per-module SoC fan-out (7 modules per frame).
pub const MODULE_SOC_BASE: u16 = 0x06A;
/// Base arbitration id of the per-module current fan-out (3 modules per frame).
pub const MODULE_CURRENT_BASE: u16 = 0x46A;
/// Base arbitration id of the per-module temperature fan-out (3 modules per frame).
pub const MODULE_TEMPERATURE_BASE: u16 = 0x76A;

/// A decode failure. Never fatal: the caller logs it and the battery state
/// keeps its previous values (partially applied fan-outs keep the slots that
/// did decode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame {id:#05X} too short: got {dlc} bytes, need {need}")]
    ShortFrame { id: u16, dlc: usize, need: usize },
    #[error("cell voltage {millivolts} mV implausible at module {module} cell {cell}, keeping previous")]
    CellVoltageOutOfRange {
        module: usize,
        cell: usize,
        millivolts: u16,
    },
    #[error("module index {module} outside configured pack of {configured} modules")]
    ModuleIndexOutOfRange { module: usize, configured: usize },
}

/// Charge/discharge current limits reported while driving (id 0x0C1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveLimits {
    pub max_discharge_a: i16,
    pub max_charge_a: i16,
}

/// One classified U-BMS frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UbmsFrame {
    /// 0x0C0: pack status, alarm flag bytes and module counts
    Status {
        soc: u8,
        mode: u8,
        voltage_and_cell_t_alarms: u8,
        internal_errors: u8,
        current_and_pcb_t_alarms: u8,
        modules_communicating: u8,
        modules_balancing: u8,
        shutdown_reason: u8,
    },
    /// 0x0C1: pack current, plus charge/discharge limits in drive mode
    CurrentAndLimits {
        /// Raw pack voltage byte, only consumed by the startup handshake
        pack_voltage_raw: u8,
        current_a: i8,
        drive_limits: Option<DriveLimits>,
    },
    /// 0x0C2: charge parameters, meaningful in charge mode only
    ChargeParameters {
        charge_current_raw: u8,
        max_charge_voltage_raw: u16,
        charge_complete: bool,
    },
    /// 0x0C4: BMS-reported pack extremes
    PackExtremes {
        max_cell_temperature_c: i16,
        min_cell_temperature_c: i16,
        max_pcb_temperature_c: i16,
        max_cell_millivolts: u16,
        min_cell_millivolts: u16,
    },
    /// 0x180: firmware and hardware identity
    Firmware { version: u8, bms_type: u8, hw_rev: u8 },
    /// Even 0x350..=0x36F: cells 1-3 of one module, big-endian millivolts
    CellsOneToThree { module: usize, millivolts: [u16; 3] },
    /// Odd 0x350..=0x36F: cell 4 of one module, big-endian millivolts
    CellFour { module: usize, millivolts: u16 },
    /// 0x06A..: raw SoC bytes for up to 7 consecutive modules
    ModuleSocs {
        first_module: usize,
        raw: heapless::Vec<u8, 7>,
    },
    /// 0x46A..: big-endian signed currents for up to 3 consecutive modules
    ModuleCurrents {
        first_module: usize,
        raw: heapless::Vec<i16, 3>,
    },
    /// 0x76A..: big-endian temperature words (x 0.01 degC) for up to 3 modules
    ModuleTemperatures {
        first_module: usize,
        raw: heapless::Vec<u16, 3>,
    },
}

fn need(id: u16, data: &[u8], need: usize) -> Result<(), DecodeError> {
    if data.len() < need {
        Err(DecodeError::ShortFrame {
            id,
            dlc: data.len(),
            need,
        })
    } else {
        Ok(())
    }
}

/// Classify one CAN frame.
///
/// `Ok(None)` means the id is not part of the U-BMS broadcast set. Short
/// frames are rejected before any field is produced, so a rejected frame can
/// never mutate state.
pub fn parse_ubms_frame(frame: &CanFrame) -> Result<Option<UbmsFrame>, DecodeError> {
    let id = match frame.standard_id() {
        Some(id) => id,
        None => return Ok(None),
    };
    let data = &frame.data[..];

    match id {
        0x0C0 => {
            need(id, data, 8)?;
            Ok(Some(UbmsFrame::Status {
                soc: data[0],
                mode: data[1],
                voltage_and_cell_t_alarms: data[2],
                internal_errors: data[3],
                current_and_pcb_t_alarms: data[4],
                modules_communicating: data[5],
                modules_balancing: data[6],
                shutdown_reason: data[7],
            }))
        }
        0x0C1 => {
            need(id, data, 2)?;
            let drive_limits = if data.len() >= 8 {
                Some(DriveLimits {
                    max_discharge_a: i16::from_le_bytes([data[3], data[4]]) / 10,
                    // The charge limit straddles a gap byte on the wire
                    max_charge_a: i16::from_le_bytes([data[5], data[7]]) / 10,
                })
            } else {
                None
            };
            Ok(Some(UbmsFrame::CurrentAndLimits {
                pack_voltage_raw: data[0],
                current_a: data[1] as i8,
                drive_limits,
            }))
        }
        0x0C2 => {
            need(id, data, 4)?;
            Ok(Some(UbmsFrame::ChargeParameters {
                charge_current_raw: data[0],
                max_charge_voltage_raw: u16::from_le_bytes([data[1], data[2]]),
                charge_complete: (data[3] >> 2) & 1 == 1,
            }))
        }
        0x0C4 => {
            need(id, data, 8)?;
            Ok(Some(UbmsFrame::PackExtremes {
                max_cell_temperature_c: data[0] as i16 - 40,
                min_cell_temperature_c: data[1] as i16 - 40,
                max_pcb_temperature_c: data[3] as i16 - 40,
                max_cell_millivolts: u16::from_le_bytes([data[4], data[5]]),
                min_cell_millivolts: u16::from_le_bytes([data[6], data[7]]),
            }))
        }
        0x180 => {
            need(id, data, 5)?;
            Ok(Some(UbmsFrame::Firmware {
                version: data[0],
                bms_type: data[3],
                hw_rev: data[4],
            }))
        }
        CELL_VOLTAGE_BASE..=0x36F => {
            let module = ((id - CELL_VOLTAGE_BASE) >> 1) as usize;
            if id & 1 == 0 {
                need(id, data, 8)?;
                Ok(Some(UbmsFrame::CellsOneToThree {
                    module,
                    millivolts: [
                        u16::from_be_bytes([data[2], data[3]]),
                        u16::from_be_bytes([data[4], data[5]]),
                        u16::from_be_bytes([data[6], data[7]]),
                    ],
                }))
            } else {
                need(id, data, 4)?;
                Ok(Some(UbmsFrame::CellFour {
                    module,
                    millivolts: u16::from_be_bytes([data[2], data[3]]),
                }))
            }
        }
        MODULE_SOC_BASE..=0x06F => {
            need(id, data, 2)?;
            let first_module = ((id - MODULE_SOC_BASE) * 7) as usize;
            let mut raw = heapless::Vec::new();
            for &byte in data[1..].iter().take(7) {
                let _ = raw.push(byte);
            }
            Ok(Some(UbmsFrame::ModuleSocs { first_module, raw }))
        }
        MODULE_CURRENT_BASE..=0x46F => {
            need(id, data, 4)?;
            let first_module = ((id - MODULE_CURRENT_BASE) * 3) as usize;
            let mut raw = heapless::Vec::new();
            for pair in data[2..].chunks_exact(2).take(3) {
                let _ = raw.push(i16::from_be_bytes([pair[0], pair[1]]));
            }
            Ok(Some(UbmsFrame::ModuleCurrents { first_module, raw }))
        }
        MODULE_TEMPERATURE_BASE..=0x76F => {
            need(id, data, 4)?;
            let first_module = ((id - MODULE_TEMPERATURE_BASE) * 3) as usize;
            let mut raw = heapless::Vec::new();
            for pair in data[2..].chunks_exact(2).take(3) {
                let _ = raw.push(u16::from_be_bytes([pair[0], pair[1]]));
            }
            Ok(Some(UbmsFrame::ModuleTemperatures { first_module, raw }))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;
    use embedded_can::StandardId;

    fn frame(id: u16, data: &[u8]) -> CanFrame {
        CanFrame::from_encoded(StandardId::new(id).unwrap().into(), data)
    }

    #[test]
    fn status_frame() {
        let parsed = parse_ubms_frame(&frame(0x0C0, &[50, 2, 0, 0, 0, 8, 1, 3]))
            .unwrap()
            .unwrap();
        assert!(
            parsed
                == UbmsFrame::Status {
                    soc: 50,
                    mode: 2,
                    voltage_and_cell_t_alarms: 0,
                    internal_errors: 0,
                    current_and_pcb_t_alarms: 0,
                    modules_communicating: 8,
                    modules_balancing: 1,
                    shutdown_reason: 3,
                }
        );
    }

    #[test]
    fn current_frame_negative() {
        // 0xF5 as signed int8 is -11 A
        let parsed = parse_ubms_frame(&frame(0x0C1, &[26, 0xF5])).unwrap().unwrap();
        assert!(
            parsed
                == UbmsFrame::CurrentAndLimits {
                    pack_voltage_raw: 26,
                    current_a: -11,
                    drive_limits: None,
                }
        );
    }

    #[test]
    fn current_frame_with_drive_limits() {
        // discharge 1200 raw -> 120 A, charge 500 raw (bytes 5 and 7) -> 50 A
        let discharge = 1200_i16.to_le_bytes();
        let charge = 500_i16.to_le_bytes();
        let data = [26, 10, 0, discharge[0], discharge[1], charge[0], 0xEE, charge[1]];
        let parsed = parse_ubms_frame(&frame(0x0C1, &data)).unwrap().unwrap();
        assert!(
            parsed
                == UbmsFrame::CurrentAndLimits {
                    pack_voltage_raw: 26,
                    current_a: 10,
                    drive_limits: Some(DriveLimits {
                        max_discharge_a: 120,
                        max_charge_a: 50,
                    }),
                }
        );
    }

    #[test]
    fn charge_parameters_frame() {
        let parsed = parse_ubms_frame(&frame(0x0C2, &[40, 0x40, 0x0E, 0b100]))
            .unwrap()
            .unwrap();
        assert!(
            parsed
                == UbmsFrame::ChargeParameters {
                    charge_current_raw: 40,
                    max_charge_voltage_raw: 0x0E40,
                    charge_complete: true,
                }
        );
    }

    #[test]
    fn pack_extremes_frame() {
        // temps are offset by 40, cell extremes little-endian millivolts
        let parsed = parse_ubms_frame(&frame(0x0C4, &[65, 42, 0, 75, 0x42, 0x0D, 0x2C, 0x0D]))
            .unwrap()
            .unwrap();
        assert!(
            parsed
                == UbmsFrame::PackExtremes {
                    max_cell_temperature_c: 25,
                    min_cell_temperature_c: 2,
                    max_pcb_temperature_c: 35,
                    max_cell_millivolts: 3394,
                    min_cell_millivolts: 3372,
                }
        );
    }

    #[test]
    fn firmware_frame() {
        let parsed = parse_ubms_frame(&frame(0x180, &[3, 0, 0, 2, 7])).unwrap().unwrap();
        assert!(
            parsed
                == UbmsFrame::Firmware {
                    version: 3,
                    bms_type: 2,
                    hw_rev: 7,
                }
        );
    }

    #[test]
    fn even_cell_carrier_is_big_endian() {
        // module 2 (id 0x354), cells at 3300/3301/3302 mV
        let data = [0, 0, 0x0C, 0xE4, 0x0C, 0xE5, 0x0C, 0xE6];
        let parsed = parse_ubms_frame(&frame(0x354, &data)).unwrap().unwrap();
        assert!(
            parsed
                == UbmsFrame::CellsOneToThree {
                    module: 2,
                    millivolts: [3300, 3301, 3302],
                }
        );
    }

    #[test]
    fn odd_cell_carrier_is_big_endian() {
        let parsed = parse_ubms_frame(&frame(0x355, &[0, 0, 0x0C, 0xE4]))
            .unwrap()
            .unwrap();
        assert!(
            parsed
                == UbmsFrame::CellFour {
                    module: 2,
                    millivolts: 3300,
                }
        );
    }

    #[test]
    fn module_soc_fanout() {
        let parsed = parse_ubms_frame(&frame(0x06B, &[0, 255, 128, 0]))
            .unwrap()
            .unwrap();
        let raw: heapless::Vec<u8, 7> = heapless::Vec::from_slice(&[255, 128, 0]).unwrap();
        assert!(
            parsed
                == UbmsFrame::ModuleSocs {
                    first_module: 7,
                    raw,
                }
        );
    }

    #[test]
    fn module_current_fanout() {
        let data = [0, 0, 0xFF, 0xF6, 0x00, 0x0A, 0x00, 0x00];
        let parsed = parse_ubms_frame(&frame(0x46B, &data)).unwrap().unwrap();
        let raw: heapless::Vec<i16, 3> = heapless::Vec::from_slice(&[-10, 10, 0]).unwrap();
        assert!(
            parsed
                == UbmsFrame::ModuleCurrents {
                    first_module: 3,
                    raw,
                }
        );
    }

    #[test]
    fn module_temperature_fanout_partial() {
        // dlc 6 carries only two temperature words
        let data = [0, 0, 0x09, 0xC4, 0x0A, 0x28];
        let parsed = parse_ubms_frame(&frame(0x76A, &data)).unwrap().unwrap();
        let raw: heapless::Vec<u16, 3> = heapless::Vec::from_slice(&[2500, 2600]).unwrap();
        assert!(
            parsed
                == UbmsFrame::ModuleTemperatures {
                    first_module: 0,
                    raw,
                }
        );
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(
            parse_ubms_frame(&frame(0x0C0, &[50, 2, 0]))
                == Err(DecodeError::ShortFrame {
                    id: 0x0C0,
                    dlc: 3,
                    need: 8,
                })
        );
        assert!(parse_ubms_frame(&frame(0x0C1, &[26])).is_err());
        assert!(parse_ubms_frame(&frame(0x354, &[0, 0, 0x0C, 0xE4])).is_err());
        assert!(parse_ubms_frame(&frame(0x355, &[0, 0, 0x0C])).is_err());
    }

    #[test]
    fn unknown_ids_are_ignored() {
        assert!(parse_ubms_frame(&frame(0x123, &[0; 8])) == Ok(None));
        assert!(parse_ubms_frame(&frame(0x700, &[0; 8])) == Ok(None));
        let ext = CanFrame::from_encoded(
            embedded_can::ExtendedId::new(0x1800).unwrap().into(),
            &[0; 8],
        );
        assert!(parse_ubms_frame(&ext) == Ok(None));
    }

    #[test]
    fn classification_is_pure() {
        let f = frame(0x0C0, &[50, 2, 0, 0, 0, 8, 0, 0]);
        assert!(parse_ubms_frame(&f) == parse_ubms_frame(&f));
    }
}
