//! Requested-mode tracking and the cyclic mode-set transmission.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use embedded_can::{Frame, StandardId};
use socketcan::{tokio::AsyncCanSocket, CanFrame, CanSocket};
use thiserror::Error;
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use ubms_can_decoder::battery::OpMode;

/// Arbitration id of the outgoing mode-set frame.
pub const MODE_SET_ID: u16 = 0x440;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ModeError {
    #[error("invalid mode {0}, expected 0 (standby), 1 (charge) or 2 (drive)")]
    Invalid(u8),
    #[error("refusing direct {from:?} -> {to:?} switch, go through standby")]
    DirectSwitch { from: OpMode, to: OpMode },
}

/// The operator-requested mode, shared between the bus write handler and
/// the cyclic transmitter. `None` until the first accepted request: the
/// transmitter stays silent and the BMS keeps its own mode.
pub struct ModeSwitch {
    requested: Mutex<Option<OpMode>>,
}

impl ModeSwitch {
    pub fn new() -> Self {
        Self {
            requested: Mutex::new(None),
        }
    }

    pub fn requested(&self) -> Option<OpMode> {
        *self.requested.lock().unwrap()
    }

    /// Validate and adopt a mode request. `reported` is the mode the BMS
    /// currently claims; it anchors the transition check until the first
    /// request has been accepted.
    pub fn request(&self, value: u8, reported: OpMode) -> Result<OpMode, ModeError> {
        let next = OpMode::try_from(value).map_err(ModeError::Invalid)?;
        let mut requested = self.requested.lock().unwrap();
        let from = requested.unwrap_or(reported);
        if !from.can_switch_to(next) {
            return Err(ModeError::DirectSwitch { from, to: next });
        }
        *requested = Some(next);
        Ok(next)
    }
}

impl Default for ModeSwitch {
    fn default() -> Self {
        Self::new()
    }
}

/// Send the mode-set frame once per second while a mode has been requested.
/// There is exactly one of these tasks; a mode change re-targets it instead
/// of spawning a second sender.
pub async fn run_mode_transmitter(socket: AsyncCanSocket<CanSocket>, switch: Arc<ModeSwitch>) {
    let id = StandardId::new(MODE_SET_ID).unwrap();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let Some(mode) = switch.requested() else {
            continue;
        };
        let frame = CanFrame::new(id, &[0, mode.as_byte(), 0, 0]).unwrap();
        match socket.write_frame(frame).await {
            Ok(()) => trace!("sent mode-set frame for {mode:?}"),
            Err(e) => warn!("mode-set send failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_drive_only_meet_in_standby() {
        let switch = ModeSwitch::new();

        // the BMS reports drive; a direct switch to charge is refused
        let err = switch.request(1, OpMode::Drive).unwrap_err();
        assert_eq!(
            err,
            ModeError::DirectSwitch {
                from: OpMode::Drive,
                to: OpMode::Charge,
            }
        );
        assert_eq!(switch.requested(), None);

        assert_eq!(switch.request(0, OpMode::Drive), Ok(OpMode::Standby));
        assert_eq!(switch.request(1, OpMode::Drive), Ok(OpMode::Charge));
        assert_eq!(switch.requested(), Some(OpMode::Charge));
    }

    #[test]
    fn requests_validate_against_the_last_accepted_request() {
        let switch = ModeSwitch::new();
        switch.request(2, OpMode::Standby).unwrap();

        // reported mode may lag; the pending request anchors the check
        let err = switch.request(1, OpMode::Standby).unwrap_err();
        assert_eq!(
            err,
            ModeError::DirectSwitch {
                from: OpMode::Drive,
                to: OpMode::Charge,
            }
        );
    }

    #[test]
    fn out_of_range_modes_are_rejected() {
        let switch = ModeSwitch::new();
        assert_eq!(switch.request(3, OpMode::Standby), Err(ModeError::Invalid(3)));
        assert_eq!(switch.requested(), None);
    }

    #[test]
    fn requesting_the_current_mode_is_a_no_op_transition() {
        let switch = ModeSwitch::new();
        assert_eq!(switch.request(2, OpMode::Drive), Ok(OpMode::Drive));
    }
}
