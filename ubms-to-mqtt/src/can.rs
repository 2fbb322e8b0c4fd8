//! Socketcan setup for the U-BMS side.

use anyhow::{Context, Result};
use socketcan::{tokio::AsyncCanSocket, CanFilter, CanSocket, SocketOptions};

/// Kernel-side acceptance filters covering exactly the U-BMS broadcast set:
/// status block 0x0C0..0x0CF, firmware id, both cell-voltage carrier banks
/// and the three per-module fan-outs.
pub const ACCEPTANCE_FILTERS: [(u32, u32); 7] = [
    (0x0CF, 0xFF0),
    (0x180, 0xFFF),
    (0x350, 0xFF0),
    (0x360, 0xFF0),
    (0x46A, 0xFF0),
    (0x06A, 0xFF0),
    (0x76A, 0xFF0),
];

/// Open the receive socket with the acceptance filters applied.
pub fn open_filtered(interface: &str) -> Result<AsyncCanSocket<CanSocket>> {
    let socket = AsyncCanSocket::open(interface)
        .with_context(|| format!("opening CAN interface {interface}"))?;
    let filters: Vec<CanFilter> = ACCEPTANCE_FILTERS
        .iter()
        .map(|&(id, mask)| CanFilter::new(id, mask))
        .collect();
    socket
        .set_filters(filters.as_slice())
        .context("applying CAN acceptance filters")?;
    Ok(socket)
}

/// Open the transmit socket used by the mode transmitter.
pub fn open_tx(interface: &str) -> Result<AsyncCanSocket<CanSocket>> {
    AsyncCanSocket::open(interface)
        .with_context(|| format!("opening CAN interface {interface} for transmit"))
}
