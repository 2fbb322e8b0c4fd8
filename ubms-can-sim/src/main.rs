//! Emits a synthetic U-BMS broadcast stream on a (v)can interface.
//!
//! Useful for bench-testing the bridge without a battery: brings up the
//! status block at 1 Hz and sweeps the per-module carriers at the pace of
//! the real BMS, three modules per 0.6 s slot.

use std::time::Duration;

use clap::Parser;
use embedded_can::{Frame, StandardId};
use socketcan::{tokio::AsyncCanSocket, CanFrame, CanSocket};
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// CAN interface
    #[arg(short, long, default_value_t = String::from("vcan0"))]
    interface: String,

    /// Number of modules to simulate
    #[arg(long, default_value_t = 16)]
    modules: u16,

    /// Reported state of charge in percent
    #[arg(long, default_value_t = 80)]
    soc: u8,

    /// Operational mode byte (0 standby, 1 charge, 2 drive)
    #[arg(long, default_value_t = 2)]
    mode: u8,

    /// Cell voltage in millivolts
    #[arg(long, default_value_t = 3300)]
    cell_millivolts: u16,

    /// Pack current in amps
    #[arg(long, default_value_t = -11)]
    current: i8,

    /// Module temperature in degrees Celsius
    #[arg(long, default_value_t = 25.0)]
    temperature: f64,
}

fn register_tracing_subscriber(level_filter: LevelFilter) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::builder()
                .with_default_directive(level_filter.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(true)
                .with_line_number(true),
        )
        .init();
}

fn frame(id: u16, data: &[u8]) -> CanFrame {
    CanFrame::new(StandardId::new(id).unwrap(), data).unwrap()
}

/// The 1 Hz status block: status, current and pack extremes, plus the
/// firmware id the bridge handshake waits for.
fn status_block(args: &Args) -> Vec<CanFrame> {
    let temp = (args.temperature as i16 + 40) as u8;
    let mv = args.cell_millivolts.to_le_bytes();
    vec![
        frame(
            0x0C0,
            &[args.soc, args.mode, 0, 0, 0, args.modules as u8, 0, 0],
        ),
        frame(
            0x0C1,
            &[
                (args.modules / 4 * 13) as u8,
                args.current as u8,
                0,
                0xB0,
                0x04,
                0xF4,
                0,
                0x01,
            ],
        ),
        frame(0x0C4, &[temp, temp, 0, temp, mv[0], mv[1], mv[0], mv[1]]),
        frame(0x180, &[3, 0, 0, 2, 7]),
    ]
}

/// One 0.6 s sweep slot: cell carriers, temperatures and SoC for a group of
/// three modules.
fn module_slot(args: &Args, first: u16) -> Vec<CanFrame> {
    let mut frames = Vec::new();
    let mv = args.cell_millivolts.to_be_bytes();
    for module in first..(first + 3).min(args.modules) {
        frames.push(frame(
            0x350 + 2 * module,
            &[0, 0, mv[0], mv[1], mv[0], mv[1], mv[0], mv[1]],
        ));
        frames.push(frame(0x351 + 2 * module, &[0, 0, mv[0], mv[1]]));
    }

    let centi = ((args.temperature * 100.0) as u16).to_be_bytes();
    let mut temp_data = vec![0u8, 0u8];
    for _ in 0..(args.modules - first).min(3) {
        temp_data.extend_from_slice(&centi);
    }
    frames.push(frame(0x76A + first / 3, &temp_data));

    // the SoC fan-out packs seven modules per frame, refresh the group that
    // covers this slot
    let soc_frame = first / 7;
    let raw_soc = (args.soc as u16 * 256 / 100).min(255) as u8;
    let first_in_frame = soc_frame * 7;
    let count = (args.modules - first_in_frame).min(7) as usize;
    let mut data = vec![0u8];
    data.extend(std::iter::repeat(raw_soc).take(count));
    frames.push(frame(0x06A + soc_frame, &data));

    frames
}

#[tokio::main]
async fn main() {
    register_tracing_subscriber(LevelFilter::INFO);
    let args = Args::parse();
    info!("CAN interface: {}", args.interface);

    let can_sock: AsyncCanSocket<CanSocket> =
        AsyncCanSocket::open(args.interface.as_str()).expect("Unable to open CAN socket");
    info!(
        "simulating {} modules at {} mV, SoC {}%",
        args.modules, args.cell_millivolts, args.soc
    );

    let mut first_module = 0u16;
    let mut slot = 0u32;
    loop {
        let mut frames = module_slot(&args, first_module);
        // status block lands on every other slot, roughly 1 Hz
        if slot % 2 == 0 {
            frames.extend(status_block(&args));
        }

        for frame in &frames {
            trace!("CAN frame: {:?}", frame);
            if let Err(e) = can_sock.write_frame(*frame).await {
                error!("Failed to send CAN frame: {e}");
            }
        }

        first_module += 3;
        if first_module >= args.modules {
            first_module = 0;
        }
        slot += 1;
        tokio::time::sleep(Duration::from_millis(600)).await;
    }
}
