//! Bridges a Valence U-BMS battery pack on CAN to the host bus.
//!
//! Frames are decoded into the shared battery state as they arrive; a 1 Hz
//! tick derives pack quantities and alarms and publishes them under
//! `com.victronenergy.battery.socketcan_<iface>_di<n>`.

use std::process;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use embedded_can::Frame;
use socketcan::{tokio::AsyncCanSocket, CanSocket};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

use ubms_can_decoder::alarm::AlarmThresholds;
use ubms_can_decoder::battery::{PackConfig, UbmsBattery};
use ubms_can_decoder::can_frame::CanFrame;
use ubms_can_decoder::{parse_ubms_frame, UbmsFrame};

mod bus;
mod can;
mod mode;
mod publisher;
mod relay;

use bus::MqttBus;
use mode::ModeSwitch;
use publisher::{Publisher, PublisherSettings};
use relay::{NoRelay, Relay, SysfsRelay};

/// How long the startup handshake may take before the daemon reports it as
/// incomplete and continues degraded.
const HANDSHAKE_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// CAN interface
    #[arg(short, long, default_value_t = String::from("can0"))]
    interface: String,

    /// Pack capacity in amp hours
    #[arg(short, long, default_value_t = 130.0)]
    capacity: f64,

    /// Pack maximum charge voltage in volts
    #[arg(short, long)]
    voltage: f64,

    /// Number of modules in the pack
    #[arg(long, default_value_t = 16)]
    modules: usize,

    /// Number of parallel strings
    #[arg(long, default_value_t = 4)]
    strings: usize,

    /// Device instance in the bus service name
    #[arg(long, default_value_t = 0)]
    deviceinstance: i64,

    /// Broker the bus adapter connects to
    #[arg(long, default_value_t = String::from("tcp://localhost:1883"))]
    broker: String,

    /// GPIO pin driving the alarm relay
    #[arg(long)]
    gpio_relay_pin: Option<u32>,

    /// Log at debug level
    #[arg(short, long)]
    debug: bool,

    /// Low cell voltage alarm threshold in millivolts
    #[arg(long, default_value_t = 2700)]
    min_cell_voltage: u16,

    /// High cell voltage alarm threshold in millivolts
    #[arg(long, default_value_t = 3600)]
    max_cell_voltage: u16,

    /// Cell imbalance alarm threshold in millivolts
    #[arg(long, default_value_t = 50)]
    cell_imbalance: u16,

    /// High cell temperature alarm threshold in degrees Celsius
    #[arg(long, default_value_t = 55.0)]
    max_cell_temperature: f64,

    /// Low cell temperature alarm threshold in degrees Celsius
    #[arg(long, default_value_t = 0.0)]
    min_cell_temperature: f64,

    /// Charge current alarm threshold in amps
    #[arg(long, default_value_t = 100.0)]
    max_charge_current: f64,

    /// Discharge current alarm threshold in amps
    #[arg(long, default_value_t = 100.0)]
    max_discharge_current: f64,

    /// Low state of charge alarm threshold in percent
    #[arg(long, default_value_t = 5)]
    min_soc: u8,
}

impl Args {
    fn thresholds(&self) -> AlarmThresholds {
        AlarmThresholds {
            min_cell_millivolts: self.min_cell_voltage,
            max_cell_millivolts: self.max_cell_voltage,
            cell_imbalance_millivolts: self.cell_imbalance,
            max_cell_temperature_c: self.max_cell_temperature,
            min_cell_temperature_c: self.min_cell_temperature,
            max_charge_current_a: self.max_charge_current,
            max_discharge_current_a: self.max_discharge_current,
            min_soc_pct: self.min_soc,
        }
    }
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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    register_tracing_subscriber(if args.debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    });

    let config = match PackConfig::new(args.modules, args.strings, args.capacity, args.voltage) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid pack configuration: {e}");
            process::exit(2);
        }
    };
    info!(
        "pack: {} modules in {} strings, {} Ah, {} V max charge",
        config.number_of_modules, config.number_of_strings, config.capacity_ah, config.max_charge_voltage
    );

    let service_name = format!(
        "com.victronenergy.battery.socketcan_{}_di{}",
        args.interface, args.deviceinstance
    );
    let mut mqtt_bus = MqttBus::connect(&args.broker, &service_name)?;
    let mode_writes = mqtt_bus.mode_write_receiver()?;
    info!("registered bus service {service_name}");

    let relay: Box<dyn Relay> = match args.gpio_relay_pin {
        Some(pin) => Box::new(SysfsRelay::open(pin).context("opening relay GPIO")?),
        None => Box::new(NoRelay),
    };

    let mut publisher = Publisher::new(
        mqtt_bus,
        relay,
        args.thresholds(),
        PublisherSettings::new(args.interface.clone(), args.deviceinstance),
    );
    publisher.register_paths(&config)?;

    let battery = Arc::new(Mutex::new(UbmsBattery::new(config)));

    let rx_socket = can::open_filtered(&args.interface)?;
    info!("connected to CAN interface {}", args.interface);
    let receiver = tokio::spawn(run_frame_receiver(
        rx_socket,
        battery.clone(),
        args.voltage,
    ));

    let handshake_battery = battery.clone();
    tokio::spawn(async move {
        tokio::time::sleep(HANDSHAKE_WAIT).await;
        let handshake = handshake_battery.lock().unwrap().handshake();
        if handshake.complete() {
            info!("U-BMS handshake complete");
        } else {
            warn!(
                "handshake incomplete after {} s (bits {:#05b}), continuing degraded",
                HANDSHAKE_WAIT.as_secs(),
                handshake.bits()
            );
        }
    });

    let switch = Arc::new(ModeSwitch::new());
    let transmitter = tokio::spawn(mode::run_mode_transmitter(
        can::open_tx(&args.interface)?,
        switch.clone(),
    ));

    {
        let switch = switch.clone();
        let battery = battery.clone();
        std::thread::spawn(move || {
            for message in mode_writes.iter().flatten() {
                let payload = message.payload_str();
                let Some(value) = parse_mode_payload(&payload) else {
                    warn!("unparseable mode write: {payload:?}");
                    continue;
                };
                let reported = battery.lock().unwrap().op_mode();
                match switch.request(value, reported) {
                    Ok(mode) => info!("mode request accepted: {mode:?}"),
                    Err(e) => warn!("mode request rejected: {e}"),
                }
            }
        });
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let battery = battery.lock().unwrap();
                publisher.tick(&battery, Instant::now())?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
        }
    }

    transmitter.abort();
    receiver.abort();
    info!("stopped cyclic tasks, CAN endpoint closed");
    Ok(())
}

/// Decode frames into the shared battery state as they arrive. Receive and
/// decode errors are logged and never end the task.
async fn run_frame_receiver(
    socket: AsyncCanSocket<CanSocket>,
    battery: Arc<Mutex<UbmsBattery>>,
    max_charge_voltage: f64,
) {
    let mut voltage_checked = false;
    loop {
        let frame = match socket.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("CAN receive failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let socketcan::CanFrame::Data(data_frame) = frame else {
            debug!("ignoring non-data CAN frame: {frame:?}");
            continue;
        };

        let frame = CanFrame::from_encoded(data_frame.id(), data_frame.data());
        let parsed = match parse_ubms_frame(&frame) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => {
                trace!("ignoring unknown frame: {frame:?}");
                continue;
            }
            Err(e) => {
                warn!("{e}");
                continue;
            }
        };

        // one-shot plausibility check of the reported pack voltage
        if !voltage_checked {
            if let UbmsFrame::CurrentAndLimits {
                pack_voltage_raw, ..
            } = &parsed
            {
                voltage_checked = true;
                let reported = *pack_voltage_raw as f64;
                if (reported - max_charge_voltage).abs() > 0.15 * max_charge_voltage {
                    error!(
                        "BMS reports {reported} V pack voltage, more than 15% away from \
                         the configured {max_charge_voltage} V maximum"
                    );
                }
            }
        }

        if let Err(e) = battery.lock().unwrap().apply(&parsed, Instant::now()) {
            warn!("{e}");
        }
    }
}

fn parse_mode_payload(payload: &str) -> Option<u8> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if let Some(n) = value.get("value").and_then(|v| v.as_u64()) {
            return u8::try_from(n).ok();
        }
        if let Some(n) = value.as_u64() {
            return u8::try_from(n).ok();
        }
    }
    payload.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::parse_mode_payload;

    #[test]
    fn mode_payloads_accept_wrapped_and_bare_values() {
        assert_eq!(parse_mode_payload(r#"{"value": 2}"#), Some(2));
        assert_eq!(parse_mode_payload("1"), Some(1));
        assert_eq!(parse_mode_payload(" 0 "), Some(0));
        assert_eq!(parse_mode_payload("standby"), None);
        assert_eq!(parse_mode_payload(r#"{"value": 400}"#), None);
    }
}
