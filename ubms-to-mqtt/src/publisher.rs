//! The 1 Hz publish tick: snapshot, aggregate, alarm, write, relay.

use std::time::{Duration, Instant};

use anyhow::Result;
#[allow(unused_imports)]
use tracing::{debug, error, info, trace, warn};

use ubms_can_decoder::alarm::{evaluate, AlarmThresholds};
use ubms_can_decoder::battery::{PackConfig, UbmsBattery, CELLS_PER_MODULE};
use ubms_can_decoder::pack::summarize;

use crate::bus::{BusService, Value};
use crate::relay::Relay;

/// Daemon identity and bus behavior, fixed at startup.
pub struct PublisherSettings {
    pub connection: String,
    pub device_instance: i64,
    pub comms_timeout: Duration,
}

impl PublisherSettings {
    pub fn new(connection: String, device_instance: i64) -> Self {
        Self {
            connection,
            device_instance,
            comms_timeout: Duration::from_secs(5),
        }
    }
}

/// Monotonic accumulators, seeded by the first usable sample. A zero sample
/// never seeds and never overwrites.
#[derive(Debug, Default)]
struct History {
    min_cell_millivolts: Option<u16>,
    max_cell_millivolts: Option<u16>,
    min_temperature_c: Option<f64>,
    max_temperature_c: Option<f64>,
    min_soc: Option<u8>,
    max_soc: Option<u8>,
    total_ah_drawn: f64,
}

pub struct Publisher<B: BusService> {
    bus: B,
    relay: Box<dyn Relay>,
    thresholds: AlarmThresholds,
    settings: PublisherSettings,
    /// Last good pack voltage, retained while the series modules are
    /// incomplete
    last_pack_voltage_v: f64,
    relay_level: bool,
    was_connected: bool,
    history: History,
    last_tick: Option<Instant>,
    last_full_charge: Option<Instant>,
}

impl<B: BusService> Publisher<B> {
    pub fn new(
        bus: B,
        relay: Box<dyn Relay>,
        thresholds: AlarmThresholds,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            bus,
            relay,
            thresholds,
            settings,
            last_pack_voltage_v: 0.0,
            relay_level: false,
            was_connected: false,
            history: History::default(),
            last_tick: None,
            last_full_charge: None,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Register the full path set once, with its initial values. A refused
    /// registration is fatal for the daemon.
    pub fn register_paths(&mut self, config: &PackConfig) -> Result<()> {
        let bus = &mut self.bus;

        bus.register("/Mgmt/ProcessName", Value::Text(env!("CARGO_PKG_NAME").into()))?;
        bus.register(
            "/Mgmt/ProcessVersion",
            Value::Text(env!("CARGO_PKG_VERSION").into()),
        )?;
        bus.register(
            "/Mgmt/Connection",
            Value::Text(self.settings.connection.clone()),
        )?;
        bus.register("/DeviceInstance", Value::Int(self.settings.device_instance))?;
        bus.register("/ProductId", Value::Int(0))?;
        bus.register("/ProductName", Value::Text("Valence U-BMS".into()))?;
        bus.register("/Manufacturer", Value::Text("Valence".into()))?;
        bus.register("/FirmwareVersion", Value::Int(0))?;
        bus.register("/HardwareVersion", Value::Int(0))?;
        bus.register("/Serial", Value::Text(String::new()))?;
        bus.register("/Connected", Value::Int(0))?;

        bus.register("/Dc/0/Voltage", Value::Float(0.0))?;
        bus.register("/Dc/0/Current", Value::Float(0.0))?;
        bus.register("/Dc/0/Power", Value::Float(0.0))?;
        bus.register("/Dc/0/Temperature", Value::Float(0.0))?;
        bus.register("/Soc", Value::Int(0))?;
        bus.register("/Soh", Value::Int(100))?;
        bus.register("/Capacity", Value::Float(0.0))?;
        bus.register("/InstalledCapacity", Value::Float(config.capacity_ah))?;
        bus.register("/State", Value::Int(14))?;
        bus.register("/Mode", Value::Int(0))?;
        bus.register("/TimeToGo", Value::Int(0))?;

        bus.register("/Info/MaxChargeCurrent", Value::Float(0.0))?;
        bus.register("/Info/MaxDischargeCurrent", Value::Float(0.0))?;
        bus.register(
            "/Info/MaxChargeVoltage",
            Value::Float(config.max_charge_voltage),
        )?;
        let cells_in_series = (CELLS_PER_MODULE * config.modules_in_series()) as f64;
        bus.register(
            "/Info/BatteryLowVoltage",
            Value::Float(self.thresholds.min_cell_millivolts as f64 / 1000.0 * cells_in_series),
        )?;

        bus.register(
            "/System/NrOfBatteries",
            Value::Int(config.number_of_modules as i64),
        )?;
        bus.register("/System/NrOfModulesOnline", Value::Int(0))?;
        bus.register(
            "/System/NrOfModulesOffline",
            Value::Int(config.number_of_modules as i64),
        )?;
        bus.register("/System/NrOfModulesBlockingCharge", Value::Int(0))?;
        bus.register("/System/NrOfModulesBlockingDischarge", Value::Int(0))?;
        bus.register("/System/NrOfBatteriesBalancing", Value::Int(0))?;
        bus.register(
            "/System/BatteriesSeries",
            Value::Int(config.modules_in_series() as i64),
        )?;
        bus.register(
            "/System/BatteriesParallel",
            Value::Int(config.number_of_strings as i64),
        )?;
        bus.register(
            "/System/NrOfCellsPerBattery",
            Value::Int(CELLS_PER_MODULE as i64),
        )?;
        bus.register("/System/MinCellVoltage", Value::Float(0.0))?;
        bus.register("/System/MaxCellVoltage", Value::Float(0.0))?;
        bus.register("/System/MinVoltageCellId", Value::Text("M1C1".into()))?;
        bus.register("/System/MaxVoltageCellId", Value::Text("M1C1".into()))?;
        bus.register("/System/MinCellTemperature", Value::Float(0.0))?;
        bus.register("/System/MaxCellTemperature", Value::Float(0.0))?;
        bus.register("/System/MinTemperatureCellId", Value::Text("M1C1".into()))?;
        bus.register("/System/MaxTemperatureCellId", Value::Text("M1C1".into()))?;
        bus.register("/System/MaxPcbTemperature", Value::Float(0.0))?;

        bus.register("/Alarms/CellImbalance", Value::Int(0))?;
        bus.register("/Alarms/LowVoltage", Value::Int(0))?;
        bus.register("/Alarms/HighVoltage", Value::Int(0))?;
        bus.register("/Alarms/LowSoc", Value::Int(0))?;
        bus.register("/Alarms/HighDischargeCurrent", Value::Int(0))?;
        bus.register("/Alarms/HighChargeCurrent", Value::Int(0))?;
        bus.register("/Alarms/LowTemperature", Value::Int(0))?;
        bus.register("/Alarms/HighTemperature", Value::Int(0))?;
        bus.register("/Alarms/InternalFailure", Value::Int(0))?;

        for i in 1..=config.cell_count() {
            bus.register(&format!("/Voltages/Cell{i}"), Value::Float(0.0))?;
        }
        bus.register("/Voltages/Sum", Value::Float(0.0))?;
        bus.register("/Voltages/Diff", Value::Float(0.0))?;

        bus.register("/History/MinimumCellVoltage", Value::Float(0.0))?;
        bus.register("/History/MaximumCellVoltage", Value::Float(0.0))?;
        bus.register("/History/MinimumCellTemperature", Value::Float(0.0))?;
        bus.register("/History/MaximumCellTemperature", Value::Float(0.0))?;
        bus.register("/History/MinimumSoc", Value::Int(0))?;
        bus.register("/History/MaximumSoc", Value::Int(0))?;
        bus.register("/History/TotalAhDrawn", Value::Float(0.0))?;
        bus.register("/History/ChargeCycles", Value::Int(0))?;
        bus.register("/History/TimeSinceLastFullCharge", Value::Int(0))?;

        Ok(())
    }

    /// One publish tick over a consistent state snapshot. Bus errors
    /// propagate and terminate the daemon; relay errors only log.
    pub fn tick(&mut self, battery: &UbmsBattery, now: Instant) -> Result<()> {
        let config = battery.config();
        let summary = summarize(battery, now);
        let alarms = evaluate(&self.thresholds, battery, &summary);

        let stale: Vec<usize> = (0..config.number_of_modules)
            .filter(|&m| battery.module_is_stale(m, now))
            .collect();
        if !stale.is_empty() {
            debug!("modules {stale:?} have stale data, excluded from min/max");
        }

        if let Some(v) = summary.pack_voltage_v {
            self.last_pack_voltage_v = v;
        }
        let voltage = self.last_pack_voltage_v;
        let current = battery.current_a as f64;

        let bus = &mut self.bus;
        bus.write("/Dc/0/Voltage", Value::Float(voltage))?;
        bus.write("/Dc/0/Current", Value::Float(current))?;
        bus.write("/Dc/0/Power", Value::Float(voltage * current))?;
        bus.write("/Dc/0/Temperature", Value::Float(summary.max_temperature_c))?;
        bus.write("/Soc", Value::Int(battery.soc as i64))?;
        bus.write(
            "/Capacity",
            Value::Float(config.capacity_ah * battery.soc as f64 / 100.0),
        )?;
        bus.write("/State", Value::Int(battery.bms_state as i64))?;
        bus.write("/Mode", Value::Int(battery.op_mode().as_byte() as i64))?;
        bus.write(
            "/TimeToGo",
            Value::Int(time_to_go(config.capacity_ah, battery.soc, current)),
        )?;

        bus.write(
            "/FirmwareVersion",
            Value::Int(battery.firmware_version as i64),
        )?;
        bus.write("/HardwareVersion", Value::Int(battery.hw_rev as i64))?;
        if battery.bms_type != 0 || battery.hw_rev != 0 {
            bus.write(
                "/Serial",
                Value::Text(format!(
                    "UBMS-{:02X}{:02X}",
                    battery.bms_type, battery.hw_rev
                )),
            )?;
        }

        bus.write(
            "/Info/MaxChargeCurrent",
            Value::Float(battery.max_charge_current_a),
        )?;
        bus.write(
            "/Info/MaxDischargeCurrent",
            Value::Float(battery.max_discharge_current_a),
        )?;

        let online = battery.modules_communicating as i64;
        bus.write("/System/NrOfModulesOnline", Value::Int(online))?;
        bus.write(
            "/System/NrOfModulesOffline",
            Value::Int((config.number_of_modules as i64 - online).max(0)),
        )?;
        bus.write(
            "/System/NrOfBatteriesBalancing",
            Value::Int(battery.modules_balancing as i64),
        )?;
        bus.write(
            "/System/NrOfModulesBlockingCharge",
            Value::Int((alarms.high_cell_voltage || battery.charge_complete) as i64),
        )?;
        bus.write(
            "/System/NrOfModulesBlockingDischarge",
            Value::Int(alarms.low_cell_voltage as i64),
        )?;
        bus.write(
            "/System/MinCellVoltage",
            Value::Float(summary.min_cell_millivolts as f64 / 1000.0),
        )?;
        bus.write(
            "/System/MaxCellVoltage",
            Value::Float(summary.max_cell_millivolts as f64 / 1000.0),
        )?;
        bus.write(
            "/System/MinVoltageCellId",
            Value::Text(summary.min_cell_location.label()),
        )?;
        bus.write(
            "/System/MaxVoltageCellId",
            Value::Text(summary.max_cell_location.label()),
        )?;
        bus.write(
            "/System/MinCellTemperature",
            Value::Float(summary.min_temperature_c),
        )?;
        bus.write(
            "/System/MaxCellTemperature",
            Value::Float(summary.max_temperature_c),
        )?;
        bus.write(
            "/System/MinTemperatureCellId",
            Value::Text(summary.min_temperature_location.label()),
        )?;
        bus.write(
            "/System/MaxTemperatureCellId",
            Value::Text(summary.max_temperature_location.label()),
        )?;
        bus.write(
            "/System/MaxPcbTemperature",
            Value::Float(battery.max_pcb_temperature_c as f64),
        )?;

        bus.write("/Alarms/CellImbalance", alarms.cell_imbalance.into())?;
        bus.write("/Alarms/LowVoltage", alarms.low_cell_voltage.into())?;
        bus.write("/Alarms/HighVoltage", alarms.high_cell_voltage.into())?;
        bus.write("/Alarms/LowSoc", alarms.low_soc.into())?;
        bus.write(
            "/Alarms/HighDischargeCurrent",
            alarms.high_discharge_current.into(),
        )?;
        bus.write(
            "/Alarms/HighChargeCurrent",
            alarms.high_charge_current.into(),
        )?;
        bus.write("/Alarms/LowTemperature", alarms.low_temperature.into())?;
        bus.write("/Alarms/HighTemperature", alarms.high_temperature.into())?;
        bus.write("/Alarms/InternalFailure", alarms.internal_failure.into())?;

        let mut index = 1;
        for cells in battery.cell_millivolts() {
            for &mv in cells {
                bus.write(&format!("/Voltages/Cell{index}"), Value::Float(mv as f64 / 1000.0))?;
                index += 1;
            }
        }
        bus.write("/Voltages/Sum", Value::Float(summary.cell_sum_v))?;
        bus.write(
            "/Voltages/Diff",
            Value::Float(
                (summary.max_cell_millivolts - summary.min_cell_millivolts) as f64 / 1000.0,
            ),
        )?;

        let connected = battery.connected(now, self.settings.comms_timeout);
        bus.write("/Connected", Value::Int(connected as i64))?;
        if self.was_connected && !connected {
            warn!(
                "no frames from the BMS for {} s, marking disconnected",
                self.settings.comms_timeout.as_secs()
            );
        }
        self.was_connected = connected;

        self.update_history(battery, &summary, now)?;

        let any = alarms.any();
        if any != self.relay_level {
            if let Err(e) = self.relay.set_level(any) {
                warn!("alarm relay switch failed: {e}");
            }
            self.relay_level = any;
        }

        self.last_tick = Some(now);
        Ok(())
    }

    fn update_history(
        &mut self,
        battery: &UbmsBattery,
        summary: &ubms_can_decoder::pack::PackSummary,
        now: Instant,
    ) -> Result<()> {
        let history = &mut self.history;

        if summary.min_cell_millivolts != 0 {
            let entry = history
                .min_cell_millivolts
                .get_or_insert(summary.min_cell_millivolts);
            *entry = (*entry).min(summary.min_cell_millivolts);
            self.bus.write(
                "/History/MinimumCellVoltage",
                Value::Float(*entry as f64 / 1000.0),
            )?;
        }
        if summary.max_cell_millivolts != 0 {
            let entry = history
                .max_cell_millivolts
                .get_or_insert(summary.max_cell_millivolts);
            *entry = (*entry).max(summary.max_cell_millivolts);
            self.bus.write(
                "/History/MaximumCellVoltage",
                Value::Float(*entry as f64 / 1000.0),
            )?;
        }
        if summary.min_temperature_c != 0.0 {
            let entry = history
                .min_temperature_c
                .get_or_insert(summary.min_temperature_c);
            *entry = entry.min(summary.min_temperature_c);
            self.bus
                .write("/History/MinimumCellTemperature", Value::Float(*entry))?;
        }
        if summary.max_temperature_c != 0.0 {
            let entry = history
                .max_temperature_c
                .get_or_insert(summary.max_temperature_c);
            *entry = entry.max(summary.max_temperature_c);
            self.bus
                .write("/History/MaximumCellTemperature", Value::Float(*entry))?;
        }
        if battery.handshake().saw_status() && battery.soc != 0 {
            let min = history.min_soc.get_or_insert(battery.soc);
            *min = (*min).min(battery.soc);
            self.bus
                .write("/History/MinimumSoc", Value::Int(*min as i64))?;
            let max = history.max_soc.get_or_insert(battery.soc);
            *max = (*max).max(battery.soc);
            self.bus
                .write("/History/MaximumSoc", Value::Int(*max as i64))?;
        }

        let current = battery.current_a as f64;
        if let Some(last) = self.last_tick {
            if current < 0.0 {
                let hours = now.duration_since(last).as_secs_f64() / 3600.0;
                history.total_ah_drawn += current.abs() * hours;
            }
        }
        self.bus
            .write("/History/TotalAhDrawn", Value::Float(history.total_ah_drawn))?;
        self.bus.write(
            "/History/ChargeCycles",
            Value::Int((history.total_ah_drawn / battery.config().capacity_ah) as i64),
        )?;

        if battery.soc >= 100 {
            self.last_full_charge = Some(now);
        }
        if let Some(at) = self.last_full_charge {
            self.bus.write(
                "/History/TimeSinceLastFullCharge",
                Value::Int(now.duration_since(at).as_secs() as i64),
            )?;
        }
        Ok(())
    }
}

/// Runtime estimate in seconds at the present discharge or charge rate.
fn time_to_go(capacity_ah: f64, soc: u8, current_a: f64) -> i64 {
    if current_a.abs() <= 0.01 {
        return 0;
    }
    let hours = capacity_ah * soc as f64 / 100.0 / current_a.abs();
    (hours * 3600.0).clamp(0.0, 999_999.0) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use embedded_can::StandardId;
    use ubms_can_decoder::can_frame::CanFrame;
    use ubms_can_decoder::parse_ubms_frame;

    #[derive(Default)]
    struct MockBus {
        values: HashMap<String, Value>,
    }

    impl MockBus {
        fn float(&self, path: &str) -> f64 {
            match self.values.get(path) {
                Some(Value::Float(v)) => *v,
                other => panic!("{path}: expected float, got {other:?}"),
            }
        }

        fn int(&self, path: &str) -> i64 {
            match self.values.get(path) {
                Some(Value::Int(v)) => *v,
                other => panic!("{path}: expected int, got {other:?}"),
            }
        }

        fn text(&self, path: &str) -> &str {
            match self.values.get(path) {
                Some(Value::Text(v)) => v,
                other => panic!("{path}: expected text, got {other:?}"),
            }
        }
    }

    impl BusService for MockBus {
        fn register(&mut self, path: &str, initial: Value) -> Result<()> {
            if self.values.insert(path.to_string(), initial).is_some() {
                anyhow::bail!("{path} registered twice");
            }
            Ok(())
        }

        fn write(&mut self, path: &str, value: Value) -> Result<()> {
            if !self.values.contains_key(path) {
                anyhow::bail!("{path} not registered");
            }
            self.values.insert(path.to_string(), value);
            Ok(())
        }
    }

    struct MockRelay(Arc<Mutex<Vec<bool>>>);

    impl Relay for MockRelay {
        fn set_level(&mut self, on: bool) -> std::io::Result<()> {
            self.0.lock().unwrap().push(on);
            Ok(())
        }
    }

    fn fixture() -> (Publisher<MockBus>, UbmsBattery, Arc<Mutex<Vec<bool>>>) {
        let config = PackConfig::new(8, 2, 130.0, 58.0).unwrap();
        let battery = UbmsBattery::new(config);
        let switches = Arc::new(Mutex::new(Vec::new()));
        let mut publisher = Publisher::new(
            MockBus::default(),
            Box::new(MockRelay(switches.clone())),
            AlarmThresholds::default(),
            PublisherSettings::new("can0".into(), 0),
        );
        publisher.register_paths(&config).unwrap();
        (publisher, battery, switches)
    }

    fn feed(battery: &mut UbmsBattery, id: u16, data: &[u8], now: Instant) {
        let frame = CanFrame::from_encoded(StandardId::new(id).unwrap().into(), data);
        let parsed = parse_ubms_frame(&frame).unwrap().unwrap();
        battery.apply(&parsed, now).unwrap();
    }

    fn feed_cells(battery: &mut UbmsBattery, module: u16, mv: [u16; 4], now: Instant) {
        let [c1, c2, c3, c4] = mv;
        let b1 = c1.to_be_bytes();
        let b2 = c2.to_be_bytes();
        let b3 = c3.to_be_bytes();
        let b4 = c4.to_be_bytes();
        feed(
            battery,
            0x350 + 2 * module,
            &[0, 0, b1[0], b1[1], b2[0], b2[1], b3[0], b3[1]],
            now,
        );
        feed(battery, 0x351 + 2 * module, &[0, 0, b4[0], b4[1]], now);
    }

    fn full_pack(battery: &mut UbmsBattery, mv: u16, now: Instant) {
        for module in 0..8 {
            feed_cells(battery, module, [mv; 4], now);
        }
    }

    #[test]
    fn cold_start_publishes_defaults_and_no_alarms() {
        let (mut publisher, battery, switches) = fixture();
        let now = Instant::now() + Duration::from_secs(6);
        publisher.tick(&battery, now).unwrap();

        let bus = publisher.bus();
        assert_eq!(bus.int("/Connected"), 0);
        assert_eq!(bus.int("/Soc"), 0);
        assert_eq!(bus.float("/Dc/0/Voltage"), 0.0);
        assert_eq!(bus.float("/Voltages/Cell1"), 0.0);
        assert_eq!(bus.float("/Voltages/Cell32"), 0.0);
        for alarm in [
            "/Alarms/CellImbalance",
            "/Alarms/LowVoltage",
            "/Alarms/HighVoltage",
            "/Alarms/LowSoc",
            "/Alarms/HighDischargeCurrent",
            "/Alarms/HighChargeCurrent",
            "/Alarms/LowTemperature",
            "/Alarms/HighTemperature",
            "/Alarms/InternalFailure",
        ] {
            assert_eq!(bus.int(alarm), 0, "{alarm}");
        }
        assert!(switches.lock().unwrap().is_empty());
    }

    #[test]
    fn status_frame_reaches_the_bus() {
        let (mut publisher, mut battery, _switches) = fixture();
        let now = Instant::now();
        feed(&mut battery, 0x0C0, &[50, 2, 0, 0, 0, 8, 0, 0], now);
        publisher.tick(&battery, now).unwrap();

        let bus = publisher.bus();
        assert_eq!(bus.int("/Soc"), 50);
        assert_eq!(bus.int("/Mode"), 2);
        assert_eq!(bus.int("/State"), 9);
        assert_eq!(bus.int("/System/NrOfModulesOnline"), 8);
        assert_eq!(bus.int("/System/NrOfModulesOffline"), 0);
        assert_eq!(bus.int("/Connected"), 1);
    }

    #[test]
    fn uniform_pack_voltages_reach_the_bus() {
        let (mut publisher, mut battery, _switches) = fixture();
        let now = Instant::now();
        full_pack(&mut battery, 3300, now);
        publisher.tick(&battery, now).unwrap();

        let bus = publisher.bus();
        assert_eq!(bus.float("/System/MinCellVoltage"), 3.3);
        assert_eq!(bus.float("/System/MaxCellVoltage"), 3.3);
        assert_eq!(bus.text("/System/MinVoltageCellId"), "M1C1");
        assert_eq!(bus.float("/Voltages/Diff"), 0.0);
        assert!((bus.float("/Voltages/Sum") - 105.6).abs() < 1e-9);
        assert_eq!(bus.float("/Dc/0/Voltage"), 52.8);
        assert_eq!(bus.float("/Voltages/Cell1"), 3.3);
        assert_eq!(bus.float("/Voltages/Cell32"), 3.3);
    }

    #[test]
    fn high_cell_alarm_locates_the_cell_and_edges_the_relay_once() {
        let (mut publisher, mut battery, switches) = fixture();
        let mut now = Instant::now();
        full_pack(&mut battery, 3300, now);
        publisher.tick(&battery, now).unwrap();
        assert!(switches.lock().unwrap().is_empty());

        // module 3 cell 2 rises to 3650 mV
        now += Duration::from_secs(1);
        feed_cells(&mut battery, 2, [3300, 3650, 3300, 3300], now);
        publisher.tick(&battery, now).unwrap();
        {
            let bus = publisher.bus();
            assert_eq!(bus.int("/Alarms/HighVoltage"), 1);
            assert_eq!(bus.float("/System/MaxCellVoltage"), 3.65);
            assert_eq!(bus.text("/System/MaxVoltageCellId"), "M3C2");
        }
        assert_eq!(*switches.lock().unwrap(), vec![true]);

        // steady alarm: no second relay call
        now += Duration::from_secs(1);
        publisher.tick(&battery, now).unwrap();
        assert_eq!(*switches.lock().unwrap(), vec![true]);

        // alarm clears: exactly one falling edge
        now += Duration::from_secs(1);
        feed_cells(&mut battery, 2, [3300, 3300, 3300, 3300], now);
        publisher.tick(&battery, now).unwrap();
        assert_eq!(*switches.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn current_and_power_follow_the_current_frame() {
        let (mut publisher, mut battery, _switches) = fixture();
        let now = Instant::now();
        full_pack(&mut battery, 3300, now);
        feed(&mut battery, 0x0C1, &[26, 0xF5], now);
        publisher.tick(&battery, now).unwrap();

        let bus = publisher.bus();
        assert_eq!(bus.float("/Dc/0/Current"), -11.0);
        assert!((bus.float("/Dc/0/Power") - 52.8 * -11.0).abs() < 1e-9);
    }

    #[test]
    fn pack_voltage_is_retained_while_series_cells_are_incomplete() {
        let (mut publisher, mut battery, _switches) = fixture();
        let now = Instant::now();
        // only three of four series modules have reported
        for module in 0..3 {
            feed_cells(&mut battery, module, [3300; 4], now);
        }
        publisher.tick(&battery, now).unwrap();
        assert_eq!(publisher.bus().float("/Dc/0/Voltage"), 0.0);

        feed_cells(&mut battery, 3, [3300; 4], now);
        publisher.tick(&battery, now).unwrap();
        assert_eq!(publisher.bus().float("/Dc/0/Voltage"), 52.8);
    }

    #[test]
    fn time_to_go_estimates_runtime() {
        assert_eq!(time_to_go(130.0, 50, 0.0), 0);
        // 65 Ah left at 11 A is 21272 s
        assert_eq!(time_to_go(130.0, 50, -11.0), 21272);
        assert_eq!(time_to_go(130.0, 100, -0.5), 936_000);
        // trickle discharge saturates the estimate
        assert_eq!(time_to_go(130.0, 100, -0.02), 999_999);
    }

    #[test]
    fn history_extremes_are_monotonic_and_ignore_zero_samples() {
        let (mut publisher, mut battery, _switches) = fixture();
        let mut now = Instant::now();

        // nothing reported: history stays at its registered zeros
        publisher.tick(&battery, now).unwrap();
        assert_eq!(publisher.bus().float("/History/MinimumCellVoltage"), 0.0);

        full_pack(&mut battery, 3300, now);
        feed(&mut battery, 0x0C0, &[50, 0, 0, 0, 0, 8, 0, 0], now);
        publisher.tick(&battery, now).unwrap();

        now += Duration::from_secs(1);
        feed_cells(&mut battery, 1, [3200, 3400, 3300, 3300], now);
        feed(&mut battery, 0x0C0, &[40, 0, 0, 0, 0, 8, 0, 0], now);
        publisher.tick(&battery, now).unwrap();

        now += Duration::from_secs(1);
        feed_cells(&mut battery, 1, [3300, 3300, 3300, 3300], now);
        feed(&mut battery, 0x0C0, &[60, 0, 0, 0, 0, 8, 0, 0], now);
        publisher.tick(&battery, now).unwrap();

        let bus = publisher.bus();
        assert_eq!(bus.float("/History/MinimumCellVoltage"), 3.2);
        assert_eq!(bus.float("/History/MaximumCellVoltage"), 3.4);
        assert_eq!(bus.int("/History/MinimumSoc"), 40);
        assert_eq!(bus.int("/History/MaximumSoc"), 60);
    }

    #[test]
    fn discharge_accumulates_amp_hours() {
        let (mut publisher, mut battery, _switches) = fixture();
        let mut now = Instant::now();
        feed(&mut battery, 0x0C1, &[26, 0xF5], now);
        publisher.tick(&battery, now).unwrap();

        // one hour of ticking at -11 A draws 11 Ah
        for _ in 0..3600 {
            now += Duration::from_secs(1);
            publisher.tick(&battery, now).unwrap();
        }
        assert!((publisher.bus().float("/History/TotalAhDrawn") - 11.0).abs() < 1e-6);
    }

    #[test]
    fn full_charge_timestamp_is_tracked() {
        let (mut publisher, mut battery, _switches) = fixture();
        let mut now = Instant::now();
        feed(&mut battery, 0x0C0, &[100, 1, 0, 0, 0, 8, 0, 0], now);
        publisher.tick(&battery, now).unwrap();
        assert_eq!(publisher.bus().int("/History/TimeSinceLastFullCharge"), 0);

        feed(&mut battery, 0x0C0, &[99, 0, 0, 0, 0, 8, 0, 0], now);
        now += Duration::from_secs(90);
        publisher.tick(&battery, now).unwrap();
        assert_eq!(publisher.bus().int("/History/TimeSinceLastFullCharge"), 90);
    }
}
