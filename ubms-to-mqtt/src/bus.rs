//! Bus adapter: the daemon-side seam towards the host inter-process bus.
//!
//! The publisher only talks to the [`BusService`] trait; the concrete
//! adapter maps registered paths onto retained MQTT topics under the
//! service name, e.g. `com.victronenergy.battery.socketcan_can0_di0/Soc`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use paho_mqtt as mqtt;

/// A typed value on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Wire form: the host bus convention wraps every value in an object.
    pub fn to_payload(&self) -> String {
        match self {
            Value::Int(v) => serde_json::json!({ "value": v }).to_string(),
            Value::Float(v) => serde_json::json!({ "value": v }).to_string(),
            Value::Text(v) => serde_json::json!({ "value": v }).to_string(),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Int(value as i64)
    }
}

/// Path registration and typed writes, as offered by the host bus client.
///
/// Registration happens exactly once per path at startup; `write` only
/// accepts previously registered paths, so a typo surfaces as an error
/// instead of a silently dead topic.
pub trait BusService {
    fn register(&mut self, path: &str, initial: Value) -> Result<()>;
    fn write(&mut self, path: &str, value: Value) -> Result<()>;
}

/// Bus adapter over the host MQTT broker.
pub struct MqttBus {
    client: mqtt::Client,
    service_name: String,
    values: HashMap<String, Value>,
}

impl MqttBus {
    /// Connect and claim the service name as client id. A second daemon on
    /// the same interface/instance kicks this connection off the broker,
    /// which matches the "name already taken is fatal" contract.
    pub fn connect(broker: &str, service_name: &str) -> Result<Self> {
        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(broker)
            .client_id(service_name)
            .finalize();
        let client = mqtt::Client::new(create_opts).context("creating MQTT client")?;

        let conn_opts = mqtt::ConnectOptionsBuilder::new()
            .keep_alive_interval(Duration::from_secs(20))
            .clean_session(true)
            .finalize();
        client
            .connect(conn_opts)
            .with_context(|| format!("connecting to bus broker {broker}"))?;

        Ok(Self {
            client,
            service_name: service_name.to_string(),
            values: HashMap::new(),
        })
    }

    /// Subscribe to external writes of `/Mode` and hand back the consumer
    /// channel. Must be called before the publisher starts ticking.
    pub fn mode_write_receiver(&mut self) -> Result<mqtt::Receiver<Option<mqtt::Message>>> {
        let receiver = self.client.start_consuming();
        let topic = format!("{}/W/Mode", self.service_name);
        self.client
            .subscribe(&topic, 1)
            .with_context(|| format!("subscribing to {topic}"))?;
        Ok(receiver)
    }

    fn publish(&self, path: &str, value: &Value) -> Result<()> {
        let topic = format!("{}{}", self.service_name, path);
        let message = mqtt::Message::new_retained(topic, value.to_payload(), mqtt::QOS_1);
        self.client.publish(message).context("bus publish failed")?;
        Ok(())
    }
}

impl BusService for MqttBus {
    fn register(&mut self, path: &str, initial: Value) -> Result<()> {
        if self.values.contains_key(path) {
            bail!("bus path {path} registered twice");
        }
        self.publish(path, &initial)?;
        self.values.insert(path.to_string(), initial);
        Ok(())
    }

    fn write(&mut self, path: &str, value: Value) -> Result<()> {
        match self.values.get(path) {
            None => bail!("write to unregistered bus path {path}"),
            // only changes go out, the broker retains the rest
            Some(previous) if *previous == value => Ok(()),
            Some(_) => {
                self.publish(path, &value)?;
                self.values.insert(path.to_string(), value);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_wrapped_objects() {
        assert_eq!(Value::Int(7).to_payload(), r#"{"value":7}"#);
        assert_eq!(Value::Float(3.25).to_payload(), r#"{"value":3.25}"#);
        assert_eq!(
            Value::Text("M1C1".into()).to_payload(),
            r#"{"value":"M1C1"}"#
        );
        assert_eq!(Value::from(true), Value::Int(1));
    }
}
