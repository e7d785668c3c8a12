use anyhow::{Context, Result, bail};
use log::*;
use paho_mqtt as mqtt;
use serde::Deserialize;
use serde_json::json;
use std::{
    fs::File,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use ws3000_lib::{
    poll::PollLoop,
    protocol::{Channel, Units},
    safe_client::{DeviceSummary, SafeClient},
    transport::Transport,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttConfig {
    /// Broker URI, e.g. "tcp://localhost:1883"
    pub uri: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Prefix of the availability and state topics
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Quality of service code to use
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_keep_alive", with = "humantime_serde")]
    pub keep_alive: Duration,
    /// Publish Home Assistant discovery messages for the active channels
    #[serde(default = "default_discovery")]
    pub discovery: bool,
    #[serde(default = "default_discovery_prefix")]
    pub discovery_prefix: String,
    #[serde(default = "default_expire_after", with = "humantime_serde")]
    pub expire_after: Duration,
}

fn default_client_id() -> String {
    String::from("WS3000_Sensor")
}

fn default_topic_prefix() -> String {
    String::from("ws-3000/misol")
}

fn default_qos() -> u8 {
    0
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(20)
}

fn default_discovery() -> bool {
    true
}

fn default_discovery_prefix() -> String {
    String::from("homeassistant")
}

fn default_expire_after() -> Duration {
    Duration::from_secs(60 * 60)
}

const AVAILABILITY_ONLINE: &str = "Online";
const AVAILABILITY_OFFLINE: &str = "Offline";

impl MqttConfig {
    pub const DEFAULT_CONFIG_FILE: &'static str = "mqtt.yaml";

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading MQTT config file from {path:?}");
        let file =
            File::open(path).with_context(|| format!("Cannot open MQTT config file {path:?}"))?;
        let config: Self = serde_yaml::from_reader(file)
            .with_context(|| format!("Cannot parse MQTT config file {path:?}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.qos > 2 {
            bail!("Invalid MQTT qos {}, must be 0, 1 or 2", self.qos);
        }
        Ok(())
    }

    pub fn qos(&self) -> i32 {
        self.qos as i32
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/status", self.topic_prefix)
    }

    pub fn state_topic(&self, key: &str) -> String {
        format!("{}/sensors/{key}", self.topic_prefix)
    }

    fn discovery_topic(&self, object_id: &str) -> String {
        format!("{}/sensor/{object_id}/config", self.discovery_prefix)
    }
}

/// Home Assistant discovery messages for every active channel.
fn discovery_messages(config: &MqttConfig, summary: &DeviceSummary) -> Vec<(String, String)> {
    let mut messages = Vec::with_capacity(summary.sensor_count() * 2);
    for &channel in &summary.active_channels {
        messages.push(temperature_discovery(config, channel, summary.units()));
        messages.push(humidity_discovery(config, channel));
    }
    messages
}

fn device_json(config: &MqttConfig) -> serde_json::Value {
    json!({
        "identifiers": [config.client_id],
        "name": "WS-3000",
        "model": "WS-3000 / HP-3000",
    })
}

fn temperature_discovery(config: &MqttConfig, channel: Channel, units: Units) -> (String, String) {
    let object_id = format!("temp_ch{channel}");
    let payload = json!({
        "unique_id": format!("{}_{object_id}", config.client_id.to_lowercase()),
        "name": format!("Temperature Sensor {channel}"),
        "state_topic": config.state_topic(&format!("temperature_CH{channel}")),
        "availability_topic": config.availability_topic(),
        "payload_available": AVAILABILITY_ONLINE,
        "payload_not_available": AVAILABILITY_OFFLINE,
        "expire_after": config.expire_after.as_secs(),
        "device_class": "temperature",
        "state_class": "measurement",
        "suggested_display_precision": 1,
        "unit_of_measurement": format!("°{}", units.symbol()),
        "device": device_json(config),
    });
    (config.discovery_topic(&object_id), payload.to_string())
}

fn humidity_discovery(config: &MqttConfig, channel: Channel) -> (String, String) {
    let object_id = format!("hum_ch{channel}");
    let payload = json!({
        "unique_id": format!("{}_{object_id}", config.client_id.to_lowercase()),
        "name": format!("Humidity Sensor {channel}"),
        "state_topic": config.state_topic(&format!("humidity_CH{channel}")),
        "availability_topic": config.availability_topic(),
        "payload_available": AVAILABILITY_ONLINE,
        "payload_not_available": AVAILABILITY_OFFLINE,
        "expire_after": config.expire_after.as_secs(),
        "device_class": "humidity",
        "state_class": "measurement",
        "unit_of_measurement": "%",
        "icon": "mdi:water-percent",
        "device": device_json(config),
    });
    (config.discovery_topic(&object_id), payload.to_string())
}

fn connect(config: &MqttConfig) -> Result<mqtt::Client> {
    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(&config.uri)
        .client_id(&config.client_id)
        .finalize();
    let mut client =
        mqtt::Client::new(create_opts).with_context(|| "Error creating mqtt client")?;

    // Use 5sec timeouts for sync calls.
    client.set_timeout(Duration::from_secs(5));

    let last_will = mqtt::Message::new_retained(
        config.availability_topic(),
        AVAILABILITY_OFFLINE,
        mqtt::QOS_2,
    );
    let mut conn_builder = mqtt::ConnectOptionsBuilder::new();
    let mut conn_builder = conn_builder
        .keep_alive_interval(config.keep_alive)
        .clean_session(true)
        .will_message(last_will);
    if let Some(user_name) = &config.username {
        conn_builder = conn_builder.user_name(user_name);
    }
    if let Some(password) = &config.password {
        conn_builder = conn_builder.password(password);
    }
    let conn_opts = conn_builder.finalize();

    info!("Connecting to MQTT broker {}", config.uri);
    client
        .connect(conn_opts)
        .with_context(|| format!("Mqtt client unable to connect to {}", config.uri))?;
    Ok(client)
}

fn publish_availability(client: &mqtt::Client, config: &MqttConfig, payload: &str) -> Result<()> {
    let msg = mqtt::Message::new_retained(config.availability_topic(), payload, mqtt::QOS_2);
    client
        .publish(msg)
        .with_context(|| "Cannot publish mqtt availability message")
}

fn publish_discovery<T: Transport>(
    client: &mqtt::Client,
    config: &MqttConfig,
    device: &SafeClient<T>,
) -> Result<()> {
    let summary = match device.discover() {
        Ok(summary) => summary,
        Err(err) => {
            warn!("Cannot discover active channels, skipping discovery messages: {err}");
            return Ok(());
        }
    };
    for (topic, payload) in discovery_messages(config, &summary) {
        debug!("Publishing discovery message to {topic}");
        client
            .publish(mqtt::Message::new_retained(topic, payload, config.qos()))
            .with_context(|| "Cannot publish mqtt discovery message")?;
    }
    Ok(())
}

/// Polls the console and publishes every reading until Ctrl-C is received.
pub fn run_daemon<T: Transport>(
    device: &SafeClient<T>,
    poll_interval: &Duration,
    config_file: &str,
) -> Result<()> {
    let config = MqttConfig::load(config_file)?;
    trace!("MQTT config: {config:?}");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
        trace!("Received Ctrl-C")
    })
    .with_context(|| "Error setting Ctrl-C handler")?;

    let client = connect(&config)?;
    if config.discovery {
        publish_discovery(&client, &config, device)?;
    }
    publish_availability(&client, &config, AVAILABILITY_ONLINE)?;

    for values in PollLoop::new(device.clone(), *poll_interval) {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        // A failed cycle is already logged by the poll loop.
        let Ok(values) = values else { continue };
        for (key, value) in values.entries() {
            let topic = config.state_topic(&key);
            trace!("Publishing {value} to {topic}");
            client
                .publish(mqtt::Message::new(topic, value, config.qos()))
                .with_context(|| "Cannot publish mqtt message")?;
        }
    }

    info!("Stopping MQTT daemon");
    publish_availability(&client, &config, AVAILABILITY_OFFLINE)?;
    client
        .disconnect(None)
        .with_context(|| "Error disconnect mqtt client")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ws3000_lib::protocol::DeviceConfiguration;

    fn config() -> MqttConfig {
        serde_yaml::from_str("uri: tcp://localhost:1883").expect("valid config")
    }

    fn channel(n: u8) -> Channel {
        Channel::try_from(n).expect("valid channel")
    }

    #[test]
    fn config_defaults() {
        let config = config();
        assert_eq!(config.uri, "tcp://localhost:1883");
        assert_eq!(config.username, None);
        assert_eq!(config.client_id, "WS3000_Sensor");
        assert_eq!(config.qos(), 0);
        assert_eq!(config.keep_alive, Duration::from_secs(20));
        assert!(config.discovery);
        assert_eq!(config.expire_after, Duration::from_secs(3600));
        assert_eq!(config.availability_topic(), "ws-3000/misol/status");
        assert_eq!(
            config.state_topic("temperature_CH1"),
            "ws-3000/misol/sensors/temperature_CH1"
        );
    }

    #[test]
    fn config_overrides() {
        let config: MqttConfig = serde_yaml::from_str(
            "uri: ssl://broker:8883\n\
             username: user\n\
             password: secret\n\
             topic_prefix: home/ws3000\n\
             qos: 1\n\
             keep_alive: 1m\n\
             discovery: false\n\
             expire_after: 15m\n",
        )
        .expect("valid config");
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.qos(), 1);
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert!(!config.discovery);
        assert_eq!(config.expire_after, Duration::from_secs(900));
        assert_eq!(config.availability_topic(), "home/ws3000/status");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_invalid_qos() {
        let config: MqttConfig =
            serde_yaml::from_str("uri: tcp://localhost:1883\nqos: 3").expect("valid yaml");
        assert!(config.validate().is_err());
    }

    #[test]
    fn discovery_for_active_channels() {
        let config = config();
        let summary = DeviceSummary {
            configuration: DeviceConfiguration {
                units: Units::Fahrenheit,
            },
            active_channels: vec![channel(1), channel(3)],
        };
        let messages = discovery_messages(&config, &summary);
        let topics: Vec<_> = messages.iter().map(|(topic, _)| topic.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/temp_ch1/config",
                "homeassistant/sensor/hum_ch1/config",
                "homeassistant/sensor/temp_ch3/config",
                "homeassistant/sensor/hum_ch3/config",
            ]
        );

        let temperature: serde_json::Value =
            serde_json::from_str(&messages[2].1).expect("valid json");
        assert_eq!(temperature["unique_id"], "ws3000_sensor_temp_ch3");
        assert_eq!(temperature["unit_of_measurement"], "°F");
        assert_eq!(
            temperature["state_topic"],
            "ws-3000/misol/sensors/temperature_CH3"
        );
        assert_eq!(temperature["availability_topic"], "ws-3000/misol/status");
        assert_eq!(temperature["expire_after"], 3600);

        let humidity: serde_json::Value = serde_json::from_str(&messages[1].1).expect("valid json");
        assert_eq!(humidity["unit_of_measurement"], "%");
        assert_eq!(humidity["state_topic"], "ws-3000/misol/sensors/humidity_CH1");
    }

    #[test]
    fn no_discovery_without_sensors() {
        let summary = DeviceSummary {
            configuration: DeviceConfiguration {
                units: Units::Celsius,
            },
            active_channels: Vec::new(),
        };
        assert!(discovery_messages(&config(), &summary).is_empty());
    }
}
