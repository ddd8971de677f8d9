//! MQTT bridge between the PCI engine and Home Assistant.
//!
//! Subscribes to per-group `set` topics carrying `light`-schema JSON,
//! translates them into engine operations, and publishes retained state only
//! once the engine confirms a command (abandoned and connection-lost
//! commands leave the MQTT state untouched). Publishes Home Assistant
//! discovery documents for every group of each configured lighting
//! application when the PCI link comes up.
//!
//! Engine callbacks run on the engine thread and only enqueue tasks here;
//! the publisher thread does all MQTT I/O.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{Client, Event, Incoming, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};
use serde::{Deserialize, Serialize};

use crate::conn::PciConnection;
use crate::engine::{Completion, Events, SendOutcome};

/// Availability topic; the MQTT last will marks us offline.
pub const STATUS_TOPIC: &str = "cmqttd/status";
const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

/// Upper bound on waiting for a command's terminal outcome: the confirm
/// window plus its retries.
const COMMAND_WAIT: Duration = Duration::from_secs(35);

/// Broker and discovery configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub lighting_apps: Vec<u8>,
}

/// Errors that terminate the bridge.
#[derive(Debug)]
pub enum BridgeError {
    Io(io::Error),
    Mqtt(rumqttc::ClientError),
    /// The PCI event loop died (e.g. reconnect limit exhausted).
    Pci(crate::conn::ConnError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Io(e) => write!(f, "I/O error: {e}"),
            BridgeError::Mqtt(e) => write!(f, "MQTT error: {e}"),
            BridgeError::Pci(e) => write!(f, "PCI connection error: {e}"),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<io::Error> for BridgeError {
    fn from(e: io::Error) -> Self {
        BridgeError::Io(e)
    }
}

impl From<rumqttc::ClientError> for BridgeError {
    fn from(e: rumqttc::ClientError) -> Self {
        BridgeError::Mqtt(e)
    }
}

// ---------------------------------------------------------------------------
// Engine-side events
// ---------------------------------------------------------------------------

/// Work for the publisher thread.
pub enum PubTask {
    /// A group's cached level changed; publish its state.
    State { application: u8, group: u8, level: u8 },
    /// The PCI link came up: publish discovery and go online.
    Online,
    /// The PCI link went down: go offline.
    Offline,
    /// An MQTT command was issued; publish state once it confirms.
    AwaitCommand {
        application: u8,
        group: u8,
        level: u8,
        completion: Completion,
    },
}

/// Engine event sink that forwards to the publisher thread.
pub struct BridgeEvents {
    tx: mpsc::Sender<PubTask>,
}

impl BridgeEvents {
    pub fn new(tx: mpsc::Sender<PubTask>) -> Self {
        Self { tx }
    }

    fn push(&self, task: PubTask) {
        let _ = self.tx.send(task);
    }
}

impl Events for BridgeEvents {
    fn on_lighting_on(&mut self, application: u8, group: u8) {
        self.push(PubTask::State { application, group, level: 255 });
    }

    fn on_lighting_off(&mut self, application: u8, group: u8) {
        self.push(PubTask::State { application, group, level: 0 });
    }

    fn on_lighting_ramp(&mut self, application: u8, group: u8, level: u8, _duration: u16) {
        self.push(PubTask::State { application, group, level });
    }

    fn on_level_changed(&mut self, application: u8, group: u8, level: u8) {
        self.push(PubTask::State { application, group, level });
    }

    fn on_connected(&mut self) {
        self.push(PubTask::Online);
    }

    fn on_disconnected(&mut self, _reason: &str) {
        self.push(PubTask::Offline);
    }

    fn on_command_abandoned(&mut self, op: &'static str) {
        warn!("command abandoned by the PCI: {op}");
    }
}

// ---------------------------------------------------------------------------
// Wire documents
// ---------------------------------------------------------------------------

/// Home Assistant `light` JSON-schema command.
#[derive(Debug, Deserialize)]
struct LightCommand {
    state: String,
    brightness: Option<u8>,
    /// Seconds.
    transition: Option<f32>,
}

#[derive(Debug, Serialize)]
struct LightState {
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    brightness: Option<u8>,
}

#[derive(Serialize)]
struct DiscoveryDoc {
    name: String,
    unique_id: String,
    schema: &'static str,
    command_topic: String,
    state_topic: String,
    availability_topic: &'static str,
    payload_available: &'static str,
    payload_not_available: &'static str,
    brightness: bool,
    device: DeviceDoc,
}

#[derive(Serialize)]
struct DeviceDoc {
    identifiers: Vec<String>,
    name: String,
    manufacturer: &'static str,
    model: &'static str,
    sw_version: &'static str,
}

fn object_id(application: u8, group: u8) -> String {
    format!("cbus_{application:02x}_{group:02x}")
}

fn state_topic(application: u8, group: u8) -> String {
    format!("homeassistant/light/{}/state", object_id(application, group))
}

fn command_topic(application: u8, group: u8) -> String {
    format!("homeassistant/light/{}/set", object_id(application, group))
}

fn config_topic(application: u8, group: u8) -> String {
    format!("homeassistant/light/{}/config", object_id(application, group))
}

/// Recover `(application, group)` from a command topic.
fn parse_command_topic(topic: &str) -> Option<(u8, u8)> {
    let object = topic
        .strip_prefix("homeassistant/light/")?
        .strip_suffix("/set")?;
    let rest = object.strip_prefix("cbus_")?;
    let (app_hex, group_hex) = rest.split_once('_')?;
    Some((
        u8::from_str_radix(app_hex, 16).ok()?,
        u8::from_str_radix(group_hex, 16).ok()?,
    ))
}

fn discovery_doc(application: u8, group: u8) -> DiscoveryDoc {
    DiscoveryDoc {
        name: format!("C-Bus light {group} (app {application:02X})"),
        unique_id: object_id(application, group),
        schema: "json",
        command_topic: command_topic(application, group),
        state_topic: state_topic(application, group),
        availability_topic: STATUS_TOPIC,
        payload_available: ONLINE,
        payload_not_available: OFFLINE,
        brightness: true,
        device: DeviceDoc {
            identifiers: vec![format!("cbus_app_{application:02x}")],
            name: format!("C-Bus lighting application {application:02X}"),
            manufacturer: "Clipsal",
            model: "C-Bus PCI via cmqttd",
            sw_version: env!("CARGO_PKG_VERSION"),
        },
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Build broker options from the configuration, wiring credentials, TLS,
/// and the offline last will.
pub fn mqtt_options(cfg: &BridgeConfig) -> Result<MqttOptions, BridgeError> {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.broker.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        STATUS_TOPIC,
        OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    if let Some(username) = &cfg.username {
        options.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
    }
    if let Some(ca_file) = &cfg.ca_file {
        let ca = fs::read(ca_file)?;
        let client_auth = match (&cfg.client_cert, &cfg.client_key) {
            (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
            _ => None,
        };
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth,
        }));
    }
    Ok(options)
}

/// Run the bridge until the MQTT request channel dies.
///
/// Spawns the publisher thread, then drives the MQTT event loop on the
/// calling thread: subscription on connect, command dispatch on publish.
/// `tasks_tx` is the same channel the engine-side [`BridgeEvents`] feeds.
pub fn run(
    cfg: BridgeConfig,
    conn: PciConnection,
    tasks_tx: mpsc::Sender<PubTask>,
    tasks_rx: mpsc::Receiver<PubTask>,
) -> Result<(), BridgeError> {
    let options = mqtt_options(&cfg)?;
    let (client, mut connection) = Client::new(options, 64);

    let publisher_client = client.clone();
    let publisher_cfg = cfg.clone();
    let publisher = thread::Builder::new()
        .name("cmqttd-pub".into())
        .spawn(move || publisher_loop(publisher_client, publisher_cfg, tasks_rx))
        .map_err(BridgeError::Io)?;

    for event in connection.iter() {
        // The PCI loop only dies on close() or when its retry cap is
        // exhausted; surface the latter as a fatal bridge error.
        if !conn.is_running() {
            break;
        }
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("connected to MQTT broker {}:{}", cfg.broker, cfg.port);
                client.subscribe("homeassistant/light/+/set", QoS::AtLeastOnce)?;
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                handle_command(&conn, &tasks_tx, &publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                // The client retries on its own; just don't spin.
                warn!("MQTT connection error: {e}");
                thread::sleep(Duration::from_secs(1));
            }
        }
    }

    drop(tasks_tx);
    let result = match conn.close() {
        Ok(()) => Ok(()),
        Err(e) => Err(BridgeError::Pci(e)),
    };
    let _ = publisher.join();
    result
}

/// Translate one `set` payload into an engine operation and queue the
/// confirmation wait.
fn handle_command(
    conn: &PciConnection,
    tasks: &mpsc::Sender<PubTask>,
    topic: &str,
    payload: &[u8],
) {
    let Some((application, group)) = parse_command_topic(topic) else {
        debug!("ignoring publish on {topic}");
        return;
    };
    let command: LightCommand = match serde_json::from_slice(payload) {
        Ok(command) => command,
        Err(e) => {
            warn!("bad light command on {topic}: {e}");
            return;
        }
    };

    let transition = command.transition.map(|s| s.ceil() as u16);
    let (level, completion) = match (command.state.as_str(), command.brightness, transition) {
        ("ON", None, None) => (255, conn.lighting_on(application, group)),
        ("ON", brightness, duration) => {
            let level = brightness.unwrap_or(255);
            (
                level,
                conn.lighting_ramp(application, group, level, duration.unwrap_or(0)),
            )
        }
        ("OFF", _, Some(duration)) => (0, conn.lighting_ramp(application, group, 0, duration)),
        ("OFF", _, None) => (0, conn.lighting_off(application, group)),
        (other, _, _) => {
            warn!("unknown light state {other:?} on {topic}");
            return;
        }
    };
    let _ = tasks.send(PubTask::AwaitCommand {
        application,
        group,
        level,
        completion,
    });
}

fn publisher_loop(client: Client, cfg: BridgeConfig, tasks: mpsc::Receiver<PubTask>) {
    for task in tasks {
        match task {
            PubTask::State { application, group, level } => {
                publish_state(&client, application, group, level);
            }
            PubTask::Online => {
                info!("PCI link up, publishing discovery");
                let _ = client.publish(STATUS_TOPIC, QoS::AtLeastOnce, true, ONLINE);
                for &application in &cfg.lighting_apps {
                    for group in 0..=255u8 {
                        let doc = discovery_doc(application, group);
                        let Ok(payload) = serde_json::to_vec(&doc) else {
                            continue;
                        };
                        let _ = client.publish(
                            config_topic(application, group),
                            QoS::AtLeastOnce,
                            true,
                            payload,
                        );
                    }
                }
            }
            PubTask::Offline => {
                let _ = client.publish(STATUS_TOPIC, QoS::AtLeastOnce, true, OFFLINE);
            }
            PubTask::AwaitCommand {
                application,
                group,
                level,
                completion,
            } => match completion.wait_timeout(COMMAND_WAIT) {
                Some(SendOutcome::Confirmed) => {
                    publish_state(&client, application, group, level);
                }
                outcome => {
                    // Abandoned and connection-lost commands leave the
                    // retained state untouched.
                    warn!(
                        "command for app {application:02X} group {group} not confirmed ({outcome:?})"
                    );
                }
            },
        }
    }
}

fn publish_state(client: &Client, application: u8, group: u8, level: u8) {
    let state = if level == 0 {
        LightState { state: "OFF", brightness: None }
    } else {
        LightState { state: "ON", brightness: Some(level) }
    };
    let Ok(payload) = serde_json::to_vec(&state) else {
        return;
    };
    if let Err(e) = client.publish(
        state_topic(application, group),
        QoS::AtLeastOnce,
        true,
        payload,
    ) {
        warn!("state publish failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_topic_round_trip() {
        let topic = command_topic(0x38, 100);
        assert_eq!(topic, "homeassistant/light/cbus_38_64/set");
        assert_eq!(parse_command_topic(&topic), Some((0x38, 100)));
    }

    #[test]
    fn foreign_topics_rejected() {
        assert_eq!(parse_command_topic("homeassistant/light/cbus_38_64/state"), None);
        assert_eq!(parse_command_topic("homeassistant/light/other_1_2/set"), None);
        assert_eq!(parse_command_topic("cmqttd/status"), None);
    }

    #[test]
    fn light_command_parses() {
        let command: LightCommand =
            serde_json::from_str(r#"{"state":"ON","brightness":128,"transition":4.5}"#).unwrap();
        assert_eq!(command.state, "ON");
        assert_eq!(command.brightness, Some(128));
        assert_eq!(command.transition, Some(4.5));

        let bare: LightCommand = serde_json::from_str(r#"{"state":"OFF"}"#).unwrap();
        assert_eq!(bare.state, "OFF");
        assert_eq!(bare.brightness, None);
    }

    #[test]
    fn state_payload_shape() {
        let on = serde_json::to_string(&LightState { state: "ON", brightness: Some(200) }).unwrap();
        assert_eq!(on, r#"{"state":"ON","brightness":200}"#);
        let off = serde_json::to_string(&LightState { state: "OFF", brightness: None }).unwrap();
        assert_eq!(off, r#"{"state":"OFF"}"#);
    }

    #[test]
    fn discovery_doc_shape() {
        let doc = discovery_doc(0x38, 100);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["schema"], "json");
        assert_eq!(json["unique_id"], "cbus_38_64");
        assert_eq!(json["command_topic"], "homeassistant/light/cbus_38_64/set");
        assert_eq!(json["state_topic"], "homeassistant/light/cbus_38_64/state");
        assert_eq!(json["availability_topic"], STATUS_TOPIC);
        assert_eq!(json["brightness"], true);
        assert_eq!(json["device"]["manufacturer"], "Clipsal");
    }
}
