//! cmqttd — bridge a Clipsal C-Bus PCI onto an MQTT broker.
//!
//! Every flag is mirrored by a `CMQTTD_*` environment variable. Exit codes:
//! 0 on clean shutdown, 1 on configuration errors, 2 when the PCI or broker
//! link fails beyond recovery.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use log::{error, warn};

use cbusd::bridge::{self, BridgeConfig, BridgeError, BridgeEvents};
use cbusd::conn::{ConnConfig, PciAddr, PciConnection};

#[derive(Parser)]
#[command(
    name = "cmqttd",
    version,
    about = "Bridge a Clipsal C-Bus PCI to an MQTT broker for Home Assistant"
)]
struct Args {
    /// TCP endpoint of the PCI (host:port).
    #[arg(long, env = "CMQTTD_TCP", conflicts_with = "serial")]
    tcp: Option<String>,

    /// Serial device of the PCI (e.g. /dev/ttyUSB0), driven at 9600 8N1.
    #[arg(long, env = "CMQTTD_SERIAL")]
    serial: Option<String>,

    /// MQTT broker hostname.
    #[arg(long, env = "CMQTTD_BROKER")]
    broker: String,

    /// MQTT broker port.
    #[arg(long, env = "CMQTTD_BROKER_PORT", default_value_t = 1883)]
    broker_port: u16,

    /// MQTT username.
    #[arg(long, env = "CMQTTD_USERNAME")]
    username: Option<String>,

    /// MQTT password.
    #[arg(long, env = "CMQTTD_PASSWORD")]
    password: Option<String>,

    /// CA certificate file; enables TLS to the broker.
    #[arg(long, env = "CMQTTD_CA")]
    ca: Option<PathBuf>,

    /// Client certificate file (TLS client authentication).
    #[arg(long, env = "CMQTTD_CERT", requires = "key")]
    cert: Option<PathBuf>,

    /// Client private key file (TLS client authentication).
    #[arg(long, env = "CMQTTD_KEY", requires = "cert")]
    key: Option<PathBuf>,

    /// C-Bus Toolkit project archive supplying human-readable group labels.
    #[arg(long, env = "CMQTTD_PROJECT_FILE")]
    project_file: Option<PathBuf>,

    /// Lighting applications to bridge, as hex bytes (e.g. `38,39`).
    #[arg(
        long,
        env = "CMQTTD_APPS",
        value_delimiter = ',',
        default_value = "38",
        value_parser = parse_hex_byte
    )]
    apps: Vec<u8>,

    /// Seconds between clock broadcasts onto the C-Bus.
    #[arg(long, env = "CMQTTD_CLOCK_INTERVAL", default_value_t = 300)]
    clock_interval: u64,

    /// Seconds between bulk status resyncs (0 disables).
    #[arg(long, env = "CMQTTD_RESYNC_INTERVAL", default_value_t = 300)]
    resync_interval: u64,

    /// Consecutive failed PCI connections tolerated (0 retries forever).
    #[arg(long, env = "CMQTTD_RECONNECT_LIMIT", default_value_t = 0)]
    reconnect_limit: u32,

    /// Raise log verbosity (-v debug, -vv trace). `RUST_LOG` overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_hex_byte(s: &str) -> Result<u8, String> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| format!("not a hex byte: {e}"))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let addr = match (&args.tcp, &args.serial) {
        (Some(endpoint), None) => PciAddr::Tcp(endpoint.clone()),
        (None, Some(path)) => PciAddr::Serial(path.clone()),
        _ => {
            error!("exactly one of --tcp or --serial is required");
            return ExitCode::from(1);
        }
    };

    if let Some(project) = &args.project_file {
        warn!(
            "project archive {} accepted but not read; discovery uses numeric group names",
            project.display()
        );
    }

    let mut conn_cfg = ConnConfig::new(addr);
    conn_cfg.engine.lighting_apps = args.apps.clone();
    conn_cfg.engine.clock_interval = Duration::from_secs(args.clock_interval);
    conn_cfg.engine.resync_interval = Duration::from_secs(args.resync_interval);
    conn_cfg.reconnect_limit = (args.reconnect_limit > 0).then_some(args.reconnect_limit);

    let bridge_cfg = BridgeConfig {
        broker: args.broker,
        port: args.broker_port,
        client_id: "cmqttd".into(),
        username: args.username,
        password: args.password,
        ca_file: args.ca,
        client_cert: args.cert,
        client_key: args.key,
        lighting_apps: args.apps,
    };

    let (tasks_tx, tasks_rx) = mpsc::channel();
    let conn = match PciConnection::spawn(conn_cfg, BridgeEvents::new(tasks_tx.clone())) {
        Ok(conn) => conn,
        Err(e) => {
            error!("failed to start the PCI event loop: {e}");
            return ExitCode::from(2);
        }
    };

    match bridge::run(bridge_cfg, conn, tasks_tx, tasks_rx) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ BridgeError::Io(_)) => {
            error!("{e}");
            ExitCode::from(1)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(2)
        }
    }
}
