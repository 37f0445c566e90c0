//! Topology files and the validated per-device / per-pin configuration.

use crate::error::{ControlError, Result};
use crate::transform::{self, ServoRange};
use anyhow::Context;
use device_link::{Endpoint, Pull, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DAEMON_HOST: &str = "127.0.0.1";
pub const DEFAULT_DAEMON_PORT: u16 = 8888;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportSpec {
    Serial,
    GpioDaemon,
}

impl From<TransportSpec> for TransportKind {
    fn from(t: TransportSpec) -> Self {
        match t {
            TransportSpec::Serial => TransportKind::Serial,
            TransportSpec::GpioDaemon => TransportKind::GpioDaemon,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub transport: TransportSpec,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub retry_ms: Option<u64>,
    #[serde(default)]
    pub watchdog_ms: Option<u64>,
    #[serde(default)]
    pub reconfigure_ms: Option<u64>,
    #[serde(default)]
    pub initial_read_ms: Option<u64>,
}

/// What a pin does for the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogicalMode {
    DigitalIn,
    DigitalInPullup,
    AnalogIn,
    StringIn,
    DigitalOut,
    PwmOut,
    ServoOut,
    StringOut,
    SysexOut,
}

impl LogicalMode {
    pub fn is_input(self) -> bool {
        matches!(
            self,
            LogicalMode::DigitalIn
                | LogicalMode::DigitalInPullup
                | LogicalMode::AnalogIn
                | LogicalMode::StringIn
        )
    }

    pub fn supported_on(self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Serial => true,
            TransportKind::GpioDaemon => matches!(
                self,
                LogicalMode::DigitalIn
                    | LogicalMode::DigitalInPullup
                    | LogicalMode::DigitalOut
                    | LogicalMode::PwmOut
                    | LogicalMode::ServoOut
            ),
        }
    }

    /// Modes that address a physical pin.
    fn needs_pin(self) -> bool {
        !matches!(
            self,
            LogicalMode::StringIn | LogicalMode::StringOut | LogicalMode::SysexOut
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullSpec {
    #[default]
    Off,
    Down,
    Up,
}

impl From<PullSpec> for Pull {
    fn from(p: PullSpec) -> Self {
        match p {
            PullSpec::Off => Pull::Off,
            PullSpec::Down => Pull::Down,
            PullSpec::Up => Pull::Up,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinSpec {
    pub id: String,
    pub device: String,
    #[serde(default)]
    pub pin: Option<u32>,
    pub mode: LogicalMode,
    #[serde(default)]
    pub pull: PullSpec,
    #[serde(default)]
    pub debounce_us: Option<i64>,
    #[serde(default)]
    pub read_initial: bool,
    #[serde(default)]
    pub frequency_hz: Option<i64>,
    #[serde(default)]
    pub servo_min: Option<f64>,
    #[serde(default)]
    pub servo_max: Option<f64>,
    #[serde(default)]
    pub initial_level: Option<serde_json::Value>,
    #[serde(default)]
    pub apply_initial: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    #[serde(default)]
    pub pins: Vec<PinSpec>,
}

impl Topology {
    pub fn device(&self, id: &str) -> Option<&DeviceSpec> {
        self.devices.iter().find(|d| d.id == id)
    }

    /// Ids must be unique across devices and pins, since both are nodes
    /// addressed by the host.
    pub fn check_ids(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let ids = self
            .devices
            .iter()
            .map(|d| &d.id)
            .chain(self.pins.iter().map(|p| &p.id));
        for id in ids {
            if id.is_empty() {
                return Err(ControlError::Config("empty node id".into()));
            }
            if !seen.insert(id.as_str()) {
                return Err(ControlError::Config(format!("duplicate node id {id}")));
            }
        }
        Ok(())
    }
}

pub fn parse_topology(raw: &str) -> anyhow::Result<Topology> {
    let topo: Topology = serde_yaml::from_str(raw).context("parsing topology yaml")?;
    Ok(topo)
}

pub fn load_topology_file(path: impl AsRef<Path>) -> anyhow::Result<Topology> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading topology: {}", path.display()))?;
    parse_topology(&raw).with_context(|| format!("decoding topology: {}", path.display()))
}

/// Timers used by a supervisor and the sessions that ride on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub retry: Duration,
    pub watchdog: Duration,
    pub reconfigure: Duration,
    pub initial_read: Duration,
}

impl Timing {
    pub fn for_transport(kind: TransportKind) -> Self {
        let watchdog = match kind {
            TransportKind::Serial => 5000,
            TransportKind::GpioDaemon => 4500,
        };
        Self {
            retry: Duration::from_millis(5000),
            watchdog: Duration::from_millis(watchdog),
            reconfigure: Duration::from_millis(5500),
            initial_read: Duration::from_millis(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub id: String,
    pub endpoint: Endpoint,
    pub timing: Timing,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, endpoint: Endpoint) -> Self {
        let timing = Timing::for_transport(endpoint.kind());
        Self {
            id: id.into(),
            endpoint,
            timing,
        }
    }

    pub fn from_spec(spec: &DeviceSpec) -> Result<Self> {
        let endpoint = match spec.transport {
            TransportSpec::Serial => {
                let path = spec
                    .path
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| {
                        ControlError::Config(format!("{}: port not configured", spec.id))
                    })?;
                Endpoint::serial(path.trim())
            }
            TransportSpec::GpioDaemon => Endpoint::gpio_daemon(
                spec.host
                    .as_deref()
                    .filter(|h| !h.trim().is_empty())
                    .unwrap_or(DEFAULT_DAEMON_HOST)
                    .trim(),
                spec.port.unwrap_or(DEFAULT_DAEMON_PORT),
            ),
        };
        let mut cfg = Self::new(spec.id.clone(), endpoint);
        if let Some(ms) = spec.retry_ms {
            cfg.timing.retry = Duration::from_millis(ms);
        }
        if let Some(ms) = spec.watchdog_ms {
            cfg.timing.watchdog = Duration::from_millis(ms);
        }
        if let Some(ms) = spec.reconfigure_ms {
            cfg.timing.reconfigure = Duration::from_millis(ms);
        }
        if let Some(ms) = spec.initial_read_ms {
            cfg.timing.initial_read = Duration::from_millis(ms);
        }
        Ok(cfg)
    }
}

/// Header pin for a BCM gpio on the 40-pin connector.
pub fn bcm_header_pin(bcm: u32) -> Option<u32> {
    let header = match bcm {
        2 => 3,
        3 => 5,
        4 => 7,
        14 => 8,
        15 => 10,
        17 => 11,
        18 => 12,
        27 => 13,
        22 => 15,
        23 => 16,
        24 => 18,
        10 => 19,
        9 => 21,
        25 => 22,
        11 => 23,
        8 => 24,
        7 => 26,
        5 => 29,
        6 => 31,
        12 => 32,
        13 => 33,
        19 => 35,
        16 => 36,
        26 => 37,
        20 => 38,
        21 => 40,
        _ => return None,
    };
    Some(header)
}

/// A pin that passed validation, with every numeric setting clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct PinConfig {
    pub id: String,
    pub device: String,
    pub transport: TransportKind,
    pub pin: u32,
    pub mode: LogicalMode,
    pub pull: Pull,
    pub debounce_us: u32,
    pub read_initial: bool,
    pub frequency_hz: u32,
    pub servo: ServoRange,
    pub initial_level: Option<bool>,
}

impl PinConfig {
    pub fn new(
        id: impl Into<String>,
        device: impl Into<String>,
        transport: TransportKind,
        pin: u32,
        mode: LogicalMode,
    ) -> Self {
        let pull = if mode == LogicalMode::DigitalInPullup {
            Pull::Up
        } else {
            Pull::Off
        };
        Self {
            id: id.into(),
            device: device.into(),
            transport,
            pin,
            mode,
            pull,
            debounce_us: transform::clamp_debounce(None),
            read_initial: false,
            frequency_hz: transform::clamp_frequency(None),
            servo: ServoRange::default(),
            initial_level: None,
        }
    }

    pub fn from_spec(spec: &PinSpec, transport: TransportKind) -> Result<Self> {
        let bad = |why: String| ControlError::Config(format!("{}: {why}", spec.id));
        if !spec.mode.supported_on(transport) {
            return Err(bad(format!("mode {:?} not available on {transport}", spec.mode)));
        }
        let pin = match spec.pin {
            Some(p) => p,
            None if !spec.mode.needs_pin() => 0,
            None => return Err(bad("pin not set".into())),
        };
        if transport == TransportKind::GpioDaemon && bcm_header_pin(pin).is_none() {
            return Err(bad(format!("gpio {pin} is not on the header")));
        }
        let mut cfg = Self::new(spec.id.clone(), spec.device.clone(), transport, pin, spec.mode);
        if spec.mode != LogicalMode::DigitalInPullup {
            cfg.pull = spec.pull.into();
        }
        if transport == TransportKind::Serial && cfg.pull == Pull::Down {
            return Err(bad("pull-down not available on serial boards".into()));
        }
        cfg.debounce_us = transform::clamp_debounce(spec.debounce_us);
        cfg.read_initial = spec.read_initial;
        cfg.frequency_hz = transform::clamp_frequency(spec.frequency_hz);
        cfg.servo = ServoRange::from_hundredths(spec.servo_min, spec.servo_max);
        if spec.apply_initial && spec.mode == LogicalMode::DigitalOut {
            let raw = spec
                .initial_level
                .clone()
                .unwrap_or(serde_json::Value::from(0));
            let level = transform::digital_level(&raw)
                .map_err(|e| bad(format!("initial level: {e}")))?;
            cfg.initial_level = Some(level);
        }
        Ok(cfg)
    }

    /// Topic carried by values this pin emits.
    pub fn topic(&self) -> String {
        match (self.transport, self.mode) {
            (TransportKind::GpioDaemon, _) => match bcm_header_pin(self.pin) {
                Some(header) => format!("pi/{header}"),
                None => format!("pi/gpio{}", self.pin),
            },
            (TransportKind::Serial, LogicalMode::AnalogIn) => format!("A{}", self.pin),
            (TransportKind::Serial, LogicalMode::StringIn) => "string".to_string(),
            (TransportKind::Serial, _) => self.pin.to_string(),
        }
    }
}
