use core::fmt;

/// Which family of client talks to an endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransportKind {
    /// Firmata over a serial port.
    Serial,
    /// pigpio daemon over TCP.
    GpioDaemon,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::GpioDaemon => write!(f, "gpio-daemon"),
        }
    }
}

/// Address of one device.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Endpoint {
    Serial { path: String },
    GpioDaemon { host: String, port: u16 },
}

impl Endpoint {
    pub fn serial(path: impl Into<String>) -> Self {
        Endpoint::Serial { path: path.into() }
    }

    pub fn gpio_daemon(host: impl Into<String>, port: u16) -> Self {
        Endpoint::GpioDaemon {
            host: host.into(),
            port,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Endpoint::Serial { .. } => TransportKind::Serial,
            Endpoint::GpioDaemon { .. } => TransportKind::GpioDaemon,
        }
    }

    pub fn is_networked(&self) -> bool {
        matches!(self, Endpoint::GpioDaemon { .. })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Serial { path } => write!(f, "{path}"),
            Endpoint::GpioDaemon { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// Electrical mode of a device pin.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PinMode {
    Input,
    InputPullUp,
    Analog,
    Output,
    Pwm,
    Servo,
}

/// Pull resistor setting for an input.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Pull {
    #[default]
    Off,
    Down,
    Up,
}

/// Which kind of change notifications a subscription asks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ReportKind {
    Digital,
    Analog,
}

/// Raw payloads passed straight through to the device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RawCommand {
    Text(String),
    /// Sysex body without the start/end markers; every byte must be 7-bit.
    Sysex(Vec<u8>),
}

/// Lifecycle and data notifications emitted by a client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    Ready,
    Disconnected,
    Closed,
    Error(String),
    Level { pin: u32, level: u32 },
    Analog { pin: u32, value: u32 },
    Text(String),
}

/// An address the host can offer for selection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortInfo {
    pub name: String,
    pub driver: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_display_matches_address() {
        assert_eq!(Endpoint::serial("/dev/ttyUSB0").to_string(), "/dev/ttyUSB0");
        let ep = Endpoint::gpio_daemon("10.0.0.7", 8888);
        assert_eq!(ep.to_string(), "10.0.0.7:8888");
        assert_eq!(ep.kind(), TransportKind::GpioDaemon);
        assert!(ep.is_networked());
    }
}
