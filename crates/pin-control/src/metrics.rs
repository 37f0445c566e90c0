use crate::error::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

#[derive(Clone)]
pub struct LinkMetrics {
    pub connect_attempts: IntCounter,
    pub reconnects: IntCounter,
    pub devices_ready: IntGauge,
}

#[derive(Clone)]
pub struct PinMetrics {
    pub writes: IntCounter,
    pub dropped_writes: IntCounter,
    pub events_emitted: IntCounter,
}

#[derive(Clone)]
pub struct MetricsHub {
    pub registry: Registry,
    pub link: LinkMetrics,
    pub pins: PinMetrics,
}

impl MetricsHub {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let link = LinkMetrics {
            connect_attempts: IntCounter::new(
                "pin_link_connect_attempts",
                "Device open attempts started",
            )?,
            reconnects: IntCounter::new(
                "pin_link_reconnects",
                "Times a device became ready again after its first ready",
            )?,
            devices_ready: IntGauge::new("pin_link_devices_ready", "Devices currently ready")?,
        };
        let pins = PinMetrics {
            writes: IntCounter::new("pin_session_writes", "Values written to device pins")?,
            dropped_writes: IntCounter::new(
                "pin_session_dropped_writes",
                "Inbound values dropped as invalid or while not configured",
            )?,
            events_emitted: IntCounter::new(
                "pin_session_events_emitted",
                "Input values forwarded to the host",
            )?,
        };
        registry.register(Box::new(link.connect_attempts.clone()))?;
        registry.register(Box::new(link.reconnects.clone()))?;
        registry.register(Box::new(link.devices_ready.clone()))?;
        registry.register(Box::new(pins.writes.clone()))?;
        registry.register(Box::new(pins.dropped_writes.clone()))?;
        registry.register(Box::new(pins.events_emitted.clone()))?;
        Ok(Self {
            registry,
            link,
            pins,
        })
    }

    pub fn encode_text(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            return format!("error encoding metrics: {e}");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
