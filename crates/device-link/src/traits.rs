use crate::{
    DeviceEvent, Endpoint, PinMode, Pull, RawCommand, ReportKind, Result, TransportError,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where a client pushes its lifecycle and data events.
pub type EventSink = mpsc::UnboundedSender<DeviceEvent>;

/// An open session with one device.
///
/// Every operation is asynchronous and completes independently; callers
/// that care about ordering await one operation before issuing the next.
/// Lifecycle changes (ready, disconnected, closed) arrive on the
/// [`EventSink`] handed to [`Connector::connect`].
#[async_trait]
pub trait DeviceClient: Send + Sync {
    fn endpoint(&self) -> &Endpoint;

    async fn set_mode(&self, pin: u32, mode: PinMode) -> Result<()>;

    async fn set_pull(&self, _pin: u32, _pull: Pull) -> Result<()> {
        Err(TransportError::Unsupported("pull resistors"))
    }

    /// Require a level to be stable for `micros` before it is reported.
    async fn set_glitch_filter(&self, _pin: u32, _micros: u32) -> Result<()> {
        Err(TransportError::Unsupported("glitch filter"))
    }

    /// Returns the frequency the device actually selected.
    async fn set_pwm_frequency(&self, _pin: u32, _hz: u32) -> Result<u32> {
        Err(TransportError::Unsupported("pwm frequency"))
    }

    /// One-shot read of the current level or analog value.
    async fn read(&self, pin: u32) -> Result<u32>;

    /// Start emitting [`DeviceEvent::Level`] / [`DeviceEvent::Analog`] for `pin`.
    async fn subscribe(&self, pin: u32, kind: ReportKind) -> Result<()>;

    async fn unsubscribe(&self, pin: u32) -> Result<()>;

    async fn write(&self, pin: u32, high: bool) -> Result<()>;

    async fn write_pwm(&self, pin: u32, duty: u8) -> Result<()>;

    async fn write_servo(&self, pin: u32, pulse_us: u32) -> Result<()>;

    async fn send_raw(&self, _cmd: RawCommand) -> Result<()> {
        Err(TransportError::Unsupported("raw commands"))
    }

    /// Graceful close. Calling it twice is harmless.
    async fn close(&self) -> Result<()>;
}

/// Opens clients for an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new client. The returned handle is not usable until the
    /// client has pushed [`DeviceEvent::Ready`] into `events`.
    async fn connect(&self, endpoint: &Endpoint, events: EventSink)
        -> Result<Arc<dyn DeviceClient>>;
}
