//! Device wrappers shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use device_link::{
    Connector, DeviceClient, Endpoint, EventSink, MockConnector, PinMode, Pull, RawCommand,
    ReportKind,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock device whose mode changes and pwm writes take a while, the way a
/// round trip over a real link does. `fault_writes` makes digital writes
/// crash the calling task, like a driver bug would.
#[derive(Clone, Default)]
pub struct SlowLink {
    pub mock: MockConnector,
    pub set_mode: Duration,
    pub pwm: Duration,
    pub fault_writes: bool,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl SlowLink {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

struct SlowClient {
    inner: Arc<dyn DeviceClient>,
    link: SlowLink,
}

#[async_trait]
impl Connector for SlowLink {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: EventSink,
    ) -> device_link::Result<Arc<dyn DeviceClient>> {
        let inner = self.mock.connect(endpoint, events).await?;
        Ok(Arc::new(SlowClient {
            inner,
            link: self.clone(),
        }))
    }
}

#[async_trait]
impl DeviceClient for SlowClient {
    fn endpoint(&self) -> &Endpoint {
        self.inner.endpoint()
    }

    async fn set_mode(&self, pin: u32, mode: PinMode) -> device_link::Result<()> {
        tokio::time::sleep(self.link.set_mode).await;
        self.inner.set_mode(pin, mode).await
    }

    async fn set_pull(&self, pin: u32, pull: Pull) -> device_link::Result<()> {
        self.inner.set_pull(pin, pull).await
    }

    async fn set_glitch_filter(&self, pin: u32, micros: u32) -> device_link::Result<()> {
        self.inner.set_glitch_filter(pin, micros).await
    }

    async fn set_pwm_frequency(&self, pin: u32, hz: u32) -> device_link::Result<u32> {
        self.inner.set_pwm_frequency(pin, hz).await
    }

    async fn read(&self, pin: u32) -> device_link::Result<u32> {
        self.inner.read(pin).await
    }

    async fn subscribe(&self, pin: u32, kind: ReportKind) -> device_link::Result<()> {
        self.inner.subscribe(pin, kind).await
    }

    async fn unsubscribe(&self, pin: u32) -> device_link::Result<()> {
        self.inner.unsubscribe(pin).await
    }

    #[allow(clippy::panic)]
    async fn write(&self, pin: u32, high: bool) -> device_link::Result<()> {
        if self.link.fault_writes {
            panic!("driver fault writing pin {pin}");
        }
        self.inner.write(pin, high).await
    }

    async fn write_pwm(&self, pin: u32, duty: u8) -> device_link::Result<()> {
        self.link.log.lock().unwrap().push(format!("start {duty}"));
        tokio::time::sleep(self.link.pwm).await;
        let res = self.inner.write_pwm(pin, duty).await;
        self.link.log.lock().unwrap().push(format!("end {duty}"));
        res
    }

    async fn write_servo(&self, pin: u32, pulse_us: u32) -> device_link::Result<()> {
        self.inner.write_servo(pin, pulse_us).await
    }

    async fn send_raw(&self, cmd: RawCommand) -> device_link::Result<()> {
        self.inner.send_raw(cmd).await
    }

    async fn close(&self) -> device_link::Result<()> {
        self.inner.close().await
    }
}
