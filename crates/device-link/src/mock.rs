use crate::{
    Connector, DeviceClient, DeviceEvent, Endpoint, EventSink, PinMode, PortInfo, Pull,
    RawCommand, ReportKind, Result, TransportError,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How the next `connect` call behaves.
#[derive(Clone, Debug)]
pub enum MockOpen {
    /// Open and immediately report ready.
    Ready,
    /// Open but never report ready.
    Silent,
    /// Fail the open.
    Fail(TransportError),
}

/// An operation a mock client received, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockOp {
    SetMode(u32, PinMode),
    SetPull(u32, Pull),
    GlitchFilter(u32, u32),
    PwmFrequency(u32, u32),
    Read(u32),
    Subscribe(u32, ReportKind),
    Unsubscribe(u32),
    Write(u32, bool),
    Pwm(u32, u8),
    Servo(u32, u32),
    Raw(RawCommand),
    Close,
}

impl MockOp {
    pub fn name(&self) -> &'static str {
        match self {
            MockOp::SetMode(..) => "set_mode",
            MockOp::SetPull(..) => "set_pull",
            MockOp::GlitchFilter(..) => "set_glitch_filter",
            MockOp::PwmFrequency(..) => "set_pwm_frequency",
            MockOp::Read(..) => "read",
            MockOp::Subscribe(..) => "subscribe",
            MockOp::Unsubscribe(..) => "unsubscribe",
            MockOp::Write(..) => "write",
            MockOp::Pwm(..) => "write_pwm",
            MockOp::Servo(..) => "write_servo",
            MockOp::Raw(..) => "send_raw",
            MockOp::Close => "close",
        }
    }
}

#[derive(Default)]
struct MockState {
    script: VecDeque<MockOpen>,
    failures: Vec<(&'static str, TransportError)>,
    ops: Vec<MockOp>,
    levels: HashMap<u32, u32>,
    live: Option<(u64, EventSink)>,
    next_id: u64,
    opens: u32,
    closes: u32,
}

/// An in-process device. Clones share the same state, so a test keeps one
/// handle to script opens and inject events while the code under test
/// holds another as its [`Connector`].
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn list() -> Vec<PortInfo> {
        vec![PortInfo {
            name: "mock0".to_string(),
            driver: "mock".to_string(),
        }]
    }

    /// Queue the outcome of a future `connect`. Unscripted opens succeed
    /// and report ready.
    pub fn push_open(&self, outcome: MockOpen) {
        self.state().script.push_back(outcome);
    }

    /// Make the next operation named `op` (see [`MockOp::name`]) fail.
    pub fn fail_next(&self, op: &'static str, err: TransportError) {
        self.state().failures.push((op, err));
    }

    /// Value returned by `read(pin)`.
    pub fn set_level(&self, pin: u32, level: u32) {
        self.state().levels.insert(pin, level);
    }

    /// Push an event as if the live client emitted it. Returns false when
    /// no client is open.
    pub fn emit(&self, event: DeviceEvent) -> bool {
        match &self.state().live {
            Some((_, sink)) => sink.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the live connection as a cable pull would.
    pub fn unplug(&self) -> bool {
        let live = self.state().live.take();
        match live {
            Some((_, sink)) => sink.send(DeviceEvent::Disconnected).is_ok(),
            None => false,
        }
    }

    pub fn ops(&self) -> Vec<MockOp> {
        self.state().ops.clone()
    }

    pub fn take_ops(&self) -> Vec<MockOp> {
        std::mem::take(&mut self.state().ops)
    }

    pub fn opens(&self) -> u32 {
        self.state().opens
    }

    pub fn closes(&self) -> u32 {
        self.state().closes
    }

    /// Clients opened and not yet closed.
    pub fn live_clients(&self) -> u32 {
        let st = self.state();
        st.opens - st.closes
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        events: EventSink,
    ) -> Result<Arc<dyn DeviceClient>> {
        let mut st = self.state();
        let outcome = st.script.pop_front().unwrap_or(MockOpen::Ready);
        if let MockOpen::Fail(err) = outcome {
            return Err(err);
        }
        st.next_id += 1;
        st.opens += 1;
        let id = st.next_id;
        if matches!(outcome, MockOpen::Ready) {
            let _ = events.send(DeviceEvent::Ready);
        }
        st.live = Some((id, events));
        Ok(Arc::new(MockClient {
            id,
            endpoint: endpoint.clone(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Client half handed out by [`MockConnector`].
pub struct MockClient {
    id: u64,
    endpoint: Endpoint,
    state: Arc<Mutex<MockState>>,
    closed: AtomicBool,
}

impl MockClient {
    fn record(&self, op: MockOp) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let name = op.name();
        st.ops.push(op);
        if let Some(pos) = st.failures.iter().position(|(n, _)| *n == name) {
            let (_, err) = st.failures.remove(pos);
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceClient for MockClient {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn set_mode(&self, pin: u32, mode: PinMode) -> Result<()> {
        self.record(MockOp::SetMode(pin, mode))
    }

    async fn set_pull(&self, pin: u32, pull: Pull) -> Result<()> {
        self.record(MockOp::SetPull(pin, pull))
    }

    async fn set_glitch_filter(&self, pin: u32, micros: u32) -> Result<()> {
        self.record(MockOp::GlitchFilter(pin, micros))
    }

    async fn set_pwm_frequency(&self, pin: u32, hz: u32) -> Result<u32> {
        self.record(MockOp::PwmFrequency(pin, hz))?;
        Ok(hz)
    }

    async fn read(&self, pin: u32) -> Result<u32> {
        self.record(MockOp::Read(pin))?;
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(st.levels.get(&pin).copied().unwrap_or(0))
    }

    async fn subscribe(&self, pin: u32, kind: ReportKind) -> Result<()> {
        self.record(MockOp::Subscribe(pin, kind))
    }

    async fn unsubscribe(&self, pin: u32) -> Result<()> {
        self.record(MockOp::Unsubscribe(pin))
    }

    async fn write(&self, pin: u32, high: bool) -> Result<()> {
        self.record(MockOp::Write(pin, high))
    }

    async fn write_pwm(&self, pin: u32, duty: u8) -> Result<()> {
        self.record(MockOp::Pwm(pin, duty))
    }

    async fn write_servo(&self, pin: u32, pulse_us: u32) -> Result<()> {
        self.record(MockOp::Servo(pin, pulse_us))
    }

    async fn send_raw(&self, cmd: RawCommand) -> Result<()> {
        self.record(MockOp::Raw(cmd))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.ops.push(MockOp::Close);
        st.closes += 1;
        if matches!(st.live, Some((id, _)) if id == self.id) {
            st.live = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn scripted_failure_then_ready() {
        let mock = MockConnector::new();
        mock.push_open(MockOpen::Fail(TransportError::NotFound("/dev/x".into())));
        let ep = Endpoint::serial("/dev/x");

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(mock.connect(&ep, tx).await.is_err());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = mock.connect(&ep, tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(DeviceEvent::Ready));
        assert_eq!(mock.live_clients(), 1);

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(mock.closes(), 1);
        assert_eq!(mock.live_clients(), 0);
    }

    #[tokio::test]
    async fn injected_failure_is_one_shot() {
        let mock = MockConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = mock.connect(&Endpoint::serial("m"), tx).await.unwrap();

        mock.fail_next("write", TransportError::Io("boom".into()));
        assert!(client.write(3, true).await.is_err());
        assert!(client.write(3, true).await.is_ok());
        assert_eq!(
            mock.ops(),
            vec![MockOp::Write(3, true), MockOp::Write(3, true)]
        );
    }

    #[tokio::test]
    async fn operations_after_close_fail() {
        let mock = MockConnector::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = mock.connect(&Endpoint::serial("m"), tx).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.write(1, false).await, Err(TransportError::Closed));
        assert!(!mock.emit(DeviceEvent::Ready));
    }
}
