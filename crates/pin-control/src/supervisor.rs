//! Self-healing connection to one device.
//!
//! [`LinkMachine`] holds the connection state and decides what to do for
//! each input; it never touches a client or a clock. [`ConnectionSupervisor`]
//! owns a task that feeds it client events, timer expiries and open results,
//! performs the [`LinkAction`]s it returns, and publishes readiness on a
//! `watch` channel for the pin sessions riding on the device.

use crate::config::{DeviceConfig, Timing};
use crate::error::{ControlError, Result};
use crate::metrics::MetricsHub;
use crate::status::{NodeStatus, Reporter, SignalSink};
use device_link::{Connector, DeviceClient, DeviceEvent, Endpoint, TransportError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready,
    TearingDown,
}

/// Inputs to [`LinkMachine::step`].
#[derive(Clone, Debug, PartialEq)]
pub enum LinkEvent {
    Connect,
    Opened { attempt: u64 },
    OpenFailed { attempt: u64, error: TransportError },
    Ready,
    Disconnected,
    Closed,
    Failed(String),
    RetryElapsed,
    WatchdogElapsed,
    Teardown,
}

/// Side effects requested by [`LinkMachine::step`], in execution order.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkAction {
    /// Start opening a client, tagged with the attempt it belongs to.
    Open { attempt: u64 },
    /// Keep the client that just opened as the live one.
    Adopt,
    /// Close a client whose attempt is no longer current.
    Discard,
    /// Close the live client.
    Release,
    ArmRetry(Duration),
    CancelRetry,
    ArmWatchdog(Duration),
    CancelWatchdog,
    Status(NodeStatus),
    /// Surface an error to the host.
    Report(String),
}

#[derive(Clone, Debug)]
pub struct LinkMachine {
    state: LinkState,
    attempt: u64,
    client_live: bool,
    in_error: bool,
    timing: Timing,
    endpoint: Endpoint,
}

impl LinkMachine {
    pub fn new(endpoint: Endpoint, timing: Timing) -> Self {
        Self {
            state: LinkState::Disconnected,
            attempt: 0,
            client_live: false,
            in_error: false,
            timing,
            endpoint,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Whether an error has been reported since the last ready.
    pub fn in_error(&self) -> bool {
        self.in_error
    }

    pub fn step(&mut self, event: LinkEvent) -> Vec<LinkAction> {
        let mut out = Vec::new();
        match event {
            LinkEvent::Connect | LinkEvent::RetryElapsed => self.connect(&mut out),
            LinkEvent::WatchdogElapsed => {
                if self.state == LinkState::Connecting {
                    if self.client_live {
                        self.client_live = false;
                        out.push(LinkAction::Release);
                    }
                    self.state = LinkState::Disconnected;
                    self.connect(&mut out);
                }
            }
            LinkEvent::Opened { attempt } => {
                if self.is_current(attempt) && !self.client_live {
                    self.client_live = true;
                    out.push(LinkAction::Adopt);
                } else {
                    out.push(LinkAction::Discard);
                }
            }
            LinkEvent::OpenFailed { attempt, error } => {
                if self.is_current(attempt) && !self.client_live {
                    self.state = LinkState::Disconnected;
                    out.push(LinkAction::CancelWatchdog);
                    self.report(error.to_string(), error.is_benign(), &mut out);
                    out.push(LinkAction::ArmRetry(self.timing.retry));
                }
            }
            LinkEvent::Ready => {
                if self.state == LinkState::Connecting && self.client_live {
                    self.state = LinkState::Ready;
                    self.in_error = false;
                    out.push(LinkAction::CancelWatchdog);
                    out.push(LinkAction::Status(NodeStatus::connected()));
                }
            }
            LinkEvent::Disconnected => {
                if self.state == LinkState::Ready {
                    self.lose("disconnected".to_string(), &mut out);
                }
            }
            LinkEvent::Closed => {
                if self.holds_client() {
                    self.lose("port closed".to_string(), &mut out);
                }
            }
            LinkEvent::Failed(msg) => {
                if self.holds_client() {
                    self.lose(msg, &mut out);
                }
            }
            LinkEvent::Teardown => {
                if self.state != LinkState::TearingDown {
                    self.state = LinkState::TearingDown;
                    // Results of an open still in flight no longer match.
                    self.attempt += 1;
                    out.push(LinkAction::CancelRetry);
                    out.push(LinkAction::CancelWatchdog);
                    if self.client_live {
                        self.client_live = false;
                        out.push(LinkAction::Release);
                    }
                    out.push(LinkAction::Status(NodeStatus::closed()));
                }
            }
        }
        out
    }

    fn is_current(&self, attempt: u64) -> bool {
        attempt == self.attempt && self.state == LinkState::Connecting
    }

    fn holds_client(&self) -> bool {
        self.state == LinkState::Ready || (self.state == LinkState::Connecting && self.client_live)
    }

    fn connect(&mut self, out: &mut Vec<LinkAction>) {
        if self.state != LinkState::Disconnected {
            return;
        }
        self.attempt += 1;
        self.state = LinkState::Connecting;
        out.push(LinkAction::CancelRetry);
        if !self.in_error {
            out.push(LinkAction::Status(NodeStatus::connecting()));
        }
        out.push(LinkAction::Open {
            attempt: self.attempt,
        });
        out.push(LinkAction::ArmWatchdog(self.timing.watchdog));
    }

    fn lose(&mut self, msg: String, out: &mut Vec<LinkAction>) {
        self.state = LinkState::Disconnected;
        out.push(LinkAction::CancelWatchdog);
        if self.client_live {
            self.client_live = false;
            out.push(LinkAction::Release);
        }
        self.report(msg, true, out);
        out.push(LinkAction::ArmRetry(self.timing.retry));
    }

    /// Latched reports go out once per outage; the rest every time.
    fn report(&mut self, msg: String, latched: bool, out: &mut Vec<LinkAction>) {
        let text = self.describe(msg);
        out.push(LinkAction::Status(NodeStatus::error(text.clone())));
        if !latched || !self.in_error {
            out.push(LinkAction::Report(text));
        }
        self.in_error = true;
    }

    fn describe(&self, msg: String) -> String {
        if !self.endpoint.is_networked() || msg.starts_with("Unhandled socket error") {
            return msg;
        }
        let addr = self.endpoint.to_string();
        if msg.contains(&addr) {
            msg
        } else {
            format!("{msg} {addr}")
        }
    }
}

/// What a session sees of its device: the current state and, while ready,
/// the live client. `epoch` increases each time the device becomes ready.
#[derive(Clone)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub epoch: u64,
    pub client: Option<Arc<dyn DeviceClient>>,
}

impl LinkSnapshot {
    fn initial() -> Self {
        Self {
            state: LinkState::Disconnected,
            epoch: 0,
            client: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready && self.client.is_some()
    }
}

impl fmt::Debug for LinkSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkSnapshot")
            .field("state", &self.state)
            .field("epoch", &self.epoch)
            .field("client", &self.client.is_some())
            .finish()
    }
}

/// Non-owning view of a supervisor, handed to pin sessions.
#[derive(Clone)]
pub struct SupervisorLink {
    device: String,
    readiness: watch::Receiver<LinkSnapshot>,
    events: broadcast::Sender<DeviceEvent>,
}

impl SupervisorLink {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn snapshot(&self) -> LinkSnapshot {
        self.readiness.borrow().clone()
    }

    pub fn readiness(&self) -> watch::Receiver<LinkSnapshot> {
        self.readiness.clone()
    }

    /// Data events (levels, analog values, text) from the live client.
    pub fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

enum Command {
    Connect,
    Teardown(oneshot::Sender<()>),
}

pub struct ConnectionSupervisor {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
    link: SupervisorLink,
    task: Option<JoinHandle<()>>,
}

impl ConnectionSupervisor {
    /// Start supervising `config.endpoint` and begin the first connection
    /// attempt. Must be called within a tokio runtime.
    pub fn spawn(
        config: DeviceConfig,
        connector: Arc<dyn Connector>,
        signals: SignalSink,
        metrics: MetricsHub,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = mpsc::unbounded_channel();
        let (readiness, readiness_rx) = watch::channel(LinkSnapshot::initial());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let link = SupervisorLink {
            device: config.id.clone(),
            readiness: readiness_rx,
            events: events.clone(),
        };
        let driver = Driver {
            id: config.id.clone(),
            machine: LinkMachine::new(config.endpoint.clone(), config.timing),
            endpoint: config.endpoint,
            connector,
            reporter: Reporter::new(config.id.clone(), signals),
            metrics,
            commands: command_rx,
            opened_tx,
            opened_rx,
            pending: None,
            client: None,
            device_events: None,
            retry_at: None,
            watchdog_at: None,
            readiness,
            events,
            epoch: 0,
            ever_ready: false,
        };
        let task = tokio::spawn(driver.run());
        let _ = commands.send(Command::Connect);
        Self {
            id: config.id,
            commands,
            link,
            task: Some(task),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn link(&self) -> SupervisorLink {
        self.link.clone()
    }

    pub fn state(&self) -> LinkState {
        self.link.readiness.borrow().state
    }

    /// Ask for a connection attempt. Ignored while one is pending or the
    /// device is ready.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Cancel timers, close the live client and stop the task. Completes
    /// once the client is closed; later calls return immediately.
    pub async fn teardown(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Teardown(ack)).is_ok() {
            let _ = done.await;
        }
        task.await
            .map_err(|e| ControlError::Stopped(format!("{}: {e}", self.id)))
    }
}

struct Opened {
    attempt: u64,
    result: std::result::Result<Arc<dyn DeviceClient>, TransportError>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
}

struct Driver {
    id: String,
    machine: LinkMachine,
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    reporter: Reporter,
    metrics: MetricsHub,
    commands: mpsc::UnboundedReceiver<Command>,
    opened_tx: mpsc::UnboundedSender<Opened>,
    opened_rx: mpsc::UnboundedReceiver<Opened>,
    pending: Option<(Arc<dyn DeviceClient>, mpsc::UnboundedReceiver<DeviceEvent>)>,
    client: Option<Arc<dyn DeviceClient>>,
    device_events: Option<mpsc::UnboundedReceiver<DeviceEvent>>,
    retry_at: Option<Instant>,
    watchdog_at: Option<Instant>,
    readiness: watch::Sender<LinkSnapshot>,
    events: broadcast::Sender<DeviceEvent>,
    epoch: u64,
    ever_ready: bool,
}

pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_event(
    rx: &mut Option<mpsc::UnboundedReceiver<DeviceEvent>>,
) -> Option<DeviceEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        info!(device = %self.id, endpoint = %self.endpoint, "supervisor started");
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Connect) => self.apply(LinkEvent::Connect).await,
                    Some(Command::Teardown(ack)) => {
                        self.apply(LinkEvent::Teardown).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.apply(LinkEvent::Teardown).await;
                        break;
                    }
                },
                Some(opened) = self.opened_rx.recv() => self.on_opened(opened).await,
                ev = next_event(&mut self.device_events) => match ev {
                    Some(ev) => self.on_device_event(ev).await,
                    None => {
                        self.device_events = None;
                        self.apply(LinkEvent::Disconnected).await;
                    }
                },
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.apply(LinkEvent::RetryElapsed).await;
                }
                _ = sleep_until(self.watchdog_at) => {
                    self.watchdog_at = None;
                    debug!(device = %self.id, attempt = self.machine.attempt(), "watchdog expired");
                    self.apply(LinkEvent::WatchdogElapsed).await;
                }
            }
        }
        info!(device = %self.id, "supervisor stopped");
    }

    async fn on_opened(&mut self, opened: Opened) {
        let Opened {
            attempt,
            result,
            events,
        } = opened;
        match result {
            Ok(client) => {
                self.pending = Some((client, events));
                self.apply(LinkEvent::Opened { attempt }).await;
            }
            Err(error) => {
                debug!(device = %self.id, attempt, %error, "open failed");
                self.apply(LinkEvent::OpenFailed { attempt, error }).await;
            }
        }
    }

    async fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Ready => self.apply(LinkEvent::Ready).await,
            DeviceEvent::Disconnected => self.apply(LinkEvent::Disconnected).await,
            DeviceEvent::Closed => self.apply(LinkEvent::Closed).await,
            DeviceEvent::Error(msg) => self.apply(LinkEvent::Failed(msg)).await,
            data => {
                if self.machine.state() == LinkState::Ready {
                    let _ = self.events.send(data);
                }
            }
        }
    }

    async fn apply(&mut self, event: LinkEvent) {
        for action in self.machine.step(event) {
            self.perform(action).await;
        }
        self.publish();
    }

    async fn perform(&mut self, action: LinkAction) {
        match action {
            LinkAction::Open { attempt } => {
                self.metrics.link.connect_attempts.inc();
                if attempt > 1 {
                    debug!(device = %self.id, attempt, "Retrying to connect");
                }
                self.spawn_open(attempt);
            }
            LinkAction::Adopt => {
                if let Some((client, events)) = self.pending.take() {
                    self.client = Some(client);
                    self.device_events = Some(events);
                }
            }
            LinkAction::Discard => {
                if let Some((client, _)) = self.pending.take() {
                    debug!(device = %self.id, "closing client from a stale attempt");
                    tokio::spawn(close_quietly(client));
                }
            }
            LinkAction::Release => {
                self.device_events = None;
                if let Some(client) = self.client.take() {
                    if self.machine.state() == LinkState::TearingDown {
                        if let Err(e) = client.close().await {
                            warn!(device = %self.id, error = %e, "close failed");
                        }
                    } else {
                        tokio::spawn(close_quietly(client));
                    }
                }
            }
            LinkAction::ArmRetry(after) => self.retry_at = Some(Instant::now() + after),
            LinkAction::CancelRetry => self.retry_at = None,
            LinkAction::ArmWatchdog(after) => self.watchdog_at = Some(Instant::now() + after),
            LinkAction::CancelWatchdog => self.watchdog_at = None,
            LinkAction::Status(status) => self.reporter.status(status),
            LinkAction::Report(msg) => {
                error!(device = %self.id, "{msg}");
                self.reporter.error(msg);
            }
        }
    }

    fn spawn_open(&self, attempt: u64) {
        let connector = self.connector.clone();
        let endpoint = self.endpoint.clone();
        let opened = self.opened_tx.clone();
        tokio::spawn(async move {
            let (sink, events) = mpsc::unbounded_channel();
            let result = connector.connect(&endpoint, sink).await;
            if let Err(mpsc::error::SendError(lost)) = opened.send(Opened {
                attempt,
                result,
                events,
            }) {
                // Supervisor is gone; nobody else will close this client.
                if let Ok(client) = lost.result {
                    close_quietly(client).await;
                }
            }
        });
    }

    fn publish(&mut self) {
        let state = self.machine.state();
        let previous = self.readiness.borrow().state;
        if state == previous {
            return;
        }
        if state == LinkState::Ready {
            self.epoch += 1;
            self.metrics.link.devices_ready.inc();
            if self.ever_ready {
                self.metrics.link.reconnects.inc();
            }
            self.ever_ready = true;
            info!(device = %self.id, endpoint = %self.endpoint, epoch = self.epoch, "device ready");
        } else if previous == LinkState::Ready {
            self.metrics.link.devices_ready.dec();
            info!(device = %self.id, "device no longer ready");
        }
        let client = if state == LinkState::Ready {
            self.client.clone()
        } else {
            None
        };
        self.readiness.send_replace(LinkSnapshot {
            state,
            epoch: self.epoch,
            client,
        });
    }
}

async fn close_quietly(client: Arc<dyn DeviceClient>) {
    if let Err(e) = client.close().await {
        debug!(endpoint = %client.endpoint(), error = %e, "close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> LinkMachine {
        LinkMachine::new(
            Endpoint::serial("/dev/ttyACM0"),
            Timing::for_transport(device_link::TransportKind::Serial),
        )
    }

    fn reports(actions: &[LinkAction]) -> usize {
        actions
            .iter()
            .filter(|a| matches!(a, LinkAction::Report(_)))
            .count()
    }

    fn not_found() -> TransportError {
        TransportError::NotFound("/dev/ttyACM0".into())
    }

    #[test]
    fn connect_opens_and_arms_watchdog() {
        let mut m = machine();
        let out = m.step(LinkEvent::Connect);
        assert_eq!(m.state(), LinkState::Connecting);
        assert!(out.contains(&LinkAction::Open { attempt: 1 }));
        assert!(out.contains(&LinkAction::ArmWatchdog(Duration::from_millis(5000))));
        // A second request while pending does nothing.
        assert!(m.step(LinkEvent::Connect).is_empty());
    }

    #[test]
    fn benign_failures_reported_once_per_outage() {
        let mut m = machine();
        let mut total = 0;
        for attempt in 1..=3 {
            m.step(if attempt == 1 {
                LinkEvent::Connect
            } else {
                LinkEvent::RetryElapsed
            });
            let out = m.step(LinkEvent::OpenFailed {
                attempt,
                error: not_found(),
            });
            assert!(out.contains(&LinkAction::ArmRetry(Duration::from_millis(5000))));
            total += reports(&out);
        }
        assert_eq!(total, 1);
        assert!(m.in_error());

        m.step(LinkEvent::RetryElapsed);
        m.step(LinkEvent::Opened { attempt: 4 });
        m.step(LinkEvent::Ready);
        assert_eq!(m.state(), LinkState::Ready);
        assert!(!m.in_error());

        let out = m.step(LinkEvent::Disconnected);
        assert_eq!(reports(&out), 1);
        assert!(out.contains(&LinkAction::Release));
        m.step(LinkEvent::RetryElapsed);
        let out = m.step(LinkEvent::OpenFailed {
            attempt: 5,
            error: not_found(),
        });
        assert_eq!(reports(&out), 0);
    }

    #[test]
    fn unexpected_failures_reported_every_attempt() {
        let mut m = machine();
        m.step(LinkEvent::Connect);
        let err = TransportError::Io("permission denied".into());
        let out = m.step(LinkEvent::OpenFailed {
            attempt: 1,
            error: err.clone(),
        });
        assert_eq!(reports(&out), 1);
        m.step(LinkEvent::RetryElapsed);
        let out = m.step(LinkEvent::OpenFailed {
            attempt: 2,
            error: err,
        });
        assert_eq!(reports(&out), 1);
    }

    #[test]
    fn stale_open_is_discarded() {
        let mut m = machine();
        m.step(LinkEvent::Connect);
        let out = m.step(LinkEvent::WatchdogElapsed);
        assert!(out.contains(&LinkAction::Open { attempt: 2 }));
        assert_eq!(m.step(LinkEvent::Opened { attempt: 1 }), vec![LinkAction::Discard]);
        assert_eq!(m.step(LinkEvent::Opened { attempt: 2 }), vec![LinkAction::Adopt]);
        // A late failure from the abandoned attempt changes nothing.
        assert!(m
            .step(LinkEvent::OpenFailed {
                attempt: 1,
                error: not_found()
            })
            .is_empty());
    }

    #[test]
    fn watchdog_releases_silent_client() {
        let mut m = machine();
        m.step(LinkEvent::Connect);
        m.step(LinkEvent::Opened { attempt: 1 });
        // Disconnect while still connecting is left to the watchdog.
        assert!(m.step(LinkEvent::Disconnected).is_empty());
        let out = m.step(LinkEvent::WatchdogElapsed);
        assert_eq!(out.first(), Some(&LinkAction::Release));
        assert!(out.contains(&LinkAction::Open { attempt: 2 }));
        assert_eq!(m.state(), LinkState::Connecting);
    }

    #[test]
    fn closed_port_is_reported() {
        let mut m = machine();
        m.step(LinkEvent::Connect);
        m.step(LinkEvent::Opened { attempt: 1 });
        m.step(LinkEvent::Ready);
        let out = m.step(LinkEvent::Closed);
        assert!(out.contains(&LinkAction::Report("port closed".into())));
        assert_eq!(m.state(), LinkState::Disconnected);
    }

    #[test]
    fn teardown_is_idempotent() {
        let mut m = machine();
        m.step(LinkEvent::Connect);
        m.step(LinkEvent::Opened { attempt: 1 });
        m.step(LinkEvent::Ready);
        let out = m.step(LinkEvent::Teardown);
        assert!(out.contains(&LinkAction::Release));
        assert!(out.contains(&LinkAction::CancelRetry));
        assert_eq!(m.state(), LinkState::TearingDown);
        assert!(m.step(LinkEvent::Teardown).is_empty());
        assert!(m.step(LinkEvent::RetryElapsed).is_empty());
        assert_eq!(m.step(LinkEvent::Opened { attempt: 1 }), vec![LinkAction::Discard]);
    }

    #[test]
    fn networked_errors_name_the_daemon() {
        let mut m = LinkMachine::new(
            Endpoint::gpio_daemon("10.0.0.7", 8888),
            Timing::for_transport(device_link::TransportKind::GpioDaemon),
        );
        m.step(LinkEvent::Connect);
        let out = m.step(LinkEvent::OpenFailed {
            attempt: 1,
            error: TransportError::Io("boom".into()),
        });
        assert!(out.contains(&LinkAction::Report("I/O error: boom 10.0.0.7:8888".into())));
        m.step(LinkEvent::RetryElapsed);
        m.step(LinkEvent::Opened { attempt: 2 });
        m.step(LinkEvent::Ready);
        let out = m.step(LinkEvent::Failed("Unhandled socket error: reset".into()));
        assert!(out.contains(&LinkAction::Report("Unhandled socket error: reset".into())));
    }
}
