//! One logical pin riding on a supervised device.
//!
//! A session waits for its device to become ready, configures the pin, and
//! then either forwards input changes to the host or applies host values to
//! the pin. When the device drops it marks itself unconfigured at once and
//! configures again after the reconfigure delay.

use crate::config::{LogicalMode, PinConfig, Timing};
use crate::error::{ControlError, InvalidPayload, Result};
use crate::metrics::MetricsHub;
use crate::status::{NodeStatus, OutboundEvent, Reporter, SignalSink};
use crate::supervisor::{sleep_until, LinkSnapshot, LinkState, SupervisorLink};
use crate::transform;
use device_link::{
    DeviceClient, DeviceEvent, PinMode, Pull, RawCommand, ReportKind, TransportError,
    TransportKind,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Host-visible progress of a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PinSessionState {
    /// Last value forwarded to the host, for change suppression.
    pub last_emitted: Option<Value>,
    pub configured: bool,
    pub running: bool,
}

enum SessionCommand {
    Input(Value),
    Stop(oneshot::Sender<()>),
}

pub struct PinSession {
    id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<PinSessionState>,
    task: Option<JoinHandle<()>>,
}

impl PinSession {
    pub fn spawn(
        config: PinConfig,
        link: SupervisorLink,
        timing: Timing,
        signals: SignalSink,
        metrics: MetricsHub,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(PinSessionState {
            running: true,
            ..Default::default()
        });
        let events = config.mode.is_input().then(|| link.events());
        let worker = Worker {
            topic: config.topic(),
            reporter: Reporter::new(config.id.clone(), signals),
            readiness: link.readiness(),
            link_alive: true,
            events,
            commands: command_rx,
            config: config.clone(),
            timing,
            metrics,
            state: state_tx,
            client: None,
            epoch: None,
            pending: None,
            reconfigure_at: None,
            initial_read_at: None,
        };
        let task = tokio::spawn(worker.run());
        Self {
            id: config.id,
            commands,
            state,
            task: Some(task),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PinSessionState {
        self.state.borrow().clone()
    }

    /// Watch configuration and emission progress.
    pub fn watch_state(&self) -> watch::Receiver<PinSessionState> {
        self.state.clone()
    }

    /// Queue an inbound application value. Values are applied in order.
    pub fn send(&self, payload: Value) -> Result<()> {
        self.commands
            .send(SessionCommand::Input(payload))
            .map_err(|_| ControlError::Stopped(self.id.clone()))
    }

    /// Stop the session, unsubscribing inputs on a live device. Later
    /// calls return immediately.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let (ack, done) = oneshot::channel();
        if self.commands.send(SessionCommand::Stop(ack)).is_ok() {
            let _ = done.await;
        }
        task.await
            .map_err(|e| ControlError::Stopped(format!("{}: {e}", self.id)))
    }
}

/// A validated host value, ready for the device.
#[derive(Debug, Clone, PartialEq)]
enum Output {
    Level(bool),
    Duty(u8),
    Pulse(u32),
    Text(String),
    Sysex(Vec<u8>),
}

fn parse_output(
    config: &PinConfig,
    payload: &Value,
) -> std::result::Result<Output, InvalidPayload> {
    Ok(match config.mode {
        LogicalMode::DigitalOut => Output::Level(transform::digital_level(payload)?),
        LogicalMode::PwmOut => Output::Duty(transform::pwm_duty(payload)?),
        LogicalMode::ServoOut => Output::Pulse(config.servo.pulse_width(payload)?),
        LogicalMode::StringOut => Output::Text(transform::text(payload)),
        LogicalMode::SysexOut => Output::Sysex(transform::sysex_body(payload)?),
        _ => return Err(InvalidPayload::new(payload)),
    })
}

/// Inputs backed by a pin subscription.
fn reads_pin(mode: LogicalMode) -> bool {
    matches!(
        mode,
        LogicalMode::DigitalIn | LogicalMode::DigitalInPullup | LogicalMode::AnalogIn
    )
}

async fn recv_event(rx: &mut Option<broadcast::Receiver<DeviceEvent>>) -> Option<DeviceEvent> {
    let Some(inner) = rx else {
        return std::future::pending().await;
    };
    loop {
        match inner.recv().await {
            Ok(ev) => return Some(ev),
            Err(RecvError::Lagged(n)) => warn!(skipped = n, "input events dropped"),
            Err(RecvError::Closed) => return None,
        }
    }
}

type SetupResult = std::result::Result<NodeStatus, TransportError>;

/// Mode, then pull and debounce, then frequency, then initial level.
async fn setup(cfg: PinConfig, client: Arc<dyn DeviceClient>) -> SetupResult {
    let pin = cfg.pin;
    let gpio = cfg.transport == TransportKind::GpioDaemon;
    match cfg.mode {
        LogicalMode::DigitalIn | LogicalMode::DigitalInPullup => {
            if gpio {
                client.set_mode(pin, PinMode::Input).await?;
                debug!(pin = %cfg.id, "mode set");
                client.set_pull(pin, cfg.pull).await?;
                debug!(pin = %cfg.id, pull = ?cfg.pull, "pull set");
                client.set_glitch_filter(pin, cfg.debounce_us).await?;
                debug!(pin = %cfg.id, micros = cfg.debounce_us, "glitch filter set");
            } else {
                let mode = if cfg.pull == Pull::Up {
                    PinMode::InputPullUp
                } else {
                    PinMode::Input
                };
                client.set_mode(pin, mode).await?;
            }
            client.subscribe(pin, ReportKind::Digital).await?;
        }
        LogicalMode::AnalogIn => {
            client.set_mode(pin, PinMode::Analog).await?;
            client.subscribe(pin, ReportKind::Analog).await?;
        }
        LogicalMode::DigitalOut => {
            client.set_mode(pin, PinMode::Output).await?;
            if let Some(level) = cfg.initial_level {
                client.write(pin, level).await?;
                debug!(pin = %cfg.id, level, "initial level written");
                return Ok(NodeStatus::value(u8::from(level).to_string()));
            }
        }
        LogicalMode::PwmOut => {
            client.set_mode(pin, PinMode::Pwm).await?;
            if gpio {
                let hz = client.set_pwm_frequency(pin, cfg.frequency_hz).await?;
                debug!(
                    pin = %cfg.id,
                    requested = cfg.frequency_hz,
                    selected = hz,
                    "pwm frequency set"
                );
            }
        }
        LogicalMode::ServoOut => client.set_mode(pin, PinMode::Servo).await?,
        LogicalMode::StringIn | LogicalMode::StringOut | LogicalMode::SysexOut => {}
    }
    Ok(NodeStatus::ok())
}

/// Pin setup running against one ready epoch.
struct PendingSetup {
    epoch: u64,
    client: Arc<dyn DeviceClient>,
    task: JoinHandle<SetupResult>,
}

/// Resolves when the in-flight setup finishes; never while none is running.
async fn finish_setup(
    pending: &mut Option<PendingSetup>,
) -> (u64, Arc<dyn DeviceClient>, SetupResult) {
    let Some(setup) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let result = (&mut setup.task)
        .await
        .unwrap_or_else(|e| Err(TransportError::Io(format!("pin setup task: {e}"))));
    let done = (setup.epoch, setup.client.clone(), result);
    *pending = None;
    done
}

struct Worker {
    config: PinConfig,
    topic: String,
    timing: Timing,
    reporter: Reporter,
    metrics: MetricsHub,
    readiness: watch::Receiver<LinkSnapshot>,
    link_alive: bool,
    events: Option<broadcast::Receiver<DeviceEvent>>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<PinSessionState>,
    client: Option<Arc<dyn DeviceClient>>,
    epoch: Option<u64>,
    pending: Option<PendingSetup>,
    reconfigure_at: Option<Instant>,
    initial_read_at: Option<Instant>,
}

impl Worker {
    async fn run(mut self) {
        debug!(pin = %self.config.id, device = %self.config.device, "session started");
        self.reporter.status(NodeStatus::connecting());
        let snapshot = self.readiness.borrow_and_update().clone();
        self.on_link(snapshot);
        loop {
            tokio::select! {
                changed = self.readiness.changed(), if self.link_alive => {
                    if changed.is_err() {
                        // Supervisor is gone for good.
                        self.link_alive = false;
                        self.on_disconnect(false);
                        continue;
                    }
                    let snapshot = self.readiness.borrow_and_update().clone();
                    self.on_link(snapshot);
                }
                (epoch, client, result) = finish_setup(&mut self.pending) => {
                    self.on_setup(epoch, client, result);
                }
                ev = recv_event(&mut self.events) => match ev {
                    Some(ev) => self.on_device_event(ev),
                    None => self.events = None,
                },
                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Input(payload)) => self.on_input(payload).await,
                    Some(SessionCommand::Stop(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = sleep_until(self.reconfigure_at) => {
                    self.reconfigure_at = None;
                    let snapshot = self.readiness.borrow().clone();
                    if snapshot.is_ready() && !self.configured() && self.pending.is_none() {
                        self.configure(&snapshot);
                    }
                }
                _ = sleep_until(self.initial_read_at) => {
                    self.initial_read_at = None;
                    self.initial_read().await;
                }
            }
        }
        debug!(pin = %self.config.id, "session stopped");
    }

    fn configured(&self) -> bool {
        self.state.borrow().configured
    }

    /// Live client while configured against the current ready epoch.
    fn ready_client(&self) -> Option<Arc<dyn DeviceClient>> {
        if !self.configured() {
            return None;
        }
        let current = self.readiness.borrow();
        if current.is_ready() && Some(current.epoch) == self.epoch {
            self.client.clone()
        } else {
            None
        }
    }

    fn on_link(&mut self, snapshot: LinkSnapshot) {
        if snapshot.is_ready() {
            let seen = Some(snapshot.epoch) == self.epoch
                || self.pending.as_ref().map(|p| p.epoch) == Some(snapshot.epoch);
            if !seen {
                if self.configured() {
                    self.on_disconnect(false);
                }
                self.configure(&snapshot);
            }
        } else if self.epoch.is_some() || self.configured() || self.pending.is_some() {
            let retry = snapshot.state != LinkState::TearingDown;
            self.on_disconnect(retry);
        }
    }

    /// Drop everything tied to the old client. Synchronous so that no write
    /// can slip through between the device dropping and the flag clearing.
    fn on_disconnect(&mut self, reconfigure: bool) {
        let was_configured = self.configured();
        self.state.send_modify(|st| st.configured = false);
        self.client = None;
        self.epoch = None;
        self.abort_setup();
        self.initial_read_at = None;
        self.reporter.status(NodeStatus::not_connected());
        if was_configured && reconfigure {
            info!(pin = %self.config.id, "device lost, reconfiguring later");
            self.reconfigure_at = Some(Instant::now() + self.timing.reconfigure);
        }
    }

    /// Start pin setup in its own task. The command loop keeps running, so
    /// values arriving meanwhile see an unconfigured pin and are dropped.
    fn configure(&mut self, snapshot: &LinkSnapshot) {
        let Some(client) = snapshot.client.clone() else {
            return;
        };
        self.abort_setup();
        debug!(pin = %self.config.id, epoch = snapshot.epoch, "configuring");
        let task = tokio::spawn(setup(self.config.clone(), client.clone()));
        self.pending = Some(PendingSetup {
            epoch: snapshot.epoch,
            client,
            task,
        });
    }

    fn abort_setup(&mut self) {
        if let Some(stale) = self.pending.take() {
            stale.task.abort();
        }
    }

    fn on_setup(&mut self, epoch: u64, client: Arc<dyn DeviceClient>, result: SetupResult) {
        let still_current = {
            let current = self.readiness.borrow();
            current.is_ready() && current.epoch == epoch
        };
        if !still_current {
            debug!(pin = %self.config.id, epoch, "device changed during configure");
            return;
        }
        match result {
            Ok(status) => {
                self.client = Some(client);
                self.epoch = Some(epoch);
                self.state.send_modify(|st| {
                    st.configured = true;
                    st.last_emitted = None;
                });
                self.reporter.status(status);
                if self.config.read_initial && reads_pin(self.config.mode) {
                    self.initial_read_at = Some(Instant::now() + self.timing.initial_read);
                }
                info!(
                    pin = %self.config.id,
                    pin_no = self.config.pin,
                    mode = ?self.config.mode,
                    "pin configured"
                );
            }
            Err(e) => {
                // Stays unconfigured until the device comes back.
                self.epoch = Some(epoch);
                error!(pin = %self.config.id, error = %e, "configure failed");
                self.reporter.error(format!("configure failed: {e}"));
                self.reporter.status(NodeStatus::error("configure failed"));
            }
        }
    }

    async fn initial_read(&mut self) {
        let Some(client) = self.ready_client() else {
            return;
        };
        match client.read(self.config.pin).await {
            Ok(value) => self.emit(Value::from(value)),
            Err(e) => {
                warn!(pin = %self.config.id, error = %e, "initial read failed");
                self.reporter.status(NodeStatus::error("initial read failed"));
            }
        }
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        if !self.configured() {
            return;
        }
        let pin = self.config.pin;
        let value = match (self.config.mode, event) {
            (
                LogicalMode::DigitalIn | LogicalMode::DigitalInPullup,
                DeviceEvent::Level { pin: p, level },
            ) if p == pin => Value::from(level),
            (LogicalMode::AnalogIn, DeviceEvent::Analog { pin: p, value }) if p == pin => {
                Value::from(value)
            }
            (LogicalMode::StringIn, DeviceEvent::Text(text)) => Value::from(text),
            _ => return,
        };
        self.emit(value);
    }

    /// Forward a value unless it repeats the last one.
    fn emit(&mut self, value: Value) {
        let mut changed = false;
        self.state.send_if_modified(|st| {
            changed = st.last_emitted.as_ref() != Some(&value);
            if changed {
                st.last_emitted = Some(value.clone());
            }
            changed
        });
        if !changed {
            return;
        }
        self.metrics.pins.events_emitted.inc();
        if matches!(
            self.config.mode,
            LogicalMode::DigitalIn | LogicalMode::DigitalInPullup
        ) {
            self.reporter.status(NodeStatus::value(transform::text(&value)));
        }
        self.reporter.event(OutboundEvent::now(self.topic.clone(), value));
    }

    async fn on_input(&mut self, payload: Value) {
        if self.config.mode.is_input() {
            debug!(pin = %self.config.id, "input pin ignores inbound values");
            return;
        }
        let label = transform::text(&payload);
        match self.apply(&payload).await {
            Ok(()) => {
                self.metrics.pins.writes.inc();
                self.reporter.status(NodeStatus::value(label));
            }
            Err(ControlError::NotConnected) => {
                self.metrics.pins.dropped_writes.inc();
                self.reporter.status(NodeStatus::unconfigured(label));
            }
            Err(e @ ControlError::InvalidPayload(_)) => {
                warn!(pin = %self.config.id, error = %e, "rejected value");
                self.metrics.pins.dropped_writes.inc();
                self.reporter.warn(e.to_string());
            }
            Err(e) => {
                warn!(pin = %self.config.id, error = %e, "write failed");
                self.reporter.warn(format!("write failed: {e}"));
            }
        }
    }

    /// Validate, then write if configured. Nothing is queued.
    async fn apply(&self, payload: &Value) -> Result<()> {
        let output = parse_output(&self.config, payload)?;
        let client = self.ready_client().ok_or(ControlError::NotConnected)?;
        self.write(client.as_ref(), output).await?;
        Ok(())
    }

    async fn write(
        &self,
        client: &dyn DeviceClient,
        output: Output,
    ) -> std::result::Result<(), TransportError> {
        let pin = self.config.pin;
        match output {
            Output::Level(high) => client.write(pin, high).await,
            Output::Duty(duty) => client.write_pwm(pin, duty).await,
            Output::Pulse(us) => client.write_servo(pin, us).await,
            Output::Text(text) => client.send_raw(RawCommand::Text(text)).await,
            Output::Sysex(body) => client.send_raw(RawCommand::Sysex(body)).await,
        }
    }

    async fn shutdown(&mut self) {
        if reads_pin(self.config.mode) {
            if let Some(client) = self.ready_client() {
                if let Err(e) = client.unsubscribe(self.config.pin).await {
                    debug!(pin = %self.config.id, error = %e, "unsubscribe failed");
                }
            }
        }
        self.client = None;
        self.abort_setup();
        self.reconfigure_at = None;
        self.initial_read_at = None;
        self.state.send_modify(|st| {
            st.configured = false;
            st.running = false;
        });
        self.reporter.status(NodeStatus::closed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::ServoRange;
    use serde_json::json;

    fn pin(mode: LogicalMode) -> PinConfig {
        PinConfig::new("p", "dev", TransportKind::Serial, 3, mode)
    }

    #[test]
    fn outputs_parsed_per_mode() {
        assert_eq!(
            parse_output(&pin(LogicalMode::DigitalOut), &json!("on")).unwrap(),
            Output::Level(true)
        );
        assert_eq!(
            parse_output(&pin(LogicalMode::PwmOut), &json!(50)).unwrap(),
            Output::Duty(128)
        );
        let mut servo = pin(LogicalMode::ServoOut);
        servo.servo = ServoRange::from_hundredths(Some(500.0), Some(2500.0));
        assert_eq!(parse_output(&servo, &json!(100)).unwrap(), Output::Pulse(2500));
        assert_eq!(
            parse_output(&pin(LogicalMode::StringOut), &json!(42)).unwrap(),
            Output::Text("42".into())
        );
        assert!(parse_output(&pin(LogicalMode::PwmOut), &json!(101)).is_err());
        assert!(parse_output(&pin(LogicalMode::DigitalIn), &json!(1)).is_err());
    }
}
