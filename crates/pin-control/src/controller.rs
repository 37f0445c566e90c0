//! Brings a whole topology up and down: one supervisor per device, one
//! session per pin.

use crate::config::{DeviceConfig, PinConfig, Topology};
use crate::error::{ControlError, Result};
use crate::metrics::MetricsHub;
use crate::session::PinSession;
use crate::status::{NodeStatus, Reporter, SignalSink};
use crate::supervisor::ConnectionSupervisor;
use device_link::{Connector, TransportKind};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Which connector opens devices of each transport kind.
#[derive(Clone, Default)]
pub struct ConnectorSet {
    serial: Option<Arc<dyn Connector>>,
    gpio_daemon: Option<Arc<dyn Connector>>,
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use one connector for every transport, as a mock run does.
    pub fn uniform(connector: Arc<dyn Connector>) -> Self {
        Self {
            serial: Some(connector.clone()),
            gpio_daemon: Some(connector),
        }
    }

    pub fn with(mut self, kind: TransportKind, connector: Arc<dyn Connector>) -> Self {
        match kind {
            TransportKind::Serial => self.serial = Some(connector),
            TransportKind::GpioDaemon => self.gpio_daemon = Some(connector),
        }
        self
    }

    pub fn get(&self, kind: TransportKind) -> Option<Arc<dyn Connector>> {
        match kind {
            TransportKind::Serial => self.serial.clone(),
            TransportKind::GpioDaemon => self.gpio_daemon.clone(),
        }
    }
}

pub struct Controller {
    supervisors: Vec<ConnectionSupervisor>,
    sessions: HashMap<String, PinSession>,
    order: Vec<String>,
}

impl Controller {
    /// Start every node the topology describes. A node that fails
    /// validation is skipped with a persistent warning; duplicate ids
    /// reject the whole topology.
    pub fn start(
        topology: &Topology,
        connectors: &ConnectorSet,
        signals: SignalSink,
        metrics: MetricsHub,
    ) -> Result<Self> {
        topology.check_ids()?;
        let mut supervisors = Vec::new();
        let mut devices = HashMap::new();
        for spec in &topology.devices {
            let reporter = Reporter::new(spec.id.clone(), signals.clone());
            let config = match DeviceConfig::from_spec(spec) {
                Ok(config) => config,
                Err(e) => {
                    reject(&reporter, &e);
                    continue;
                }
            };
            let kind = config.endpoint.kind();
            let Some(connector) = connectors.get(kind) else {
                let err = ControlError::Config(format!("{kind} support not built"));
                reject(&reporter, &err);
                continue;
            };
            let supervisor = ConnectionSupervisor::spawn(
                config.clone(),
                connector,
                signals.clone(),
                metrics.clone(),
            );
            devices.insert(spec.id.clone(), (kind, config.timing, supervisor.link()));
            supervisors.push(supervisor);
        }

        let mut sessions = HashMap::new();
        let mut order = Vec::new();
        for spec in &topology.pins {
            let reporter = Reporter::new(spec.id.clone(), signals.clone());
            let Some((kind, timing, link)) = devices.get(&spec.device) else {
                let err = ControlError::Config(format!(
                    "{}: device {} not configured",
                    spec.id, spec.device
                ));
                reject(&reporter, &err);
                continue;
            };
            let config = match PinConfig::from_spec(spec, *kind) {
                Ok(config) => config,
                Err(e) => {
                    reject(&reporter, &e);
                    continue;
                }
            };
            let session =
                PinSession::spawn(config, link.clone(), *timing, signals.clone(), metrics.clone());
            order.push(spec.id.clone());
            sessions.insert(spec.id.clone(), session);
        }
        info!(devices = supervisors.len(), pins = sessions.len(), "topology started");
        Ok(Self {
            supervisors,
            sessions,
            order,
        })
    }

    pub fn supervisor(&self, id: &str) -> Option<&ConnectionSupervisor> {
        self.supervisors.iter().find(|s| s.id() == id)
    }

    pub fn session(&self, id: &str) -> Option<&PinSession> {
        self.sessions.get(id)
    }

    /// Pin ids in topology order.
    pub fn pins(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Route an inbound application value to the pin named `node`.
    pub fn dispatch(&self, node: &str, payload: Value) -> Result<()> {
        let session = self
            .sessions
            .get(node)
            .ok_or_else(|| ControlError::Config(format!("unknown pin {node}")))?;
        session.send(payload)
    }

    /// Stop sessions first so inputs unsubscribe while their device is
    /// still up, then close every device.
    /// A failing node does not stop the rest; the first failure is returned.
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first = None;
        for id in &self.order {
            if let Some(session) = self.sessions.get_mut(id) {
                if let Err(e) = session.stop().await {
                    warn!(pin = %id, error = %e, "session did not stop cleanly");
                    first.get_or_insert(e);
                }
            }
        }
        for supervisor in &mut self.supervisors {
            if let Err(e) = supervisor.teardown().await {
                warn!(device = %supervisor.id(), error = %e, "teardown failed");
                first.get_or_insert(e);
            }
        }
        info!("topology stopped");
        first.map_or(Ok(()), Err)
    }
}

fn reject(reporter: &Reporter, err: &ControlError) {
    warn!(node = %reporter.node(), error = %err, "node not started");
    reporter.warn(err.to_string());
    reporter.status(NodeStatus::misconfigured(err.to_string()));
}
