//! pin-control: self-healing device connections and per-pin sessions
//!
//! A [`ConnectionSupervisor`] keeps one device connected, retrying and
//! reporting failures without flooding the host. Each [`PinSession`]
//! configures its pin whenever the device becomes ready and translates
//! between host values and device operations through [`transform`].

pub mod config;
pub mod controller;
pub mod error;
pub mod metrics;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod transform;

pub use config::{
    load_topology_file, parse_topology, DeviceConfig, LogicalMode, PinConfig, Timing, Topology,
};
pub use controller::{ConnectorSet, Controller};
pub use error::{ControlError, InvalidPayload, Result};
pub use metrics::MetricsHub;
pub use session::{PinSession, PinSessionState};
pub use status::{NodeSignal, NodeStatus, OutboundEvent, SignalSink};
pub use supervisor::{ConnectionSupervisor, LinkSnapshot, LinkState, SupervisorLink};
