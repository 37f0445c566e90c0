//! device-link: clients for pin-level peripheral control
//!
//! This crate defines the boundary between the connection/pin core and the
//! transports that reach real hardware: a [`Connector`] opens a
//! [`DeviceClient`] for an [`Endpoint`], and the client reports lifecycle and
//! data events on a channel. The default build enables a `mock` backend so
//! that everything compiles and tests on any host without hardware.

mod types;
pub use types::{
    DeviceEvent, Endpoint, PinMode, PortInfo, Pull, RawCommand, ReportKind, TransportKind,
};

mod error;
pub use error::{Result, TransportError};

mod traits;
pub use traits::{Connector, DeviceClient, EventSink};

#[cfg(feature = "mock")]
mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockClient, MockConnector, MockOp, MockOpen};

#[cfg(feature = "serial")]
mod ports;

#[cfg(feature = "serial")]
pub use ports::list_serial_ports;

#[cfg(feature = "firmata")]
pub mod firmata;

#[cfg(feature = "firmata")]
pub use firmata::FirmataConnector;

#[cfg(feature = "pigpiod")]
pub mod pigpiod;

#[cfg(feature = "pigpiod")]
pub use pigpiod::PigpiodConnector;
