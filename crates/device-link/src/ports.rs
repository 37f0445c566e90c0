use crate::{PortInfo, Result, TransportError};
use serialport::SerialPortType;

/// Serial ports a board could be attached to.
pub fn list_serial_ports() -> Result<Vec<PortInfo>> {
    let mut out = Vec::new();
    for p in serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))? {
        let driver = match p.port_type {
            SerialPortType::UsbPort(u) => match u.product {
                Some(product) => format!("usb ({product})"),
                None => format!("usb {:04x}:{:04x}", u.vid, u.pid),
            },
            SerialPortType::BluetoothPort => "bluetooth".to_string(),
            SerialPortType::PciPort => "pci".to_string(),
            SerialPortType::Unknown => "serial".to_string(),
        };
        out.push(PortInfo {
            name: p.port_name,
            driver,
        });
    }
    Ok(out)
}
