//! Serial port enumeration and Robofocus auto-discovery.
//!
//! Discovery probes each candidate port with a single short-timeout `FV`
//! handshake; a port that answers with a valid firmware packet is a
//! Robofocus.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::log::ProtocolLog;
use crate::protocol::port::{Backend, ProtocolPort};

#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    pub port: String,
    pub firmware: String,
}

/// Lists the serial ports present on the system.
pub fn list_ports() -> Vec<PortInfo> {
    tokio_serial::available_ports()
        .unwrap_or_default()
        .into_iter()
        .map(|info| PortInfo {
            name: info.port_name,
            description: describe(&info.port_type),
        })
        .collect()
}

fn describe(port_type: &tokio_serial::SerialPortType) -> String {
    match port_type {
        tokio_serial::SerialPortType::UsbPort(usb) => usb
            .product
            .clone()
            .unwrap_or_else(|| "USB serial device".to_owned()),
        tokio_serial::SerialPortType::BluetoothPort => "Bluetooth serial device".to_owned(),
        tokio_serial::SerialPortType::PciPort => "PCI serial device".to_owned(),
        tokio_serial::SerialPortType::Unknown => String::new(),
    }
}

/// Probes every available port for a Robofocus. Ports that cannot be opened
/// or stay silent are skipped; the scan never fails as a whole.
pub async fn scan_for_devices(
    baud: u32,
    probe_timeout: Duration,
    log: &Arc<ProtocolLog>,
) -> Vec<DiscoveredDevice> {
    let mut found = Vec::new();
    for info in list_ports() {
        match probe(&info.name, baud, probe_timeout, log).await {
            Some(firmware) => {
                tracing::info!(port = %info.name, %firmware, "found Robofocus");
                found.push(DiscoveredDevice {
                    port: info.name,
                    firmware,
                });
            }
            None => tracing::debug!(port = %info.name, "no Robofocus on port"),
        }
    }
    found
}

async fn probe(
    port_name: &str,
    baud: u32,
    probe_timeout: Duration,
    log: &Arc<ProtocolLog>,
) -> Option<String> {
    let port = ProtocolPort::new(probe_timeout, Arc::clone(log)).with_attempts(1);
    let backend = Backend::Serial {
        port: port_name.to_owned(),
        baud,
    };
    match port.connect(&backend).await {
        Ok(firmware) => {
            port.disconnect().await;
            Some(firmware)
        }
        Err(err) => {
            tracing::debug!(port = port_name, %err, "probe failed");
            None
        }
    }
}
