use log::{debug, error, info};
use serialport::{SerialPort, SerialPortType};
use std::io::{self, Read, Write};

use crate::config::{LinkConfig, ParityConfig};
use crate::utils::error::{WatcherError, WatcherResult};

/// Byte-stream access to an open serial device. Reads return `Ok(0)` when
/// nothing arrived within the port timeout.
pub trait SerialIo: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens serial devices and locates them by USB identity.
pub trait PortOpener: Send + Sync {
    fn open(&self, path: &str, config: &LinkConfig) -> WatcherResult<Box<dyn SerialIo>>;
    fn find_by_usb_id(&self, vid: u16, pid: u16) -> Option<String>;
}

pub struct NativePort {
    port: Box<dyn SerialPort>,
}

impl SerialIo for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// `serialport`-backed opener used on real hardware.
#[derive(Debug, Default, Clone)]
pub struct NativeOpener;

impl PortOpener for NativeOpener {
    fn open(&self, path: &str, config: &LinkConfig) -> WatcherResult<Box<dyn SerialIo>> {
        info!("🔌 Opening serial port {} ({} baud, {:?} parity)", path, config.baud_rate, config.parity);

        let parity = match config.parity {
            ParityConfig::None => serialport::Parity::None,
            ParityConfig::Even => serialport::Parity::Even,
            ParityConfig::Odd => serialport::Parity::Odd,
        };

        let port = serialport::new(path, config.baud_rate)
            .timeout(config.read_timeout())
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .parity(parity)
            .open()
            .map_err(|e| {
                error!("❌ Failed to open serial port {}: {}", path, e);
                WatcherError::LinkUnavailable(format!("Failed to open {}: {}", path, e))
            })?;

        Ok(Box::new(NativePort { port }))
    }

    fn find_by_usb_id(&self, vid: u16, pid: u16) -> Option<String> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                debug!("Port enumeration failed: {}", e);
                return None;
            }
        };

        ports.into_iter().find_map(|port| match &port.port_type {
            SerialPortType::UsbPort(usb) if usb.vid == vid && usb.pid == pid => {
                Some(port.port_name.clone())
            }
            _ => None,
        })
    }
}
