use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortInfo, StopBits};

use super::{ConnectionError, Result, TransferError, Transport, TransportKind};
use crate::config::SerialSettings;

const READ_BUFFER_SIZE: usize = 256;

struct ReadSide {
    port: Box<dyn SerialPort>,
    timeout: Duration,
}

/// OS serial port link (desktop path).
pub struct SerialTransport {
    port_name: String,
    reader: Mutex<Option<ReadSide>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    open: AtomicBool,
}

impl SerialTransport {
    /// Candidate ports. Bluetooth virtual ports never host the controller.
    pub fn available_ports() -> std::result::Result<Vec<SerialPortInfo>, ConnectionError> {
        let mut ports: Vec<SerialPortInfo> = serialport::available_ports()?
            .into_iter()
            .filter(|p| !p.port_name.contains("Bluetooth"))
            .collect();
        ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
        Ok(ports)
    }

    /// Opens the port 8-N-1 with DTR asserted and blocks for the settle
    /// delay. The controller reboots on open, so nothing may be written
    /// before this returns.
    pub fn open(port_name: &str, settings: &SerialSettings) -> std::result::Result<Self, ConnectionError> {
        let read_timeout = Duration::from_millis(settings.chunk_timeout_ms);
        let mut port = serialport::new(port_name, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(|e| classify_open_error(port_name, e))?;

        port.write_data_terminal_ready(true)?;

        let mut writer = port.try_clone()?;
        writer.set_timeout(Duration::from_millis(settings.write_timeout_ms))?;

        log::info!(
            "Opened {} at {} baud, waiting {} ms for controller reset",
            port_name, settings.baud_rate, settings.settle_delay_ms
        );
        std::thread::sleep(Duration::from_millis(settings.settle_delay_ms));

        // Boot chatter from the reset is not part of the protocol stream.
        if let Err(e) = port.clear(ClearBuffer::Input) {
            log::warn!("Could not discard boot noise on {}: {}", port_name, e);
        }

        Ok(Self {
            port_name: port_name.to_string(),
            reader: Mutex::new(Some(ReadSide { port, timeout: read_timeout })),
            writer: Mutex::new(Some(writer)),
            open: AtomicBool::new(true),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn classify_open_error(port_name: &str, e: serialport::Error) -> ConnectionError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => ConnectionError::PortNotFound(port_name.to_string()),
        serialport::ErrorKind::Io(ErrorKind::NotFound) => ConnectionError::PortNotFound(port_name.to_string()),
        serialport::ErrorKind::Io(ErrorKind::PermissionDenied) => ConnectionError::PermissionDenied(port_name.to_string()),
        _ => ConnectionError::OpenFailed(format!("{}: {}", port_name, e)),
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().map_err(|_| TransferError::Closed)?;
        let port = guard.as_mut().ok_or(TransferError::Closed)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_chunk(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut guard = self.reader.lock().map_err(|_| TransferError::Closed)?;
        let side = guard.as_mut().ok_or(TransferError::Closed)?;
        if side.timeout != timeout {
            side.port.set_timeout(timeout).map_err(std::io::Error::from)?;
            side.timeout = timeout;
        }
        let mut buf = [0u8; READ_BUFFER_SIZE];
        match side.port.read(&mut buf) {
            Ok(0) => Ok(Vec::new()),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(Vec::new())
            }
            Err(e) => Err(TransferError::Io(e)),
        }
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut writer) = self.writer.lock() {
            *writer = None;
        }
        if let Ok(mut reader) = self.reader.lock() {
            *reader = None;
        }
        log::info!("Closed serial port {}", self.port_name);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_maps_to_port_not_found() {
        let err = classify_open_error("COM99", serialport::Error::new(serialport::ErrorKind::NoDevice, "gone"));
        assert!(matches!(err, ConnectionError::PortNotFound(ref p) if p == "COM99"));
    }

    #[test]
    fn permission_error_is_distinguished() {
        let err = classify_open_error(
            "/dev/ttyUSB0",
            serialport::Error::new(serialport::ErrorKind::Io(ErrorKind::PermissionDenied), "denied"),
        );
        assert!(matches!(err, ConnectionError::PermissionDenied(_)));
    }

    #[test]
    fn other_errors_are_open_failures() {
        let err = classify_open_error("/dev/ttyUSB0", serialport::Error::new(serialport::ErrorKind::InvalidInput, "bad"));
        assert!(matches!(err, ConnectionError::OpenFailed(_)));
    }
}
