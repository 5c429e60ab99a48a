// Serial link to the motor controller board
//
// Opens the port and splits it into a read half (owned by the receiver
// thread) and a write half (used by the command writer).

use serialport::{self, ClearBuffer, SerialPort};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info};

use super::protocol::CommandFrame;

/// Error types for the serial link
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// Independently usable halves of one serial port
pub struct SerialLink {
    pub reader: Box<dyn SerialPort>,
    pub writer: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open the port, raise DTR/RTS and split it into read/write handles
    pub fn open(port_name: &str, baudrate: u32, timeout: Duration) -> Result<Self> {
        info!("Opening serial port {} at {} baud", port_name, baudrate);
        let mut port = serialport::new(port_name, baudrate)
            .timeout(timeout)
            .open()?;

        port.write_data_terminal_ready(true)?;
        port.write_request_to_send(true)?;

        let writer = port.try_clone()?;
        Ok(Self {
            reader: port,
            writer,
        })
    }

    /// Drop anything the board sent before we were ready to decode it
    pub fn flush_input(&self) -> Result<()> {
        self.reader.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Encodes velocity commands and writes them to the board.
///
/// Delivery is best effort: a failed write is reported to the caller and
/// the command is gone, nothing is queued or retried.
pub struct CommandWriter<W> {
    port: W,
    sent: u64,
}

impl<W: Write> CommandWriter<W> {
    pub fn new(port: W) -> Self {
        Self { port, sent: 0 }
    }

    /// Send one command frame
    pub fn send(&mut self, command: CommandFrame) -> Result<()> {
        let frame = command.encode();
        debug!("Sending command {:?} as {:02X?}", command, frame);

        self.port.write_all(&frame)?;
        self.port.flush()?;
        self.sent += 1;
        Ok(())
    }

    /// Number of commands written successfully
    pub fn sent(&self) -> u64 {
        self.sent
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.port
    }
}
