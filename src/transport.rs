use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Baud rate the stock OpenBench LogicSniffer firmware talks at.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Per-read timeout of the serial port.
pub const READ_TIMEOUT: Duration = Duration::from_millis(250);

// Sleep granularity while polling for buffered bytes.
const POLL_INTERVAL: Duration = Duration::from_micros(25);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(std::io::Error),

    #[error("Read timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Whether this error is an expected "no data yet" timeout rather than a
    /// real transport failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::TimedOut {
            Self::Timeout(READ_TIMEOUT)
        } else {
            Self::Io(err)
        }
    }
}

/// Byte-oriented connection to a sampling device.
///
/// Timeouts are reported as [`TransportError::Timeout`] so that callers can
/// treat "no data yet" as a retryable condition instead of a failure.
pub trait Transport {
    /// Write all bytes and flush them out to the device.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read a single byte, waiting at most the port's read timeout.
    fn read_byte(&mut self) -> Result<u8, TransportError>;

    /// Fill `buf`, waiting up to `max_wait` for all bytes to be buffered
    /// before consuming any of them. On timeout the input stream is left
    /// untouched, so no partially consumed word is ever produced.
    fn read_exact(&mut self, buf: &mut [u8], max_wait: Duration) -> Result<(), TransportError>;

    /// Number of bytes currently buffered on the input side.
    fn bytes_available(&mut self) -> Result<usize, TransportError>;

    /// Discard everything buffered on the input side.
    fn flush_input(&mut self) -> Result<(), TransportError>;
}

/// [`Transport`] implementation over a physical serial port.
///
/// The port is opened with the framing the analyzer hardware expects:
/// 8 data bits, 1 stop bit, no parity and XON/XOFF flow control.
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the serial port at `port` with the given baud rate.
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let serial = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::Software)
            .timeout(READ_TIMEOUT)
            .open()?;

        Ok(Self { serial })
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.serial.name())
            .finish()
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.serial.write_all(bytes)?;
        self.serial.flush()?;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        self.serial.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    fn read_exact(&mut self, buf: &mut [u8], max_wait: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + max_wait;
        while self.bytes_available()? < buf.len() {
            if Instant::now() > deadline {
                return Err(TransportError::Timeout(max_wait));
            }
            thread::sleep(POLL_INTERVAL);
        }
        self.serial.read_exact(buf)?;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        Ok(self.serial.bytes_to_read()? as usize)
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        self.serial.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Names of all serial ports on this host a device could be attached to.
pub fn list_ports() -> Result<Vec<String>, TransportError> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Transport, TransportError};
    use std::collections::VecDeque;
    use std::thread;
    use std::time::Duration;

    /// Scripted in-memory transport. Reads are served from a pre-loaded
    /// queue; an empty queue behaves like a port read timeout.
    pub(crate) struct MockTransport {
        pub reads: VecDeque<u8>,
        pub writes: Vec<u8>,
        pub flushes: usize,
        pub timeout_delay: Duration,
    }

    impl MockTransport {
        pub(crate) fn new(reads: &[u8]) -> Self {
            Self {
                reads: reads.iter().copied().collect(),
                writes: Vec::new(),
                flushes: 0,
                timeout_delay: Duration::from_millis(1),
            }
        }

        fn timeout(&self) -> TransportError {
            // Simulate the blocking wait a real port performs before
            // reporting a timeout, so polling loops do not spin hot.
            thread::sleep(self.timeout_delay);
            TransportError::Timeout(self.timeout_delay)
        }
    }

    impl Transport for MockTransport {
        fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.writes.extend_from_slice(bytes);
            Ok(())
        }

        fn read_byte(&mut self) -> Result<u8, TransportError> {
            self.reads.pop_front().ok_or_else(|| self.timeout())
        }

        fn read_exact(&mut self, buf: &mut [u8], _max_wait: Duration) -> Result<(), TransportError> {
            if self.reads.len() < buf.len() {
                return Err(self.timeout());
            }
            for slot in buf.iter_mut() {
                *slot = self.reads.pop_front().unwrap_or_default();
            }
            Ok(())
        }

        fn bytes_available(&mut self) -> Result<usize, TransportError> {
            Ok(self.reads.len())
        }

        fn flush_input(&mut self) -> Result<(), TransportError> {
            // Scripted responses stay buffered; only the call is recorded.
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn read_exact_does_not_consume_on_timeout() {
        let mut mock = MockTransport::new(&[0xAA, 0xBB]);
        let mut buf = [0u8; 4];

        let err = mock.read_exact(&mut buf, Duration::from_millis(1)).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(mock.bytes_available().unwrap(), 2);

        let mut buf = [0u8; 2];
        mock.read_exact(&mut buf, Duration::from_millis(1)).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
    }
}
