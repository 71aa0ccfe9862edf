//! Frame transport for the binary protocol
//!
//! [`BinaryTransport`] abstracts frame-level I/O so the link layer can be
//! driven against scripted transports in tests; [`SerialTransport`] is the
//! production implementation over a serial port.

use std::io;
use std::time::{Duration, Instant};

use tracing::trace;

use super::packet::FRAME_LEN;

/// Wire rate of the binary protocol. Fixed; the devices ship at 9600 baud.
pub const BAUD_RATE: u32 = 9600;

/// Default window to wait for a reply frame.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-read poll interval while waiting out the timeout window.
const POLL_TIMEOUT: Duration = Duration::from_millis(50);

/// Frame-level I/O for the binary protocol.
pub trait BinaryTransport: Send {
    /// Write one frame.
    fn write_frame(&mut self, frame: &[u8; FRAME_LEN]) -> io::Result<()>;

    /// Read one frame, waiting up to the configured timeout for it to
    /// arrive. Returns `Ok(None)` if the line stays silent for the whole
    /// window; a frame that starts but does not finish is an error.
    fn read_frame(&mut self) -> io::Result<Option<[u8; FRAME_LEN]>>;

    /// Set the silence window for [`read_frame`](Self::read_frame).
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// Production transport over a serial port (9600 8N1).
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    timeout: Duration,
}

impl SerialTransport {
    /// Open a serial port at the protocol's fixed settings.
    ///
    /// # Arguments
    ///
    /// * `port_name` - OS port path, e.g. `/dev/ttyUSB0` or `COM3`
    pub fn open(port_name: &str) -> serialport::Result<Self> {
        let port = serialport::new(port_name, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(POLL_TIMEOUT)
            .open()?;

        Ok(Self {
            port,
            timeout: DEFAULT_TIMEOUT,
        })
    }
}

impl BinaryTransport for SerialTransport {
    fn write_frame(&mut self, frame: &[u8; FRAME_LEN]) -> io::Result<()> {
        trace!("send frame: {frame:02X?}");
        self.port.write_all(frame)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_frame(&mut self) -> io::Result<Option<[u8; FRAME_LEN]>> {
        let deadline = Instant::now() + self.timeout;
        let mut frame = [0u8; FRAME_LEN];
        let mut filled = 0;

        // Single-byte reads against a short port timeout so the overall
        // deadline is honored even when bytes dribble in.
        while filled < FRAME_LEN {
            let mut byte = [0u8; 1];
            match self.port.read(&mut byte) {
                Ok(0) => {}
                Ok(_) => {
                    frame[filled] = byte[0];
                    filled += 1;
                    continue;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("torn frame: got {filled} of {FRAME_LEN} bytes"),
                ));
            }
        }

        trace!("recv frame: {frame:02X?}");
        Ok(Some(frame))
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }
}
