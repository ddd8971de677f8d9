//! Byte transports to the PCI: TCP or a local serial port.
//!
//! The engine owns exactly one transport at a time and drives it from its
//! event loop with short read timeouts; a timeout is the loop's idle tick,
//! not an error.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// A byte channel to the PCI.
///
/// `read` returns `Ok(0)` when the peer has closed the channel and an error
/// of kind `TimedOut`/`WouldBlock` when `timeout` elapsed with nothing to
/// read.
pub trait PciTransport: Send {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn shutdown(&mut self);
}

/// TCP connection to a PCI reachable over the network.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<Self> {
        let resolved = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no address resolved"))?;
        let stream = TcpStream::connect_timeout(&resolved, timeout)?;
        // Frames are tiny; disable Nagle to keep command latency down.
        let _ = stream.set_nodelay(true);
        Ok(Self { stream })
    }
}

impl PciTransport for TcpTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.stream.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Local serial port to a PCI at 9600 8N1.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str) -> io::Result<Self> {
        let port = serialport::new(path, 9600)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Self { port })
    }
}

impl PciTransport for SerialTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.port.read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }

    fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// Test transport
// ---------------------------------------------------------------------------
