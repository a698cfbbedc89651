use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crate::transport::TransportError;

/// Port the DHO900 family listens on for raw SCPI over TCP.
pub const SCPI_RAW_PORT: u16 = 5555;

/// Outcome of a single bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRead {
    Data(Vec<u8>),
    /// The read timed out or returned zero bytes. The instrument has nothing
    /// more to say right now; this is not a connection failure.
    EndOfStream,
}

/// Timeout and terminator settings of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// How long a read may block. Zero makes reads non-blocking: a read
    /// returns what has already arrived, or end of stream.
    pub timeout: Duration,
    /// `None` puts the connection in binary-safe mode.
    pub read_terminator: Option<u8>,
    pub write_terminator: Option<u8>,
}

impl ConnectionSettings {
    pub fn binary(timeout: Duration) -> Self {
        Self {
            timeout,
            read_terminator: None,
            write_terminator: Some(b'\n'),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            read_terminator: Some(b'\n'),
            write_terminator: Some(b'\n'),
        }
    }
}

/// A byte-stream endpoint to the instrument.
///
/// Implementations only move bytes. Framing, retries and decoding live in
/// [`ScpiTransport`](crate::transport::ScpiTransport) and the capture engine.
pub trait Connection {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read at most `max_len` bytes, blocking up to the configured timeout.
    fn read_chunk(&mut self, max_len: usize) -> Result<ChunkRead, TransportError>;

    /// Discard input that has arrived but not been read yet.
    fn clear_input(&mut self) -> Result<(), TransportError>;

    fn settings(&self) -> ConnectionSettings;

    fn apply_settings(&mut self, settings: ConnectionSettings) -> Result<(), TransportError>;

    /// Switch into binary-safe mode until the returned guard is dropped.
    fn binary_mode(&mut self, timeout: Duration) -> Result<BinaryMode<'_, Self>, TransportError>
    where
        Self: Sized,
    {
        BinaryMode::enter(self, timeout)
    }
}

/// Scoped binary-safe mode on a connection.
///
/// The settings that were active on entry are restored when the guard goes
/// out of scope, whether the capture finished, bailed out with `?`, or
/// unwound.
pub struct BinaryMode<'a, C: Connection> {
    conn: &'a mut C,
    saved: ConnectionSettings,
}

impl<'a, C: Connection> BinaryMode<'a, C> {
    pub fn enter(conn: &'a mut C, timeout: Duration) -> Result<Self, TransportError> {
        let saved = conn.settings();
        conn.apply_settings(ConnectionSettings::binary(timeout))?;
        log::debug!("Entered binary mode (timeout {:?})", timeout);
        Ok(Self { conn, saved })
    }
}

impl<C: Connection> Deref for BinaryMode<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn
    }
}

impl<C: Connection> DerefMut for BinaryMode<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn
    }
}

impl<C: Connection> Drop for BinaryMode<'_, C> {
    fn drop(&mut self) {
        match self.conn.apply_settings(self.saved) {
            Ok(()) => log::debug!("Restored text mode"),
            Err(e) => log::warn!("Failed to restore connection settings: {}", e),
        }
    }
}

fn read_chunk_from<R: Read + ?Sized>(
    reader: &mut R,
    max_len: usize,
) -> Result<ChunkRead, TransportError> {
    let mut buf = vec![0u8; max_len];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(ChunkRead::EndOfStream),
            Ok(n) => {
                buf.truncate(n);
                return Ok(ChunkRead::Data(buf));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                return Ok(ChunkRead::EndOfStream)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Instrument reached through a serial port (USB-CDC or RS232 adapter).
pub struct SerialConnection {
    serial: Box<dyn SerialPort>,
    settings: ConnectionSettings,
}

impl SerialConnection {
    pub fn open(
        port: &str,
        baud_rate: u32,
        settings: ConnectionSettings,
    ) -> Result<Self, TransportError> {
        log::debug!("Opening serial port {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate)
            .timeout(settings.timeout)
            .open()?;

        let mut connection = Self { serial, settings };
        connection.flush()?;
        Ok(connection)
    }

    /// Drop anything the instrument sent before we started listening.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        self.serial.clear(serialport::ClearBuffer::All)?;
        Ok(())
    }
}

impl std::fmt::Debug for SerialConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialConnection")
            .field("port", &self.serial.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Connection for SerialConnection {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.serial.write_all(data)?;
        self.serial.flush()?;
        Ok(())
    }

    fn read_chunk(&mut self, max_len: usize) -> Result<ChunkRead, TransportError> {
        read_chunk_from(&mut self.serial, max_len)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.serial.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }

    fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    fn apply_settings(&mut self, settings: ConnectionSettings) -> Result<(), TransportError> {
        self.serial.set_timeout(settings.timeout)?;
        self.settings = settings;
        Ok(())
    }
}

/// Instrument reached through its raw SCPI socket.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    settings: ConnectionSettings,
}

impl TcpConnection {
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        settings: ConnectionSettings,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        log::debug!("Connected to {:?}", stream.peer_addr());

        let mut connection = Self { stream, settings };
        connection.apply_settings(settings)?;
        Ok(connection)
    }

    /// Connect to `host` on the default raw SCPI port.
    pub fn connect_host(host: &str, settings: ConnectionSettings) -> Result<Self, TransportError> {
        Self::connect((host, SCPI_RAW_PORT), settings)
    }
}

impl Connection for TcpConnection {
    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    fn read_chunk(&mut self, max_len: usize) -> Result<ChunkRead, TransportError> {
        read_chunk_from(&mut self.stream, max_len)
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.stream.set_nonblocking(true)?;
        let mut discarded = 0;
        let drained = loop {
            match read_chunk_from(&mut self.stream, 4096) {
                Ok(ChunkRead::Data(bytes)) => discarded += bytes.len(),
                Ok(ChunkRead::EndOfStream) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.stream.set_nonblocking(self.settings.timeout.is_zero())?;
        if discarded > 0 {
            log::debug!("Discarded {} stale bytes", discarded);
        }
        drained
    }

    fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    fn apply_settings(&mut self, settings: ConnectionSettings) -> Result<(), TransportError> {
        // Sockets reject a zero timeout, so zero switches to non-blocking
        // reads instead, matching the serial port.
        if settings.timeout.is_zero() {
            self.stream.set_nonblocking(true)?;
        } else {
            self.stream.set_nonblocking(false)?;
            self.stream.set_read_timeout(Some(settings.timeout))?;
            self.stream.set_write_timeout(Some(settings.timeout))?;
        }
        self.settings = settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_connection::MockConnection;
    use std::net::TcpListener;

    #[test]
    fn test_binary_mode_restores_settings_on_drop() {
        let mut conn = MockConnection::new();
        let original = conn.settings();

        {
            let guard = conn.binary_mode(Duration::from_secs(17)).unwrap();
            assert_eq!(guard.settings().read_terminator, None);
            assert_eq!(guard.settings().timeout, Duration::from_secs(17));
        }

        assert_eq!(conn.settings(), original);
    }

    #[test]
    fn test_binary_mode_restores_settings_on_early_return() {
        fn failing_capture(conn: &mut MockConnection) -> Result<(), TransportError> {
            let mut guard = conn.binary_mode(Duration::from_secs(5))?;
            guard.read_chunk(16)?;
            Ok(())
        }

        let mut conn = MockConnection::new();
        conn.push_error(ErrorKind::BrokenPipe);
        let original = conn.settings();

        assert!(failing_capture(&mut conn).is_err());
        assert_eq!(conn.settings(), original);
    }

    #[test]
    fn test_binary_mode_restores_settings_on_panic() {
        let mut conn = MockConnection::new();
        let original = conn.settings();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = conn.binary_mode(Duration::from_secs(5)).unwrap();
            std::panic::resume_unwind(Box::new("capture blew up"));
        }));

        assert!(result.is_err());
        assert_eq!(conn.settings(), original);
    }

    struct FailingReader(ErrorKind);

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(self.0.into())
        }
    }

    #[test]
    fn test_read_chunk_maps_timeouts_to_end_of_stream() {
        let timed_out = read_chunk_from(&mut FailingReader(ErrorKind::TimedOut), 4).unwrap();
        assert_eq!(timed_out, ChunkRead::EndOfStream);

        let mut empty: &[u8] = &[];
        assert_eq!(read_chunk_from(&mut empty, 4).unwrap(), ChunkRead::EndOfStream);

        let mut data: &[u8] = &[7, 8];
        assert_eq!(read_chunk_from(&mut data, 4).unwrap(), ChunkRead::Data(vec![7, 8]));

        assert!(read_chunk_from(&mut FailingReader(ErrorKind::ConnectionReset), 4).is_err());
    }

    #[test]
    fn test_tcp_connection_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = [0u8; 7];
            socket.read_exact(&mut request).unwrap();
            socket.write_all(b"RIGOL\n").unwrap();
            request
        });

        let settings = ConnectionSettings {
            timeout: Duration::from_millis(500),
            ..ConnectionSettings::default()
        };
        let mut conn = TcpConnection::connect(addr, settings).unwrap();
        conn.write_all(b"*IDN?\r\n").unwrap();

        let mut received = Vec::new();
        while received.len() < 6 {
            match conn.read_chunk(64).unwrap() {
                ChunkRead::Data(bytes) => received.extend(bytes),
                ChunkRead::EndOfStream => break,
            }
        }

        assert_eq!(&server.join().unwrap(), b"*IDN?\r\n");
        assert_eq!(received, b"RIGOL\n");
    }

    #[test]
    fn test_tcp_clear_input_drops_stale_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (go, wait) = std::sync::mpsc::channel();

        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(b"stale\n").unwrap();
            wait.recv().unwrap();
            socket.write_all(b"fresh\n").unwrap();
        });

        let settings = ConnectionSettings {
            timeout: Duration::from_millis(500),
            ..ConnectionSettings::default()
        };
        let mut conn = TcpConnection::connect(addr, settings).unwrap();
        // Wait until the stale answer is in the receive buffer.
        assert!(matches!(conn.read_chunk(1).unwrap(), ChunkRead::Data(_)));
        std::thread::sleep(Duration::from_millis(50));
        conn.clear_input().unwrap();
        go.send(()).unwrap();

        let mut received = Vec::new();
        while received.len() < 6 {
            match conn.read_chunk(64).unwrap() {
                ChunkRead::Data(bytes) => received.extend(bytes),
                ChunkRead::EndOfStream => break,
            }
        }
        server.join().unwrap();
        assert_eq!(received, b"fresh\n");
    }

    #[test]
    fn test_tcp_zero_timeout_is_non_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || listener.accept().unwrap());

        let settings = ConnectionSettings {
            timeout: Duration::ZERO,
            ..ConnectionSettings::default()
        };
        let mut conn = TcpConnection::connect(addr, settings).unwrap();
        let _socket = server.join().unwrap();

        let start = std::time::Instant::now();
        assert_eq!(conn.read_chunk(16).unwrap(), ChunkRead::EndOfStream);
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}
