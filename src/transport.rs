use std::time::Duration;

use crate::connection::{ChunkRead, Connection};
use crate::retry::RetryPolicy;

/// Largest read issued while pulling a definite-length block.
const BLOCK_READ_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("Timeout after {timeout:?} waiting for a response to '{command}'")]
    Timeout { command: String, timeout: Duration },

    #[error("Invalid binary block header: {0}")]
    InvalidBlockHeader(String),

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether sending the same command again can help. A malformed block
    /// or undecodable text means the stream itself is out of step.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InvalidBlockHeader(_) | Self::Utf8(_))
    }
}

/// Parsed `#<n><n digits of length>` prefix of a binary block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub header_len: usize,
    /// `None` for the indefinite-length form `#0`.
    pub payload_len: Option<usize>,
}

/// Parse a block header at the very start of `rx`.
pub fn parse_block_header(rx: &[u8]) -> Result<BlockHeader, TransportError> {
    let invalid = || {
        TransportError::InvalidBlockHeader(
            String::from_utf8_lossy(&rx[..rx.len().min(12)]).into_owned(),
        )
    };

    if rx.first() != Some(&b'#') {
        return Err(invalid());
    }
    let digit_count = rx
        .get(1)
        .filter(|b| b.is_ascii_digit())
        .map(|b| usize::from(b - b'0'))
        .ok_or_else(invalid)?;
    if digit_count == 0 {
        return Ok(BlockHeader {
            header_len: 2,
            payload_len: None,
        });
    }

    let digits = rx.get(2..2 + digit_count).ok_or_else(invalid)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    let payload_len = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid)?;

    Ok(BlockHeader {
        header_len: 2 + digit_count,
        payload_len: Some(payload_len),
    })
}

fn strip_terminator(data: &[u8], terminator: Option<u8>) -> &[u8] {
    match (terminator, data.split_last()) {
        (Some(t), Some((last, rest))) if *last == t => rest,
        _ => data,
    }
}

/// SCPI command/query primitives over a [`Connection`].
///
/// `write`, `query_text` and `query_binary` are retried according to the
/// transport's [`RetryPolicy`]; everything else is single-shot. Only
/// transient failures are retried, and pending input is discarded before a
/// query goes out again so a late answer is not taken for the new one.
#[derive(Debug)]
pub struct ScpiTransport<C: Connection> {
    conn: C,
    retry: RetryPolicy,
}

impl<C: Connection> ScpiTransport<C> {
    pub fn new(conn: C) -> Self {
        Self::with_retry(conn, RetryPolicy::default())
    }

    pub fn with_retry(conn: C, retry: RetryPolicy) -> Self {
        Self { conn, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn into_inner(self) -> C {
        self.conn
    }

    /// Send a command that has no response.
    pub fn write(&mut self, command: &str) -> Result<(), TransportError> {
        let retry = self.retry;
        retry.run_if(command, TransportError::is_transient, || self.write_once(command))
    }

    /// Send a command exactly once, without the retry policy.
    pub fn write_once(&mut self, command: &str) -> Result<(), TransportError> {
        log::debug!("-> {}", command);
        let terminator = self.conn.settings().write_terminator;
        let mut bytes = Vec::with_capacity(command.len() + 1);
        bytes.extend_from_slice(command.as_bytes());
        bytes.extend(terminator);
        self.conn.write_all(&bytes)
    }

    /// Send a query and read back one text line.
    pub fn query_text(&mut self, command: &str) -> Result<String, TransportError> {
        let retry = self.retry;
        let mut resend = false;
        retry.run_if(command, TransportError::is_transient, || {
            self.prepare_attempt(&mut resend)?;
            self.write_once(command)?;
            self.read_line(command)
        })
    }

    /// Send a query and read back one binary block with its framing removed.
    pub fn query_binary(&mut self, command: &str) -> Result<Vec<u8>, TransportError> {
        let retry = self.retry;
        let mut resend = false;
        retry.run_if(command, TransportError::is_transient, || {
            self.prepare_attempt(&mut resend)?;
            self.write_once(command)?;
            self.read_block(command)
        })
    }

    /// One raw read, no retry, no framing.
    pub fn read_chunk(&mut self, max_len: usize) -> Result<ChunkRead, TransportError> {
        self.conn.read_chunk(max_len)
    }

    fn prepare_attempt(&mut self, resend: &mut bool) -> Result<(), TransportError> {
        if *resend {
            self.conn.clear_input()?;
        }
        *resend = true;
        Ok(())
    }

    fn timeout_error(&self, command: &str) -> TransportError {
        TransportError::Timeout {
            command: command.to_string(),
            timeout: self.conn.settings().timeout,
        }
    }

    fn read_line(&mut self, command: &str) -> Result<String, TransportError> {
        let terminator = self.conn.settings().read_terminator;
        let mut response = Vec::new();

        loop {
            match self.conn.read_chunk(1)? {
                ChunkRead::Data(bytes) => {
                    let done = terminator.is_some_and(|t| bytes.contains(&t));
                    response.extend(bytes);
                    if done {
                        break;
                    }
                }
                // Without a terminator the only end-of-line signal is silence.
                ChunkRead::EndOfStream if terminator.is_none() && !response.is_empty() => break,
                ChunkRead::EndOfStream => return Err(self.timeout_error(command)),
            }
        }

        let line = String::from_utf8(response)?;
        log::debug!("<- {}", line.trim());
        Ok(line.trim().to_string())
    }

    fn read_byte(&mut self, command: &str) -> Result<u8, TransportError> {
        loop {
            match self.conn.read_chunk(1)? {
                ChunkRead::Data(bytes) => {
                    if let Some(&byte) = bytes.first() {
                        return Ok(byte);
                    }
                }
                ChunkRead::EndOfStream => return Err(self.timeout_error(command)),
            }
        }
    }

    fn read_exact(&mut self, len: usize, command: &str) -> Result<Vec<u8>, TransportError> {
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let wanted = (len - data.len()).min(BLOCK_READ_SIZE);
            match self.conn.read_chunk(wanted)? {
                ChunkRead::Data(bytes) => data.extend(bytes),
                ChunkRead::EndOfStream => {
                    log::debug!("Block ended after {} of {} bytes", data.len(), len);
                    return Err(self.timeout_error(command));
                }
            }
        }
        Ok(data)
    }

    fn read_until_quiet(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut data = Vec::new();
        while let ChunkRead::Data(bytes) = self.conn.read_chunk(BLOCK_READ_SIZE)? {
            data.extend(bytes);
        }
        Ok(data)
    }

    fn read_block(&mut self, command: &str) -> Result<Vec<u8>, TransportError> {
        let terminator = self.conn.settings().read_terminator.or(Some(b'\n'));

        let first = self.read_byte(command)?;
        if first != b'#' {
            log::debug!("Response to '{}' has no block header", command);
            let mut payload = vec![first];
            payload.extend(self.read_until_quiet()?);
            let len = strip_terminator(&payload, terminator).len();
            payload.truncate(len);
            return Ok(payload);
        }

        let mut header = vec![first, self.read_byte(command)?];
        if header[1].is_ascii_digit() {
            let digit_count = usize::from(header[1] - b'0');
            header.extend(self.read_exact(digit_count, command)?);
        }

        match parse_block_header(&header)?.payload_len {
            Some(len) => {
                let payload = self.read_exact(len, command)?;
                self.consume_terminator()?;
                log::debug!("<- {} byte block", payload.len());
                Ok(payload)
            }
            None => {
                let mut payload = self.read_until_quiet()?;
                let len = strip_terminator(&payload, terminator).len();
                payload.truncate(len);
                Ok(payload)
            }
        }
    }

    fn consume_terminator(&mut self) -> Result<(), TransportError> {
        let Some(terminator) = self.conn.settings().read_terminator else {
            return Ok(());
        };
        match self.conn.read_chunk(1)? {
            ChunkRead::Data(bytes) if bytes.first() != Some(&terminator) => {
                log::warn!("Unexpected byte after binary block: {:02X?}", bytes);
            }
            _ => {}
        }
        Ok(())
    }
}
