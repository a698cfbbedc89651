//! Screen capture over a connection that never announces how much is coming.
//!
//! The instrument answers `DISP:DATA?` with a PNG that may be preceded by
//! transport noise and is not length-framed. A capture therefore runs
//! through four phases:
//!
//! 1. **Requesting**: the capture command goes out once, in binary mode,
//!    followed by a settling pause while the instrument renders the frame.
//! 2. **Accumulating**: fixed-size chunks are appended until the image's
//!    start signature *and* end marker have been seen, or the connection
//!    goes quiet ([`ChunkRead::EndOfStream`]), or the chunk budget runs out.
//! 3. **Validating**: the buffer must be plausibly large; bytes before the
//!    signature are dropped.
//! 4. **Complete** or **Failed**.
//!
//! [`ImageCapture`] owns phases 2-4 and only needs a [`ChunkSource`], so it
//! can be driven by a scripted source in tests.

use std::thread;
use std::time::Duration;

use crate::connection::{ChunkRead, Connection};
use crate::transport::{ScpiTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("Capture payload too small: {len} bytes (need at least {min})")]
    PayloadTooSmall { len: usize, min: usize },

    #[error("Capture did not complete within {chunks} chunks ({bytes} bytes read)")]
    SizeExceeded { chunks: usize, bytes: usize },

    #[error("No image signature found in {len} captured bytes")]
    SignatureNotFound { len: usize },

    #[error("Transport error during capture: {0}")]
    Transport(#[from] TransportError),
}

/// Start signature and end marker of an image container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageFormat {
    pub name: &'static str,
    pub signature: &'static [u8],
    pub end_marker: &'static [u8],
}

impl ImageFormat {
    pub const PNG: Self = Self {
        name: "PNG",
        signature: b"\x89PNG",
        end_marker: b"IEND\xAE\x42\x60\x82",
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    pub format: ImageFormat,
    pub chunk_size: usize,
    /// Reads allowed before giving up with [`CaptureError::SizeExceeded`].
    pub max_chunks: usize,
    /// Anything shorter is a protocol desync, not an image.
    pub min_size: usize,
    /// Pause between the capture request and the first read.
    pub settle_delay: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            format: ImageFormat::PNG,
            chunk_size: 1024,
            max_chunks: 300,
            min_size: 1000,
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// Anything that can hand out one bounded chunk at a time.
pub trait ChunkSource {
    fn next_chunk(&mut self, max_len: usize) -> Result<ChunkRead, TransportError>;
}

impl<C: Connection> ChunkSource for C {
    fn next_chunk(&mut self, max_len: usize) -> Result<ChunkRead, TransportError> {
        self.read_chunk(max_len)
    }
}

/// Why accumulation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Signature and end marker are both in the buffer.
    MarkerFound,
    /// The connection went quiet.
    EndOfStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    Accumulating,
    Validating(StopReason),
}

/// A validated capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub data: Vec<u8>,
    pub signature_found: bool,
    pub chunks_read: usize,
}

impl CapturedImage {
    /// The image bytes, or [`CaptureError::SignatureNotFound`] if the
    /// buffer was passed through unrecognised.
    pub fn require_signature(self) -> Result<Vec<u8>, CaptureError> {
        if self.signature_found {
            Ok(self.data)
        } else {
            Err(CaptureError::SignatureNotFound {
                len: self.data.len(),
            })
        }
    }
}

/// Accumulate and validate one image.
#[derive(Debug)]
pub struct ImageCapture {
    config: CaptureConfig,
    buffer: Vec<u8>,
    chunks_read: usize,
    signature_at: Option<usize>,
    /// Where the next end-marker search starts.
    scan_from: usize,
    phase: CapturePhase,
}

impl ImageCapture {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            chunks_read: 0,
            signature_at: None,
            scan_from: 0,
            phase: CapturePhase::Accumulating,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase
    }

    pub fn chunks_read(&self) -> usize {
        self.chunks_read
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Feed one read result. Returns the phase after the chunk was applied.
    pub fn push_chunk(&mut self, chunk: ChunkRead) -> CapturePhase {
        if self.phase != CapturePhase::Accumulating {
            return self.phase;
        }
        self.chunks_read += 1;

        let data = match chunk {
            ChunkRead::Data(data) if !data.is_empty() => data,
            ChunkRead::Data(_) | ChunkRead::EndOfStream => {
                log::debug!("Read complete (stream quiet after {} bytes)", self.buffer.len());
                self.phase = CapturePhase::Validating(StopReason::EndOfStream);
                return self.phase;
            }
        };
        let signature = self.config.format.signature;
        let overlap_start = self
            .buffer
            .len()
            .saturating_sub(signature.len().saturating_sub(1));
        self.buffer.extend_from_slice(&data);

        if self.signature_at.is_none() {
            self.signature_at =
                find(&self.buffer[overlap_start..], signature).map(|at| at + overlap_start);
            if let Some(at) = self.signature_at {
                log::debug!("{} signature at offset {}", self.config.format.name, at);
                self.scan_from = at;
            }
        }

        if self.signature_at.is_some() {
            let marker = self.config.format.end_marker;
            if find(&self.buffer[self.scan_from..], marker).is_some() {
                log::debug!(
                    "Complete {} detected: {} bytes",
                    self.config.format.name,
                    self.buffer.len()
                );
                self.phase = CapturePhase::Validating(StopReason::MarkerFound);
                return self.phase;
            }
            // A marker may straddle this chunk and the next one.
            self.scan_from = self
                .buffer
                .len()
                .saturating_sub(marker.len().saturating_sub(1))
                .max(self.scan_from);
        }

        if self.chunks_read % 20 == 0 {
            log::debug!("Read {} bytes...", self.buffer.len());
        }
        self.phase
    }

    /// Pull chunks from `source` until accumulation stops, then validate.
    pub fn run<S: ChunkSource + ?Sized>(
        mut self,
        source: &mut S,
    ) -> Result<CapturedImage, CaptureError> {
        #[cfg(feature = "cpu-profiling")]
        let _zone = crate::profiling::zone("image_capture");
        let _span = tracing::debug_span!("accumulate", format = self.config.format.name).entered();

        while self.phase == CapturePhase::Accumulating {
            if self.chunks_read >= self.config.max_chunks {
                return Err(CaptureError::SizeExceeded {
                    chunks: self.chunks_read,
                    bytes: self.buffer.len(),
                });
            }
            let chunk = source.next_chunk(self.config.chunk_size)?;
            self.push_chunk(chunk);
        }
        self.finish()
    }

    /// Validate whatever has been accumulated so far.
    pub fn finish(self) -> Result<CapturedImage, CaptureError> {
        let len = self.buffer.len();
        if len < self.config.min_size {
            return Err(CaptureError::PayloadTooSmall {
                len,
                min: self.config.min_size,
            });
        }

        let chunks_read = self.chunks_read;
        match self.signature_at {
            Some(at) => {
                let mut data = self.buffer;
                data.drain(..at);
                log::debug!("Extracted {} image: {} bytes", self.config.format.name, data.len());
                Ok(CapturedImage {
                    data,
                    signature_found: true,
                    chunks_read,
                })
            }
            None => {
                log::warn!(
                    "No {} signature found, passing {} raw bytes through",
                    self.config.format.name,
                    len
                );
                Ok(CapturedImage {
                    data: self.buffer,
                    signature_found: false,
                    chunks_read,
                })
            }
        }
    }
}

/// Run the whole capture protocol: request, settle, accumulate, validate.
///
/// The connection is switched to binary mode for the duration and restored
/// afterwards, also when the capture fails. The request is sent once; a
/// half-delivered image cannot be resumed by asking again.
pub fn capture_image<C: Connection>(
    transport: &mut ScpiTransport<C>,
    command: &str,
    timeout: Duration,
    config: CaptureConfig,
) -> Result<CapturedImage, CaptureError> {
    let terminator = transport.connection().settings().write_terminator;
    let mut conn = transport.connection_mut().binary_mode(timeout)?;

    log::debug!("-> {}", command);
    let mut request = command.as_bytes().to_vec();
    request.extend(terminator);
    conn.write_all(&request)?;

    if !config.settle_delay.is_zero() {
        thread::sleep(config.settle_delay);
    }

    ImageCapture::new(config).run(&mut *conn)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_connection::MockConnection;
    use crate::retry::RetryPolicy;
    use std::collections::VecDeque;

    const SIG: &[u8] = b"\x89PNG";
    const END: &[u8] = b"IEND\xAE\x42\x60\x82";

    struct ScriptedChunks {
        chunks: VecDeque<ChunkRead>,
        reads: usize,
    }

    impl ScriptedChunks {
        fn new(chunks: Vec<ChunkRead>) -> Self {
            Self {
                chunks: chunks.into(),
                reads: 0,
            }
        }
    }

    impl ChunkSource for ScriptedChunks {
        fn next_chunk(&mut self, _max_len: usize) -> Result<ChunkRead, TransportError> {
            self.reads += 1;
            Ok(self.chunks.pop_front().unwrap_or(ChunkRead::EndOfStream))
        }
    }

    fn config(min_size: usize) -> CaptureConfig {
        CaptureConfig {
            min_size,
            settle_delay: Duration::ZERO,
            ..CaptureConfig::default()
        }
    }

    fn data(parts: &[&[u8]]) -> ChunkRead {
        ChunkRead::Data(parts.concat())
    }

    #[test]
    fn test_noise_then_signature_then_marker() {
        let body = vec![0x42; 600];
        let mut source = ScriptedChunks::new(vec![
            data(&[b"#9000012345"]),
            data(&[b"xx", SIG, &body[..300]]),
            data(&[&body[300..], END]),
            data(&[b"never read"]),
        ]);

        let image = ImageCapture::new(config(100)).run(&mut source).unwrap();
        assert!(image.signature_found);
        assert!(image.data.starts_with(SIG));
        assert!(image.data.ends_with(END));
        assert_eq!(image.data.len(), SIG.len() + body.len() + END.len());
        assert_eq!(image.chunks_read, 3);
        assert_eq!(source.reads, 3);
    }

    #[test]
    fn test_marker_split_across_chunks() {
        let mut source = ScriptedChunks::new(vec![
            data(&[SIG, &[1; 200], &END[..3]]),
            data(&[&END[3..]]),
            data(&[b"trailing"]),
        ]);

        let image = ImageCapture::new(config(10)).run(&mut source).unwrap();
        assert!(image.data.ends_with(END));
        assert_eq!(source.reads, 2);
    }

    #[test]
    fn test_marker_before_signature_is_ignored() {
        let mut capture = ImageCapture::new(config(1));
        assert_eq!(
            capture.push_chunk(data(&[END, b"noise"])),
            CapturePhase::Accumulating
        );
        assert_eq!(
            capture.push_chunk(data(&[SIG, b"body"])),
            CapturePhase::Accumulating
        );
        assert_eq!(
            capture.push_chunk(data(&[END])),
            CapturePhase::Validating(StopReason::MarkerFound)
        );
        let image = capture.finish().unwrap();
        assert_eq!(image.data, [SIG, b"body", END].concat());
    }

    #[test]
    fn test_size_exceeded_after_exact_bound() {
        let chunks = (0..50).map(|_| ChunkRead::Data(vec![0; 16])).collect();
        let mut source = ScriptedChunks::new(chunks);
        let bounded = CaptureConfig {
            max_chunks: 7,
            ..config(1)
        };

        let err = ImageCapture::new(bounded).run(&mut source).unwrap_err();
        assert!(matches!(
            err,
            CaptureError::SizeExceeded {
                chunks: 7,
                bytes: 112
            }
        ));
        assert_eq!(source.reads, 7);
    }

    #[test]
    fn test_end_of_stream_with_marker_present_completes() {
        let mut capture = ImageCapture::new(config(20));
        capture.push_chunk(data(&[SIG, &[7; 50]]));
        assert_eq!(
            capture.push_chunk(data(&[END])),
            CapturePhase::Validating(StopReason::MarkerFound)
        );
        assert!(capture.finish().unwrap().signature_found);

        let mut source = ScriptedChunks::new(vec![
            data(&[SIG, &[7; 50], END, &[0; 2]]),
            ChunkRead::EndOfStream,
        ]);
        let image = ImageCapture::new(config(20)).run(&mut source).unwrap();
        assert!(image.signature_found);
        assert_eq!(source.reads, 1);
    }

    #[test]
    fn test_end_of_stream_without_marker_completes() {
        let mut source = ScriptedChunks::new(vec![
            data(&[b"junk", SIG, &[7; 2000]]),
            ChunkRead::EndOfStream,
        ]);
        let image = ImageCapture::new(config(1000)).run(&mut source).unwrap();
        assert!(image.data.starts_with(SIG));
        assert_eq!(image.data.len(), SIG.len() + 2000);
        assert_eq!(source.reads, 2);
    }

    #[test]
    fn test_empty_chunk_counts_as_end_of_stream() {
        let mut capture = ImageCapture::new(config(1));
        capture.push_chunk(data(&[SIG, b"partial"]));
        assert_eq!(
            capture.push_chunk(ChunkRead::Data(Vec::new())),
            CapturePhase::Validating(StopReason::EndOfStream)
        );
    }

    #[test]
    fn test_short_capture_fails_size_check() {
        let mut source = ScriptedChunks::new(vec![data(&[SIG, b"tiny"]), ChunkRead::EndOfStream]);
        let err = ImageCapture::new(config(1000)).run(&mut source).unwrap_err();
        assert!(matches!(err, CaptureError::PayloadTooSmall { len: 8, min: 1000 }));
    }

    #[test]
    fn test_no_signature_passes_raw_buffer() {
        let raw = vec![0x55; 1500];
        let mut source = ScriptedChunks::new(vec![ChunkRead::Data(raw.clone())]);

        let image = ImageCapture::new(config(1000)).run(&mut source).unwrap();
        assert!(!image.signature_found);
        assert_eq!(image.data, raw);
        assert!(matches!(
            image.require_signature(),
            Err(CaptureError::SignatureNotFound { len: 1500 })
        ));
    }

    #[test]
    fn test_capture_image_restores_settings_and_sends_once() {
        let mut conn = MockConnection::new();
        conn.push_data(&[b"#9000001000", SIG, &[3; 1200], END, b"\n"].concat());
        let mut transport = ScpiTransport::with_retry(conn, RetryPolicy::new(3, Duration::ZERO));
        let before = transport.connection().settings();

        let image =
            capture_image(&mut transport, "DISP:DATA?", Duration::from_secs(17), config(1000))
                .unwrap();

        assert!(image.data.starts_with(SIG));
        // Bytes after the end marker are kept.
        assert!(image.data.ends_with(&[END, b"\n"].concat()));
        let conn = transport.connection();
        assert_eq!(conn.written_commands(), vec!["DISP:DATA?"]);
        // 1224 bytes in 1024-byte chunks, stopped by the end marker.
        assert_eq!(conn.reads_performed(), 2);
        assert_eq!(image.chunks_read, 2);
        assert_eq!(conn.settings(), before);
        assert_eq!(conn.applied_settings()[0].read_terminator, None);
        assert_eq!(conn.applied_settings()[0].timeout, Duration::from_secs(17));
    }

    #[test]
    fn test_capture_image_restores_settings_on_failure() {
        let mut conn = MockConnection::new();
        conn.push_data(&[SIG, b"abc"].concat());
        conn.push_error(std::io::ErrorKind::ConnectionReset);
        let mut transport = ScpiTransport::new(conn);
        let before = transport.connection().settings();

        let err = capture_image(&mut transport, "DISP:DATA?", Duration::from_secs(1), config(10))
            .unwrap_err();

        assert!(matches!(err, CaptureError::Transport(TransportError::Io(_))));
        assert_eq!(transport.connection().settings(), before);
        assert_eq!(transport.connection().written_commands().len(), 1);
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abcdef", b"cd"), Some(2));
        assert_eq!(find(b"abc", b"abcd"), None);
        assert_eq!(find(b"abc", b""), Some(0));
    }
}
