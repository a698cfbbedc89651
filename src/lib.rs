//! # DHOScope RS
//!
//! A Rust library for pulling waveforms and screen captures from Rigol DHO900
//! series oscilloscopes over SCPI.
//!
//! The instrument is reached over a serial port or its raw SCPI socket
//! (TCP port 5555). Everything above the byte stream is transport agnostic.
//!
//! ## Features
//!
//! - **Connections**: `serialport` and `std::net` back the same [`Connection`] trait
//! - **SCPI transport**: terminator handling, IEEE 488.2 block framing and bounded retries
//! - **Waveform decoding**: `WAV:PRE?` preamble parsing and sample-to-volt conversion
//! - **Screen capture**: chunked PNG capture for responses without a reliable length
//! - **DataFrame output**: waveforms convert into `polars` frames
//!
//! ## Examples
//!
//! ### Reading a Waveform
//!
//! ```rust,no_run
//! use dhoscope_rs::{Channel, ConnectionSettings, Oscilloscope, SampleEncoding, ScopeConfig, TcpConnection};
//!
//! let conn = TcpConnection::connect_host("192.168.1.50", ConnectionSettings::default())?;
//! let mut scope = Oscilloscope::open(conn, ScopeConfig::default())?;
//!
//! let capture = scope.fetch_waveform(Channel::new(1)?, SampleEncoding::Byte, None)?;
//! println!("Captured {} samples", capture.waveform.len());
//!
//! let df = capture.waveform.to_dataframe()?;
//! println!("{}", df.head(Some(5)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Taking a Screenshot
//!
//! ```rust,no_run
//! use dhoscope_rs::{ConnectionSettings, Oscilloscope, ScopeConfig, SerialConnection};
//!
//! let conn = SerialConnection::open("/dev/ttyUSB0", 115_200, ConnectionSettings::default())?;
//! let mut scope = Oscilloscope::open(conn, ScopeConfig::default())?;
//!
//! let png = scope.take_screenshot()?.require_signature()?;
//! std::fs::write("screen.png", png)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Decoding Offline
//!
//! ```rust
//! use dhoscope_rs::{decode_waveform, WaveformDescriptor};
//!
//! let descriptor: WaveformDescriptor = "0,0,4,1,1e-6,0,0,0.01,0,0".parse().unwrap();
//! let waveform = decode_waveform(&descriptor, &[10, 246, 0, 127]).unwrap();
//! assert_eq!(waveform.len(), 4);
//! ```

pub mod capture;
pub mod connection;
pub mod preamble;
pub mod retry;
pub mod scope;
pub mod transport;
pub mod waveform;

#[cfg(test)]
mod mock_connection;
#[cfg(feature = "cpu-profiling")]
mod profiling;

// Re-export the main types for convenience
pub use capture::{capture_image, CaptureConfig, CaptureError, CapturedImage, ImageCapture, ImageFormat};

pub use connection::{ChunkRead, Connection, ConnectionSettings, SerialConnection, TcpConnection};

pub use preamble::{AcquisitionType, ParseError, SampleEncoding, WaveformDescriptor};

pub use retry::RetryPolicy;

pub use scope::{Channel, Measurement, Oscilloscope, ScopeConfig, ScopeError, WaveformCapture};

pub use transport::{ScpiTransport, TransportError};

pub use waveform::{decode_waveform, DecodeError, Waveform};
