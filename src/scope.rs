use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::{capture_image, CaptureConfig, CaptureError, CapturedImage};
use crate::connection::Connection;
use crate::preamble::{ParseError, SampleEncoding, WaveformDescriptor};
use crate::retry::RetryPolicy;
use crate::transport::{ScpiTransport, TransportError};
use crate::waveform::{decode_waveform, DecodeError, Waveform};

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Preamble error: {0}")]
    Parse(#[from] ParseError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Channel {0} does not exist (expected 1-{max})", max = Channel::COUNT)]
    InvalidChannel(u8),

    #[error("Connected device is not a {expected}: {identity}")]
    UnexpectedIdentity { expected: String, identity: String },

    #[error("Measurement returned a non-numeric value: '{0}'")]
    InvalidMeasurement(String),

    #[error("Operation did not complete within {0:?}")]
    OperationTimeout(Duration),
}

impl ScopeError {
    /// Whether reissuing the same command may succeed.
    ///
    /// Parse and decode failures mean the payload itself is wrong; asking
    /// again returns the same broken data. The same holds for a malformed
    /// block header or undecodable text from the transport.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(e) | Self::Capture(CaptureError::Transport(e)) => e.is_transient(),
            Self::OperationTimeout(_) | Self::Capture(CaptureError::SizeExceeded { .. }) => true,
            Self::Capture(_) => false,
            Self::Parse(_)
            | Self::Decode(_)
            | Self::InvalidChannel(_)
            | Self::UnexpectedIdentity { .. }
            | Self::InvalidMeasurement(_) => false,
        }
    }
}

/// Analog input channel, 1 to 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel(u8);

impl Channel {
    pub const COUNT: u8 = 4;

    pub fn new(number: u8) -> Result<Self, ScopeError> {
        if (1..=Self::COUNT).contains(&number) {
            Ok(Self(number))
        } else {
            Err(ScopeError::InvalidChannel(number))
        }
    }

    pub fn number(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CHAN{}", self.0)
    }
}

/// On-device measurements whose scalar result we transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    VoltageMax,
    VoltageMin,
    VoltagePeakToPeak,
    VoltageAverage,
    VoltageRms,
    Frequency,
    Period,
    RiseTime,
    FallTime,
    PositivePulseWidth,
    PositiveDuty,
}

impl Measurement {
    /// Amplitude items read by [`Oscilloscope::voltage_measurements`].
    pub const VOLTAGE: [Measurement; 5] = [
        Measurement::VoltagePeakToPeak,
        Measurement::VoltageMax,
        Measurement::VoltageMin,
        Measurement::VoltageRms,
        Measurement::VoltageAverage,
    ];

    /// Timing items read by [`Oscilloscope::time_measurements`].
    pub const TIME: [Measurement; 5] = [
        Measurement::Frequency,
        Measurement::Period,
        Measurement::RiseTime,
        Measurement::FallTime,
        Measurement::PositivePulseWidth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::VoltageMax => "VMAX",
            Measurement::VoltageMin => "VMIN",
            Measurement::VoltagePeakToPeak => "VPP",
            Measurement::VoltageAverage => "VAVG",
            Measurement::VoltageRms => "VRMS",
            Measurement::Frequency => "FREQ",
            Measurement::Period => "PER",
            Measurement::RiseTime => "RTIM",
            Measurement::FallTime => "FTIM",
            Measurement::PositivePulseWidth => "PWID",
            Measurement::PositiveDuty => "PDUT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeConfig {
    pub retry: RetryPolicy,
    pub capture: CaptureConfig,
    /// Read timeout while a screen capture is streaming.
    pub screenshot_timeout: Duration,
    /// Pause after `*CLS` before a screen capture.
    pub clear_status_pause: Duration,
    /// Substring the `*IDN?` response must contain. `None` skips the check.
    pub expected_model: Option<String>,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            capture: CaptureConfig::default(),
            screenshot_timeout: Duration::from_secs(17),
            clear_status_pause: Duration::from_millis(500),
            expected_model: Some("DHO9".to_string()),
        }
    }
}

/// Everything one `WAV:DATA?` round trip produced.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformCapture {
    pub channel: Channel,
    pub descriptor: WaveformDescriptor,
    pub waveform: Waveform,
}

/// A session with one oscilloscope.
#[derive(Debug)]
pub struct Oscilloscope<C: Connection> {
    transport: ScpiTransport<C>,
    config: ScopeConfig,
    identity: String,
}

impl<C: Connection> Oscilloscope<C> {
    pub fn open(conn: C, config: ScopeConfig) -> Result<Self, ScopeError> {
        let mut transport = ScpiTransport::with_retry(conn, config.retry);

        let identity = transport.query_text("*IDN?")?;
        log::debug!("Connected to: {}", identity);
        if let Some(expected) = &config.expected_model {
            if !identity.contains(expected.as_str()) {
                return Err(ScopeError::UnexpectedIdentity {
                    expected: expected.clone(),
                    identity,
                });
            }
        }

        Ok(Self {
            transport,
            config,
            identity,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub fn transport_mut(&mut self) -> &mut ScpiTransport<C> {
        &mut self.transport
    }

    pub fn into_transport(self) -> ScpiTransport<C> {
        self.transport
    }

    pub fn clear_status(&mut self) -> Result<(), ScopeError> {
        self.transport.write("*CLS")?;
        Ok(())
    }

    pub fn operation_complete(&mut self) -> Result<bool, ScopeError> {
        Ok(self.transport.query_text("*OPC?")? == "1")
    }

    pub fn wait_for_operation_complete(&mut self, timeout: Duration) -> Result<(), ScopeError> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.operation_complete()? {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(100));
        }
        Err(ScopeError::OperationTimeout(timeout))
    }

    /// Read the waveform currently on screen for `channel`.
    ///
    /// `points` limits the transfer to the first `points` samples.
    #[tracing::instrument(skip(self, channel), fields(channel = channel.number()), level = "debug")]
    pub fn fetch_waveform(
        &mut self,
        channel: Channel,
        encoding: SampleEncoding,
        points: Option<u32>,
    ) -> Result<WaveformCapture, ScopeError> {
        self.transport.write(&format!("WAV:SOUR {}", channel))?;
        self.transport
            .write(&format!("WAV:FORM {}", encoding.as_str()))?;
        self.transport.write("WAV:MODE NORM")?;
        if let Some(points) = points {
            self.transport.write("WAV:STAR 1")?;
            self.transport.write(&format!("WAV:STOP {}", points))?;
        }

        let preamble = self.transport.query_text("WAV:PRE?")?;
        let descriptor = WaveformDescriptor::parse(&preamble)?;
        log::debug!(
            "{}: {} points, {:?}, {:?}",
            channel,
            descriptor.point_count,
            descriptor.sample_encoding,
            descriptor.acquisition_type
        );

        let raw = self.transport.query_binary("WAV:DATA?")?;
        let waveform = decode_waveform(&descriptor, &raw)?;

        Ok(WaveformCapture {
            channel,
            descriptor,
            waveform,
        })
    }

    /// Grab the screen as an image.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn take_screenshot(&mut self) -> Result<CapturedImage, ScopeError> {
        self.clear_status()?;
        if !self.config.clear_status_pause.is_zero() {
            thread::sleep(self.config.clear_status_pause);
        }
        let ready = self.operation_complete()?;
        log::debug!("Scope ready: {}", ready);

        let image = capture_image(
            &mut self.transport,
            "DISP:DATA?",
            self.config.screenshot_timeout,
            self.config.capture,
        )?;
        log::debug!("Screenshot captured: {} bytes", image.data.len());
        Ok(image)
    }

    /// Fetch the scalar result of an on-device measurement.
    pub fn measure(&mut self, item: Measurement, channel: Channel) -> Result<f64, ScopeError> {
        let response = self
            .transport
            .query_text(&format!("MEAS:ITEM? {},{}", item.as_str(), channel))?;
        response
            .parse::<f64>()
            .map_err(|_| ScopeError::InvalidMeasurement(response))
    }

    /// Read several measurements in one go. An item the scope cannot
    /// deliver comes back as `None` instead of failing the batch.
    pub fn measure_all(
        &mut self,
        items: &[Measurement],
        channel: Channel,
    ) -> Vec<(Measurement, Option<f64>)> {
        items
            .iter()
            .map(|&item| match self.measure(item, channel) {
                Ok(value) => (item, Some(value)),
                Err(e) => {
                    log::warn!("{} on {} unavailable: {}", item.as_str(), channel, e);
                    (item, None)
                }
            })
            .collect()
    }

    pub fn voltage_measurements(&mut self, channel: Channel) -> Vec<(Measurement, Option<f64>)> {
        self.measure_all(&Measurement::VOLTAGE, channel)
    }

    pub fn time_measurements(&mut self, channel: Channel) -> Vec<(Measurement, Option<f64>)> {
        self.measure_all(&Measurement::TIME, channel)
    }

    /// Pop the oldest entry of the error queue, e.g. `0,"No error"`.
    pub fn last_error(&mut self) -> Result<String, ScopeError> {
        Ok(self.transport.query_text("SYST:ERR?")?)
    }
}
