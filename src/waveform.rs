use polars::prelude::*;

use crate::preamble::{SampleEncoding, WaveformDescriptor};

pub const TIME_COLUMN_NAME: &str = "time";
pub const VOLTAGE_COLUMN_NAME: &str = "voltage";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Sample block is {actual} bytes but the preamble promises {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Decoded samples: `time[i]` belongs to `voltage[i]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub time: Vec<f64>,
    pub voltage: Vec<f64>,
}

impl Waveform {
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }

    /// Two-column frame (`time`, `voltage`) for export and analysis.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        DataFrame::new(vec![
            Series::new(TIME_COLUMN_NAME.into(), &self.time).into(),
            Series::new(VOLTAGE_COLUMN_NAME.into(), &self.voltage).into(),
        ])
    }
}

/// Convert a raw sample block into volts.
pub fn decode_samples(
    descriptor: &WaveformDescriptor,
    raw: &[u8],
) -> Result<Vec<f64>, DecodeError> {
    #[cfg(feature = "cpu-profiling")]
    let _zone = crate::profiling::zone("decode_samples");

    let width = descriptor.sample_encoding.width();
    let expected = descriptor
        .expected_byte_len()
        .ok_or(DecodeError::LengthMismatch {
            expected: usize::MAX,
            actual: raw.len(),
        })?;
    if raw.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: raw.len(),
        });
    }

    let y_reference = descriptor.y_reference as f64;
    let to_volts =
        |code: f64| (code - y_reference) * descriptor.y_increment + descriptor.y_origin;

    let voltages = raw
        .chunks_exact(width)
        .map(|sample| {
            let code = match descriptor.sample_encoding {
                SampleEncoding::Byte => f64::from(i8::from_le_bytes([sample[0]])),
                SampleEncoding::Word => f64::from(i16::from_le_bytes([sample[0], sample[1]])),
            };
            to_volts(code)
        })
        .collect();

    Ok(voltages)
}

/// Timestamps for every sample the descriptor announces.
pub fn time_axis(descriptor: &WaveformDescriptor) -> Vec<f64> {
    (0..descriptor.point_count)
        .map(|i| i as f64 * descriptor.x_increment + descriptor.x_origin)
        .collect()
}

/// Decode voltages and build the matching time axis.
pub fn decode_waveform(
    descriptor: &WaveformDescriptor,
    raw: &[u8],
) -> Result<Waveform, DecodeError> {
    let voltage = decode_samples(descriptor, raw)?;
    let time = time_axis(descriptor);
    log::debug!("Decoded {} samples", voltage.len());
    Ok(Waveform { time, voltage })
}
