use std::fmt;
use std::str::FromStr;

/// Number of comma-separated fields in a `WAV:PRE?` response.
pub const PREAMBLE_FIELDS: usize = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Malformed preamble: {reason}")]
    MalformedPreamble { reason: String },

    #[error("Unsupported sample encoding (format code {code})")]
    UnsupportedEncoding { code: i64 },
}

impl ParseError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedPreamble {
            reason: reason.into(),
        }
    }
}

/// Width of one sample code on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    /// `WAV:FORM BYTE`, signed 8-bit.
    Byte,
    /// `WAV:FORM WORD`, signed 16-bit little-endian.
    Word,
}

impl SampleEncoding {
    pub fn width(&self) -> usize {
        match self {
            SampleEncoding::Byte => 1,
            SampleEncoding::Word => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SampleEncoding::Byte => "BYTE",
            SampleEncoding::Word => "WORD",
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            SampleEncoding::Byte => 0,
            SampleEncoding::Word => 1,
        }
    }

    pub fn from_code(code: i64) -> Result<Self, ParseError> {
        match code {
            0 => Ok(SampleEncoding::Byte),
            1 => Ok(SampleEncoding::Word),
            // 2 is ASCII, which the sample decoder does not handle.
            _ => Err(ParseError::UnsupportedEncoding { code }),
        }
    }
}

/// Acquisition mode the block was recorded with. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionType {
    Normal,
    Peak,
    Average,
    HighResolution,
    Other(i64),
}

impl AcquisitionType {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => AcquisitionType::Normal,
            1 => AcquisitionType::Peak,
            2 => AcquisitionType::Average,
            3 => AcquisitionType::HighResolution,
            other => AcquisitionType::Other(other),
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            AcquisitionType::Normal => 0,
            AcquisitionType::Peak => 1,
            AcquisitionType::Average => 2,
            AcquisitionType::HighResolution => 3,
            AcquisitionType::Other(code) => *code,
        }
    }
}

/// How to turn a binary sample block into volts and seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformDescriptor {
    pub sample_encoding: SampleEncoding,
    pub acquisition_type: AcquisitionType,
    pub point_count: usize,
    /// Always 1 on this family.
    pub count: i64,
    /// Seconds between samples. May be negative.
    pub x_increment: f64,
    /// Time of the first sample in seconds.
    pub x_origin: f64,
    /// Always 0 on this family.
    pub x_reference: i64,
    /// Volts per code step. May be negative.
    pub y_increment: f64,
    pub y_origin: f64,
    /// Code that maps to `y_origin`.
    pub y_reference: i64,
}

impl WaveformDescriptor {
    /// Parse a `WAV:PRE?` response.
    pub fn parse(preamble: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = preamble.trim().split(',').map(str::trim).collect();
        if fields.len() < PREAMBLE_FIELDS {
            return Err(ParseError::malformed(format!(
                "expected {} fields, got {}",
                PREAMBLE_FIELDS,
                fields.len()
            )));
        }

        let format = parse_int(fields[0], "format")?;
        let acquisition = parse_int(fields[1], "type")?;
        let points = parse_int(fields[2], "points")?;
        let count = parse_int(fields[3], "count")?;
        let x_increment = parse_float(fields[4], "x_increment")?;
        let x_origin = parse_float(fields[5], "x_origin")?;
        let x_reference = parse_int(fields[6], "x_reference")?;
        let y_increment = parse_float(fields[7], "y_increment")?;
        let y_origin = parse_float(fields[8], "y_origin")?;
        let y_reference = parse_int(fields[9], "y_reference")?;

        let point_count = usize::try_from(points)
            .map_err(|_| ParseError::malformed(format!("negative point count {}", points)))?;

        Ok(Self {
            sample_encoding: SampleEncoding::from_code(format)?,
            acquisition_type: AcquisitionType::from_code(acquisition),
            point_count,
            count,
            x_increment,
            x_origin,
            x_reference,
            y_increment,
            y_origin,
            y_reference,
        })
    }

    /// Serialize back into the 10-field wire form.
    pub fn to_preamble(&self) -> String {
        self.to_string()
    }

    /// Number of bytes the matching sample block must have.
    pub fn expected_byte_len(&self) -> Option<usize> {
        self.point_count.checked_mul(self.sample_encoding.width())
    }
}

impl FromStr for WaveformDescriptor {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WaveformDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `{}` on f64 prints the shortest string that parses back exactly.
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{}",
            self.sample_encoding.code(),
            self.acquisition_type.code(),
            self.point_count,
            self.count,
            self.x_increment,
            self.x_origin,
            self.x_reference,
            self.y_increment,
            self.y_origin,
            self.y_reference
        )
    }
}

fn parse_float(field: &str, name: &str) -> Result<f64, ParseError> {
    field
        .parse::<f64>()
        .map_err(|_| ParseError::malformed(format!("{} is not a number: '{}'", name, field)))
}

/// Integer fields show up as `128` or `1.280000e+02` depending on firmware.
fn parse_int(field: &str, name: &str) -> Result<i64, ParseError> {
    if let Ok(value) = field.parse::<i64>() {
        return Ok(value);
    }
    let value = parse_float(field, name)?;
    let in_range = value >= i64::MIN as f64 && value < i64::MAX as f64;
    if value.fract() == 0.0 && in_range {
        Ok(value as i64)
    } else {
        Err(ParseError::malformed(format!(
            "{} is not an integer: '{}'",
            name, field
        )))
    }
}
