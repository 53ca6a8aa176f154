//! Classification of framed sensor messages.
//!
//! Each line received from the sensor is parsed into a [`Message`] using
//! [`str::parse`]. The leading character selects the message kind:
//!
//! | Tag | Payload | Message |
//! |-----|---------|---------|
//! | `~` | register code (2 digits) and value | [`Message::Register`] |
//! | `\|` | flag digit and `0`/`1` | [`Message::Flag`] |
//! | `!` | raw 24-bit sample | [`Message::Measurement`] |
//!
//! Lines without a known tag are [`Message::Diagnostic`].

use crate::state::StatusFlags;
use core::{
    fmt::{Display, Formatter},
    num::ParseIntError,
    str::FromStr,
};

/// Raw sample value corresponding to zero field.
///
/// The sensor outputs offset-binary samples with this midpoint (2^23).
pub const MEASUREMENT_OFFSET: u32 = 1 << 23;

/// Field strength of one raw sample count, in picotesla.
pub const PICOTESLA_PER_COUNT: f64 = 0.01;

/// Error type for message parsing.
///
/// Parse errors are never fatal: the offending line is discarded.
#[non_exhaustive]
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub enum ParseError {
    /// The line is empty.
    Empty,
    /// The line is shorter than its tag requires.
    Truncated,
    /// The numeric payload is malformed.
    InvalidNumber,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty message"),
            Self::Truncated => write!(f, "truncated message"),
            Self::InvalidNumber => write!(f, "invalid number"),
        }
    }
}

impl core::error::Error for ParseError {}

impl From<ParseIntError> for ParseError {
    fn from(_err: ParseIntError) -> Self {
        Self::InvalidNumber
    }
}

/// Status register reported with the `~` tag.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "title_case")]
pub enum Register {
    /// Cell temperature error (register `04`).
    CellTemperatureError,
    /// Cell temperature control voltage (register `05`).
    CellTemperatureControlVoltage,
}

/// Field measurement in raw offset-binary form.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
pub struct Measurement {
    raw: u32,
}

impl Measurement {
    /// Wraps a raw sample as reported by the sensor.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self { raw }
    }

    /// Returns the raw sample.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.raw
    }

    /// Returns the field strength in picotesla.
    #[must_use]
    pub fn picotesla(self) -> f64 {
        (f64::from(self.raw) - f64::from(MEASUREMENT_OFFSET)) * PICOTESLA_PER_COUNT
    }
}

/// Message sent by the sensor.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Message {
    /// Status register value.
    Register(Register, i32),
    /// Status flag change. The set contains exactly one flag.
    Flag(StatusFlags, bool),
    /// Field measurement.
    Measurement(Measurement),
    /// Free-form diagnostic output.
    Diagnostic(String),
    /// Tagged message with an unknown register code or flag digit.
    Ignored,
}

impl FromStr for Message {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let bytes = line.as_bytes();

        match bytes.first() {
            None => Err(ParseError::Empty),
            Some(b'~') => {
                let code = bytes.get(1..3).ok_or(ParseError::Truncated)?;
                let reg = match code {
                    b"04" => Register::CellTemperatureError,
                    b"05" => Register::CellTemperatureControlVoltage,
                    _ => return Ok(Self::Ignored),
                };

                Ok(Self::Register(reg, line[3..].trim().parse()?))
            }
            Some(b'|') => {
                let &[_, field, val, ..] = bytes else {
                    return Err(ParseError::Truncated);
                };
                let flag = match field {
                    b'1' => StatusFlags::LaserOn,
                    b'2' => StatusFlags::CellTemperatureLock,
                    b'3' => StatusFlags::LaserLock,
                    b'4' => StatusFlags::FieldZeroing,
                    b'5' => StatusFlags::MasterMode,
                    _ => return Ok(Self::Ignored),
                };

                Ok(Self::Flag(flag, val == b'1'))
            }
            Some(b'!') => {
                let payload = line[1..].trim();

                if payload.is_empty() {
                    return Err(ParseError::Truncated);
                }

                Ok(Self::Measurement(Measurement::from_raw(payload.parse()?)))
            }
            Some(_) => Ok(Self::Diagnostic(line.into())),
        }
    }
}
