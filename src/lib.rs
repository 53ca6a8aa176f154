//! Drive QuSpin optically pumped magnetometers over their serial interface.
//!
//! # Overview
//!
//! The `quspin` crate implements the line-oriented serial protocol spoken by
//! QuSpin zero-field magnetometers. The sensor streams newline-terminated
//! ASCII messages (status registers, status flags and field measurements)
//! and accepts single-byte commands.
//!
//! A [`Sensor`] owns the serial connection and runs a background reader thread
//! that frames the incoming byte stream, parses every message and keeps the
//! latest values in a shared [`SensorState`](state::SensorState).
//! Commands can be issued at any time, including while the reader is running.
//!
//! Depending on your needs, you can:
//!
//! - Use [`Sensor`] to control a sensor and observe its state.
//! - Use the [`framer`] and [`message`] modules directly to decode recorded output.
//!
//! # Getting started
//!
//! The sensor exposes a USB serial port configured as follows:
//!
//! - **Baud rate:** 115200
//! - **Parity:** None
//! - **Data bits:** 8
//! - **Stop bits:** 1
//!
//! If you enable the `native-serial` feature, you can open a sensor
//! directly using [`Sensor::open`]:
//!
//! ```no_run
//! # #[cfg(not(feature = "native-serial"))]
//! # fn main() {}
//! # #[cfg(feature = "native-serial")]
//! # fn main() -> quspin::Result<(), quspin::serial::PortError> {
//! use quspin::{Config, Sensor};
//!
//! let sensor = Sensor::open("/dev/ttyUSB0", Config::default())?;
//!
//! sensor.z_axis()?;
//! sensor.auto_start()?;
//! sensor.start()?;
//! sensor.show_measurement()?;
//!
//! if let Some(field) = sensor.last_measurement() {
//!     println!("Field: {field:.2} pT");
//! }
//!
//! sensor.stop();
//! # Ok(())
//! # }
//! ```
//!
//! # Protocol details
//!
//! Every inbound message starts with a tag character:
//!
//! - `~` followed by a two-digit register code and a decimal value
//!   (e.g. cell temperature error).
//! - `|` followed by a flag digit and `0` or `1` (e.g. laser lock).
//! - `!` followed by a 24-bit offset-binary field sample in decimal.
//!
//! Any other line is a free-form diagnostic message.
//! The channel has no delivery guarantees, so malformed lines are
//! dropped and counted rather than reported as errors.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod framer;
pub mod message;
pub mod reader;
mod sensor;
pub mod state;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

#[cfg(test)]
mod testing;

pub use embedded_io;
pub use sensor::{Config, FaultCallback, Sensor};

use core::fmt::{Display, Formatter};
use embedded_io::{Read, Write};
use strum::{EnumIter, FromRepr};

/// Baud rate used by the sensor's serial interface.
pub const BAUD_RATE: u32 = 115_200;

/// Default number of measurements kept in the history.
pub const DEFAULT_QUEUE_LENGTH: usize = 100;

/// A specialized [`Result`] type for [`Sensor`] operations.
///
/// Uses [`Error<E>`] as the error variant, which can include port-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error type for [`Sensor`] operations.
///
/// The generic parameter `E` allows the error type to carry a port-specific error.
///
/// Faults encountered by the background reader are not reported through
/// this type; see [`reader::Fault`] instead.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum Error<E> {
    /// The provided argument is invalid.
    InvalidArgument,
    /// The reader was in an invalid state for the requested operation.
    InvalidState,
    /// The connection has been closed by [`Sensor::stop`].
    Closed,
    /// The background reader thread could not be spawned.
    Spawn(std::io::Error),
    /// A port-specific input/output error.
    Io(E),
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidState => write!(f, "invalid reader state"),
            Self::Closed => write!(f, "channel closed"),
            Self::Spawn(err) => write!(f, "failed to spawn reader thread: {err}"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Self {
        Self::Io(err)
    }
}

/// Command code accepted by the sensor.
///
/// Every command is a single ASCII byte. Commands are fire-and-forget:
/// the sensor does not acknowledge them, its new state only shows up
/// in subsequent messages.
#[derive(EnumIter, FromRepr, strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "title_case")]
#[repr(u8)]
pub enum Command {
    /// Runs the automatic start-up routine (laser and cell heating).
    AutoStart = b'>',
    /// Switches the output to status messages.
    StatusMode = b'8',
    /// Switches the output to field measurements.
    MeasurementMode = b'7',
    /// Enables field zeroing.
    FieldZeroOn = b'D',
    /// Disables field zeroing.
    FieldZeroOff = b'E',
    /// Runs the calibration routine.
    Calibrate = b'9',
    /// Measures the field along the z axis.
    ZAxis = b'C',
    /// Measures the field along the y axis.
    YAxis = b'F',
    /// Reboots the sensor's microcontroller.
    Reboot = b'e',
}

impl Command {
    /// Returns the byte sent over the wire for this command.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }
}
