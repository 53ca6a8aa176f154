//! Native serial port support for [`Sensor`].
//!
//! Uses the [`serial2`](https://crates.io/crates/serial2) crate.

use crate::{BAUD_RATE, Config, Error, Sensor};
use embedded_io::ErrorType;
use embedded_io_adapters::std::FromStd;
use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};
use std::time::Duration;

/// Timeout of a single read, bounding the reader's reaction time to a stop request.
pub const READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Serial port type implementing [`Read`](embedded_io::Read)
/// and [`Write`](embedded_io::Write).
pub type Port = FromStd<SerialPort>;

/// Port-specific error type to be used as `E` for the generic [`Error<E>`] type.
pub type PortError = <Port as ErrorType>::Error;

/// Opens a native serial port at the given path.
///
/// Returns the read and write halves of the connection, which can be
/// passed to [`Sensor::new`]. Both halves refer to the same device.
pub fn open(path: &str) -> Result<(Port, Port), Error<PortError>> {
    let mut port = SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(BAUD_RATE)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_parity(Parity::None);
        settings.set_stop_bits(StopBits::One);
        settings.set_flow_control(FlowControl::None);

        Ok(settings)
    })?;

    port.set_read_timeout(READ_TIMEOUT)?;
    port.discard_buffers()?;

    let writer = port.try_clone()?;

    Ok((FromStd::new(port), FromStd::new(writer)))
}

impl Sensor<Port, Port> {
    /// Opens the sensor connected to the serial port at the given path.
    ///
    /// The reader is not started yet, see [`Sensor::start`].
    pub fn open(path: &str, config: Config) -> Result<Self, Error<PortError>> {
        let (reader, writer) = open(path)?;

        Self::new(reader, writer, config)
    }
}
