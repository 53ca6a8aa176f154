use clap::{Parser, ValueEnum};
use quspin::{Config, DEFAULT_QUEUE_LENGTH, Sensor};
use std::{
    error::Error,
    thread,
    time::{Duration, Instant},
};

#[derive(ValueEnum, Copy, Clone, Debug)]
enum Axis {
    Z,
    Y,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path (e.g. /dev/ttyUSB0)
    serial_port: String,

    /// Number of measurements kept in the history
    #[arg(short, long, default_value_t = DEFAULT_QUEUE_LENGTH)]
    queue_length: usize,

    /// Print interval in milliseconds
    #[arg(short, long, default_value_t = 100)]
    interval: u64,

    /// Measurement axis
    #[arg(short, long, value_enum, default_value_t = Axis::Z)]
    axis: Axis,

    /// Print the sensor status instead of field measurements
    #[arg(short, long)]
    status: bool,

    /// Stop after this many seconds instead of running indefinitely
    #[arg(short, long)]
    duration: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = Config::default()
        .with_queue_length(args.queue_length)
        .with_fault_callback(|fault| log::debug!("Sensor fault: {fault}"));
    let sensor = Sensor::open(&args.serial_port, config)?;

    match args.axis {
        Axis::Z => sensor.z_axis()?,
        Axis::Y => sensor.y_axis()?,
    }

    sensor.auto_start()?;
    sensor.start()?;

    if args.status {
        sensor.show_status()?;
    } else {
        sensor.show_measurement()?;
    }

    let interval = Duration::from_millis(args.interval);
    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    while deadline.is_none_or(|deadline| Instant::now() < deadline) {
        if args.status {
            println!("{}\n", sensor.snapshot());
        } else {
            match sensor.last_measurement() {
                Some(val) => println!("{val:.2} pT"),
                None => println!("-"),
            }
        }

        thread::sleep(interval);
    }

    sensor.stop();

    let diag = sensor.diagnostics();

    println!(
        "Messages: {}, unrecognized: {}, framing faults: {}, parse faults: {}, I/O faults: {}",
        diag.messages, diag.unrecognized, diag.framing_faults, diag.parse_faults, diag.io_faults
    );

    Ok(())
}
