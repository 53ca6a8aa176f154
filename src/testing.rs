//! In-memory serial port used by tests.

use embedded_io::{ErrorType, Read, Write};
use log::LevelFilter;
use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

// Bytes returned by a single read at most, to exercise fragmented lines
const READ_CHUNK_SIZE: usize = 5;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_logger() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::max())
        .is_test(true)
        .try_init();
}

/// Polls `cond` until it holds, panicking after a generous timeout.
pub fn wait_until(mut cond: impl FnMut() -> bool) {
    let start = Instant::now();

    while !cond() {
        assert!(start.elapsed() < WAIT_TIMEOUT, "condition not met in time");
        thread::sleep(Duration::from_millis(1));
    }
}

#[derive(Default, Debug)]
struct Shared {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    errors: VecDeque<io::ErrorKind>,
}

/// Simulated serial channel.
///
/// All clones share the same buffers, so one clone can serve as the read
/// half, one as the write half and one stays with the test to feed bytes
/// and inspect writes. Reads never block: an empty queue yields `Ok(0)`.
#[derive(Clone, Default, Debug)]
pub struct MockPort(Arc<Mutex<Shared>>);

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues bytes to be returned by subsequent reads.
    pub fn feed(&self, bytes: &[u8]) {
        self.lock().rx.extend(bytes);
    }

    /// Makes the next read fail with the given error.
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        self.lock().errors.push_back(kind);
    }

    /// Returns whether all fed bytes and errors have been consumed.
    pub fn is_drained(&self) -> bool {
        let shared = self.lock();

        shared.rx.is_empty() && shared.errors.is_empty()
    }

    /// Returns all bytes written so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().tx.clone()
    }

    /// Returns the number of other clones still alive.
    pub fn connections(&self) -> usize {
        Arc::strong_count(&self.0) - 1
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.0.lock().unwrap()
    }
}

impl ErrorType for MockPort {
    type Error = io::Error;
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let mut shared = self.lock();

        if let Some(kind) = shared.errors.pop_front() {
            return Err(kind.into());
        }

        let len = buf.len().min(shared.rx.len()).min(READ_CHUNK_SIZE);

        for (dst, src) in buf.iter_mut().zip(shared.rx.drain(..len)) {
            *dst = src;
        }

        Ok(len)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.lock().tx.extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
