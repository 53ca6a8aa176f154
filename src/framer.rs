//! Line framing of the raw serial byte stream.
//!
//! The sensor terminates every message with a line feed, optionally preceded
//! by a carriage return. [`LineFramer`] reassembles complete lines from
//! arbitrarily fragmented reads and knows nothing about message semantics.

use core::{mem, slice};
use log::trace;

/// Maximum number of characters buffered before a line terminator is seen.
pub const MAX_LINE_LENGTH: usize = 1024;

/// Item produced while framing a chunk of bytes.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Frame {
    /// A complete line, without its terminator.
    Line(String),
    /// A byte outside the ASCII range was dropped.
    InvalidByte(u8),
    /// The partial line exceeded [`MAX_LINE_LENGTH`] and was dropped.
    Overflow,
}

/// Incremental line framer.
///
/// Bytes are pushed as they are read from the port. An empty chunk is valid
/// and leaves the framer untouched, so non-blocking reads can be fed directly.
#[derive(Default, Debug)]
pub struct LineFramer {
    partial: String,
}

impl LineFramer {
    /// Constructs a new framer with an empty partial line.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of bytes into the framer.
    ///
    /// Returns an iterator over the frames completed by this chunk.
    /// The iterator must be drained for all bytes of the chunk to be consumed.
    pub fn push<'a>(&'a mut self, bytes: &'a [u8]) -> Frames<'a> {
        Frames {
            framer: self,
            bytes: bytes.iter(),
        }
    }

    /// Returns the characters received since the last line terminator.
    #[must_use]
    pub fn pending(&self) -> &str {
        &self.partial
    }

    /// Discards the partial line.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

/// Iterator over the frames completed by a chunk of bytes.
///
/// Created by [`LineFramer::push`].
#[derive(Debug)]
pub struct Frames<'a> {
    framer: &'a mut LineFramer,
    bytes: slice::Iter<'a, u8>,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        for &byte in self.bytes.by_ref() {
            match byte {
                b'\n' => {
                    let line = mem::take(&mut self.framer.partial);

                    trace!("Framed line: {line:?}");

                    return Some(Frame::Line(line));
                }
                b'\r' => {}
                _ if !byte.is_ascii() => return Some(Frame::InvalidByte(byte)),
                _ if self.framer.partial.len() >= MAX_LINE_LENGTH => {
                    self.framer.partial.clear();

                    return Some(Frame::Overflow);
                }
                _ => self.framer.partial.push(char::from(byte)),
            }
        }

        None
    }
}
