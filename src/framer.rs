//! Newline-delimited message framing.
//!
//! Raw chunks are appended in arrival order; every `\n` found closes one
//! message. A trailing partial line stays buffered until its terminator
//! arrives in a later chunk.

use crate::error::RelayError;
use bytes::{Buf, BytesMut};

/// Stateful per-session line decoder.
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line: usize,
    /// Bytes at the front of `buffer` already known to contain no `\n`.
    scanned: usize,
}

impl LineFramer {
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_line.min(4096)),
            max_line,
            scanned: 0,
        }
    }

    /// Append a raw chunk read from the connection.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet resolved into a message.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete message, if one is buffered.
    ///
    /// The terminator and one preceding `\r` are stripped before the length
    /// check, so the bound applies to the text alone. An error leaves
    /// the framer in an unspecified state; the owning session must be
    /// disconnected.
    pub fn next_message(&mut self) -> Option<Result<String, RelayError>> {
        let newline = match self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            Some(pos) => self.scanned + pos,
            None => {
                self.scanned = self.buffer.len();
                // A trailing `\r` may still turn out to be part of the terminator.
                let allowed = match self.buffer.last() {
                    Some(&b'\r') => self.max_line + 1,
                    _ => self.max_line,
                };
                if self.buffer.len() > allowed {
                    return Some(Err(RelayError::LineTooLong {
                        len: self.buffer.len(),
                        max: self.max_line,
                    }));
                }
                return None;
            }
        };

        let mut line = self.buffer.split_to(newline);
        self.buffer.advance(1);
        self.scanned = 0;

        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        if line.len() > self.max_line {
            return Some(Err(RelayError::LineTooLong {
                len: line.len(),
                max: self.max_line,
            }));
        }

        Some(
            std::str::from_utf8(&line)
                .map(str::to_owned)
                .map_err(RelayError::Decode),
        )
    }

    /// Lazily yield every complete message currently buffered.
    pub fn messages(&mut self) -> Messages<'_> {
        Messages { framer: self }
    }
}

/// Iterator returned by [`LineFramer::messages`].
pub struct Messages<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Messages<'_> {
    type Item = Result<String, RelayError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_message()
    }
}
