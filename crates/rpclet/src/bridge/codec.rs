//! Newline-delimited JSON framing for the worker's stdio.
//!
//! One JSON-RPC message per line. The decoder keeps partial lines buffered
//! across reads and only yields complete, newline-terminated units, so a
//! message split over several pipe reads is reassembled and several messages
//! in one read come out one at a time. Lines that do not parse are logged and
//! skipped; they never end the stream.

use std::io;

use serde::Serialize;
use tokio_util::bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::Message;

/// Longest line accepted from the worker before it is dropped.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Bytes of a rejected line included in the warning.
const PREVIEW_LEN: usize = 256;

pub struct JsonRpcCodec {
    /// Where to resume scanning for `\n` in the buffer.
    next_index: usize,
    max_line_length: usize,
    /// Dropping the rest of an oversized line.
    discarding: bool,
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            next_index: 0,
            max_line_length,
            discarding: false,
        }
    }
}

fn parse_line(line: BytesMut) -> Option<Message> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    let line = line.freeze();
    match Message::parse(line.clone()) {
        Ok(message) => Some(message),
        Err(e) => {
            let preview = &line[..line.len().min(PREVIEW_LEN)];
            tracing::warn!(
                error = %e,
                line = %String::from_utf8_lossy(preview),
                "Discarding malformed worker output"
            );
            None
        }
    }
}

impl Decoder for JsonRpcCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            let Some(index) = newline else {
                if self.discarding || src.len() > self.max_line_length {
                    if !self.discarding {
                        tracing::warn!(
                            max_line_length = self.max_line_length,
                            "Worker output line exceeds limit, discarding"
                        );
                    }
                    self.discarding = true;
                    src.clear();
                    self.next_index = 0;
                } else {
                    self.next_index = src.len();
                }
                return Ok(None);
            };

            self.next_index = 0;
            let mut line = src.split_to(index + 1);

            if std::mem::take(&mut self.discarding) {
                continue;
            }

            line.truncate(index);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }

            if line.len() > self.max_line_length {
                tracing::warn!(
                    line_length = line.len(),
                    max_line_length = self.max_line_length,
                    "Worker output line exceeds limit, discarding"
                );
                continue;
            }

            if let Some(message) = parse_line(line) {
                return Ok(Some(message));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }

        if !self.discarding && !src.iter().all(u8::is_ascii_whitespace) {
            tracing::warn!(
                bytes = src.len(),
                "Discarding unterminated worker output at end of stream"
            );
        }
        src.clear();
        self.next_index = 0;
        self.discarding = false;
        Ok(None)
    }
}

impl<T: Serialize> Encoder<T> for JsonRpcCodec {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        dst.reserve(json.len() + 1);
        dst.extend_from_slice(&json);
        dst.put_u8(b'\n');
        Ok(())
    }
}
