//! Byte-to-frame parsing pipeline.
//!
//! A [`FrameParser`] is fed one inbound chunk at a time and calls back once
//! per complete frame.  `Raw` passes every chunk through untouched;
//! `Readline` splits the cumulative stream on a delimiter, so a delimiter
//! that straddles two chunks is still found.

use crate::error::ChannelError;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DELIMITER: &str = "\r\n";

fn default_delimiter() -> String {
    DEFAULT_DELIMITER.to_string()
}

/// Parser selection, as it appears in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParserConfig {
    /// One chunk in, one frame out.
    Raw,
    /// Delimiter-separated lines; the delimiter is not part of the frame.
    Readline {
        #[serde(default = "default_delimiter")]
        delimiter: String,
    },
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig::Raw
    }
}

impl ParserConfig {
    /// Line framing on `\r\n`.
    pub fn readline() -> Self {
        ParserConfig::Readline {
            delimiter: default_delimiter(),
        }
    }

    pub fn readline_with(delimiter: impl Into<String>) -> Self {
        ParserConfig::Readline {
            delimiter: delimiter.into(),
        }
    }

    /// Delimiter bytes for line framing, `None` for raw.
    pub fn delimiter(&self) -> Option<&[u8]> {
        match self {
            ParserConfig::Raw => None,
            ParserConfig::Readline { delimiter } => Some(delimiter.as_bytes()),
        }
    }
}

/// Stateful chunk-to-frame transformation owned by a single channel.
#[derive(Debug)]
pub enum FrameParser {
    Raw,
    Readline(LineParser),
}

impl FrameParser {
    pub fn new(config: &ParserConfig) -> Result<Self, ChannelError> {
        match config {
            ParserConfig::Raw => Ok(FrameParser::Raw),
            ParserConfig::Readline { delimiter } => {
                LineParser::new(delimiter.as_bytes()).map(FrameParser::Readline)
            }
        }
    }

    /// Ingest one chunk, invoking `on_frame` for each complete frame.
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_frame: F)
    where
        F: FnMut(Bytes),
    {
        match self {
            FrameParser::Raw => on_frame(Bytes::copy_from_slice(chunk)),
            FrameParser::Readline(lines) => lines.feed(chunk, on_frame),
        }
    }

    /// Convenience wrapper collecting the frames of one chunk.
    pub fn feed_collect(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        let mut frames = Vec::new();
        self.feed(chunk, |frame| frames.push(frame));
        frames
    }

    /// Bytes held back waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        match self {
            FrameParser::Raw => 0,
            FrameParser::Readline(lines) => lines.buffered(),
        }
    }
}

/// Delimiter framer with an unbounded accumulator.
#[derive(Debug)]
pub struct LineParser {
    buffer: BytesMut,
    delimiter: Vec<u8>,
    /// Offset up to which the buffer is known to hold no delimiter.
    scanned: usize,
}

impl LineParser {
    pub fn new(delimiter: &[u8]) -> Result<Self, ChannelError> {
        if delimiter.is_empty() {
            return Err(ChannelError::invalid_config("readline delimiter must not be empty"));
        }
        Ok(Self {
            buffer: BytesMut::with_capacity(256),
            delimiter: delimiter.to_vec(),
            scanned: 0,
        })
    }

    pub fn delimiter(&self) -> &[u8] {
        &self.delimiter
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn feed<F>(&mut self, chunk: &[u8], mut on_frame: F)
    where
        F: FnMut(Bytes),
    {
        if chunk.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(idx) = self.find_delimiter() {
            let frame = self.buffer.split_to(idx).freeze();
            self.buffer.advance(self.delimiter.len());
            self.scanned = 0;
            on_frame(frame);
        }

        // A delimiter may still start in the last len-1 bytes.
        self.scanned = self
            .buffer
            .len()
            .saturating_sub(self.delimiter.len() - 1);
    }

    fn find_delimiter(&self) -> Option<usize> {
        let d = self.delimiter.len();
        if self.buffer.len() < d {
            return None;
        }
        self.buffer[self.scanned..]
            .windows(d)
            .position(|w| w == self.delimiter.as_slice())
            .map(|pos| pos + self.scanned)
    }
}
