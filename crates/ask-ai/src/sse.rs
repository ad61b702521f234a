//! Line-oriented event stream decoding.
//!
//! Body chunks arrive split at arbitrary byte offsets, including inside a
//! multi-byte UTF-8 sequence. [`LineDecoder`] buffers bytes and only decodes
//! complete lines; [`classify`] then sorts each line into data, end marker,
//! or noise.

use std::pin::Pin;

use async_stream::stream;
use futures::StreamExt;
use tokio_stream::Stream;

use crate::{error::Result, http::ByteStream};

/// A stream of decoded lines
pub type LineStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Reassembles lines from byte chunks
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed, without terminators
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + pos;
            lines.push(decode_line(&self.buffer[start..end]));
            start = end + 1;
        }
        self.buffer.drain(..start);
        lines
    }

    /// Flush an unterminated final line at stream closure
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Turn a byte stream into a line stream
pub fn lines(mut bytes: ByteStream) -> LineStream {
    Box::pin(stream! {
        let mut decoder = LineDecoder::new();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for line in decoder.push(&chunk) {
                        yield Ok(line);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        if let Some(line) = decoder.finish() {
            yield Ok(line);
        }
    })
}

/// What a single stream line means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// A data payload
    Data(&'a str),
    /// The explicit end marker
    Done,
    /// Blank lines, comments, and non-data fields
    Ignore,
}

/// Classify one line of an event stream.
///
/// Lines without any SSE field prefix are treated as bare JSON data, which is
/// how some gateways frame newline-delimited responses.
pub fn classify(line: &str) -> SseLine<'_> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return SseLine::Ignore;
    }

    let data = if let Some(rest) = trimmed.strip_prefix("data:") {
        rest.trim_start()
    } else if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| trimmed.starts_with(field))
    {
        return SseLine::Ignore;
    } else {
        trimmed
    };

    match data {
        "" => SseLine::Ignore,
        "[DONE]" => SseLine::Done,
        data => SseLine::Data(data),
    }
}
