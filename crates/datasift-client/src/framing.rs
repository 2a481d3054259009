//! Newline-delimited JSON framing
//!
//! The stream body is a sequence of JSON records, one per line. Chunk
//! boundaries are arbitrary, so partial lines are buffered until their
//! newline arrives.

use serde_json::Value;
use thiserror::Error;
use tracing::trace;

/// A line that could not be decoded as JSON
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("could not parse into JSON: {line} with error: {message}")]
pub struct DecodeError {
    /// The offending line, lossily decoded
    pub line: String,
    /// Parser diagnostic
    pub message: String,
}

/// Line decoder state
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Bytes after the last newline
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and extract every record completed by it
    ///
    /// Blank lines (keep-alives) produce nothing.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Value, DecodeError>> {
        self.buffer.extend_from_slice(chunk);

        let mut records = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
            if let Some(record) = decode_line(&line[..line.len() - 1]) {
                records.push(record);
            }
        }
        records
    }

    /// Flush the residual at the end of a response
    ///
    /// With a success status the residual is decoded as a final record.
    /// Otherwise it is the server's diagnostic text and comes back as an
    /// error carrying that text.
    pub fn finish(&mut self, status: Option<u16>) -> Option<Result<Value, DecodeError>> {
        let rest = std::mem::take(&mut self.buffer);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        match status {
            Some(200..=299) => decode_line(&rest),
            other => Some(Err(DecodeError {
                line: String::from_utf8_lossy(&rest).trim().to_string(),
                message: match other {
                    Some(code) => format!("response ended with status {code}"),
                    None => "response ended without a status".to_string(),
                },
            })),
        }
    }

    /// Bytes held back waiting for a newline
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Discard any partial line
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

fn decode_line(line: &[u8]) -> Option<Result<Value, DecodeError>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        trace!("Keep-alive line");
        return None;
    }

    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            return Some(Err(DecodeError {
                line: String::from_utf8_lossy(line).into_owned(),
                message: e.to_string(),
            }));
        }
    };

    Some(
        serde_json::from_str::<Value>(text).map_err(|e| DecodeError {
            line: text.to_string(),
            message: e.to_string(),
        }),
    )
}
