//! Envelope encoding for both wire formats, plus the line reader
//! used by the local channel.
//!
//! - **Line**: one JSON document per `\n`-terminated line, keys `type` / `data`
//! - **Socket**: one JSON document per text message, keys `channel` / `payload`
//!
//! Decoding accepts either key set regardless of format.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Result, TransportError};
use crate::types::{channels, Envelope, Status};

const INITIAL_BUF_CAPACITY: usize = 8 * 1024;

/// Maximum accepted line length: 16 MiB
pub const MAX_LINE_SIZE: usize = 16 * 1024 * 1024;

/// Byte representation used by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Line,
    Socket,
}

#[derive(Serialize)]
struct LineEnvelope<'a> {
    #[serde(rename = "type")]
    channel: &'a str,
    #[serde(rename = "data")]
    payload: &'a serde_json::Value,
}

impl WireFormat {
    /// Encode an envelope into one frame
    pub fn encode(self, envelope: &Envelope) -> Result<Vec<u8>> {
        match self {
            Self::Line => {
                let mut buf = serde_json::to_vec(&LineEnvelope {
                    channel: &envelope.channel,
                    payload: &envelope.payload,
                })?;
                buf.push(b'\n');
                Ok(buf)
            }
            Self::Socket => Ok(serde_json::to_vec(envelope)?),
        }
    }

    /// Encode a pre-built JSON document into one frame, keys untouched
    pub fn encode_raw(self, message: &serde_json::Value) -> Result<Vec<u8>> {
        let mut buf = serde_json::to_vec(message)?;
        if self == Self::Line {
            buf.push(b'\n');
        }
        Ok(buf)
    }

    /// Decode one frame into an envelope
    pub fn decode(self, frame: &[u8]) -> Result<Envelope> {
        let trimmed = trim_line_end(frame);
        if trimmed.is_empty() {
            return Err(TransportError::InvalidFrame("empty frame".to_string()));
        }
        Ok(serde_json::from_slice(trimmed)?)
    }
}

fn trim_line_end(frame: &[u8]) -> &[u8] {
    let mut end = frame.len();
    while end > 0 && matches!(frame[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &frame[..end]
}

/// Split a status into the independent envelopes the ingestion side expects
///
/// Only the first process is reported: one `axm:monitor`, one `axm:action`
/// per registered action, one `axm:options`. A status without processes
/// yields nothing.
pub fn fan_out_status(status: &Status) -> Result<Vec<Envelope>> {
    let Some(process) = status.process.first() else {
        return Ok(Vec::new());
    };

    let mut envelopes = Vec::with_capacity(process.axm_actions.len() + 2);
    envelopes.push(Envelope::new(
        channels::AXM_MONITOR,
        serde_json::to_value(&process.axm_monitor)?,
    ));
    for action in &process.axm_actions {
        envelopes.push(Envelope::new(
            channels::AXM_ACTION,
            serde_json::to_value(action)?,
        ));
    }
    envelopes.push(Envelope::new(
        channels::AXM_OPTIONS,
        process.axm_options.clone(),
    ));
    Ok(envelopes)
}

/// Async newline-delimited reader over any `AsyncRead` stream.
///
/// Buffers incoming bytes and yields complete lines without the terminator.
/// A line longer than the limit is reported once as `InvalidFrame` and
/// dropped through its terminator; reading resumes on the following line.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    max_line: usize,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self::with_max_line(inner, MAX_LINE_SIZE)
    }

    /// Wrap a reader with a custom line length limit in bytes.
    pub fn with_max_line(inner: R, max_line: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY.min(max_line.max(1))),
            max_line,
            discarding: false,
        }
    }

    /// Read the next line. Returns `None` on clean EOF.
    ///
    /// A trailing unterminated line at EOF is still returned.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let newline = self.buf.iter().position(|b| *b == b'\n');

            if self.discarding {
                match newline {
                    Some(pos) => {
                        self.buf.advance(pos + 1);
                        self.discarding = false;
                        continue;
                    }
                    None => self.buf.clear(),
                }
            } else if let Some(pos) = newline {
                let line = self.buf.split_to(pos + 1);
                if pos > self.max_line {
                    return Err(self.too_long());
                }
                let mut line = line.to_vec();
                line.truncate(trim_line_end(&line).len());
                return Ok(Some(line));
            } else if self.buf.len() > self.max_line {
                self.buf.clear();
                self.discarding = true;
                return Err(self.too_long());
            }

            let n = self.inner.read_buf(&mut self.buf).await?;

            if n == 0 {
                if self.buf.is_empty() || self.discarding {
                    self.buf.clear();
                    return Ok(None);
                }
                let rest = self.buf.split().to_vec();
                return Ok(Some(rest));
            }
        }
    }

    fn too_long(&self) -> TransportError {
        TransportError::InvalidFrame(format!(
            "Line too long: more than {} bytes without terminator",
            self.max_line
        ))
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> R {
        self.inner
    }
}
