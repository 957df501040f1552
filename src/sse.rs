//! Incremental `text/event-stream` decoding.
//!
//! [`FrameParser`] turns an arbitrary fragmentation of an event stream into
//! records. Fragments may split lines anywhere, including between the CR and
//! LF of a CRLF terminator. Only default-type (`message`) events are emitted;
//! each accumulated `data` buffer is decoded as a single JSON value.

use std::ops::Range;

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::QuillError;

#[derive(Debug, Default)]
pub struct FrameParser {
    /// Unterminated trailing text, prefixed to the next fragment.
    carry: String,
    /// Previous fragment ended in a bare CR, so a leading LF is its second half.
    ignore_next_lf: bool,
    event: Option<String>,
    data: Option<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment and return the records it completed, in order.
    pub fn push(&mut self, fragment: &str) -> Result<Vec<Value>, QuillError> {
        // An empty fragment must not reset the pending-CR flag.
        if fragment.is_empty() {
            return Ok(Vec::new());
        }
        let mut fragment = fragment;
        if self.ignore_next_lf
            && let Some(rest) = fragment.strip_prefix('\n')
        {
            fragment = rest;
        }
        self.ignore_next_lf = fragment.ends_with('\r');

        let mut buf = std::mem::take(&mut self.carry);
        buf.push_str(fragment);

        let (lines, rest) = split_lines(&buf);
        let mut records = Vec::new();
        for range in lines {
            if let Some(record) = self.process_line(&buf[range])? {
                records.push(record);
            }
        }
        self.carry = buf[rest..].to_string();
        Ok(records)
    }

    /// Signal end of stream.
    ///
    /// A record that was never terminated by a blank line is discarded, not
    /// flushed. Backends always close records before ending the stream.
    pub fn finish(self) {
        if self.data.as_deref().is_some_and(|d| !d.is_empty()) || !self.carry.is_empty() {
            tracing::debug!(
                pending_data = self.data.as_deref().unwrap_or(""),
                carry = %self.carry,
                "event stream ended mid-record, dropping pending data"
            );
        }
    }

    fn process_line(&mut self, line: &str) -> Result<Option<Value>, QuillError> {
        if line.is_empty() {
            let event = self.event.take();
            let data = self.data.take();
            return match data {
                Some(data) if !data.is_empty() && is_message(event.as_deref()) => {
                    decode_data(data).map(Some)
                }
                _ => Ok(None),
            };
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, Some(value.strip_prefix(' ').unwrap_or(value))),
            None => (line, None),
        };

        match name {
            "event" => self.event = Some(value.unwrap_or_default().to_string()),
            "data" => {
                let value = value.unwrap_or_default();
                match &mut self.data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.data = Some(value.to_string()),
                }
            }
            _ => {}
        }
        Ok(None)
    }
}

fn is_message(event: Option<&str>) -> bool {
    matches!(event, None | Some("") | Some("message"))
}

/// Returns the byte ranges of complete lines (terminated by LF, CRLF or CR)
/// and the offset where the unterminated remainder starts.
fn split_lines(buf: &str) -> (Vec<Range<usize>>, usize) {
    let bytes = buf.as_bytes();
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => {
                lines.push(start..i);
                i += 1;
                start = i;
            }
            b'\r' => {
                lines.push(start..i);
                i += 1;
                if bytes.get(i) == Some(&b'\n') {
                    i += 1;
                }
                start = i;
            }
            _ => i += 1,
        }
    }
    (lines, start)
}

/// Payloads are JSON. A payload that isn't JSON and doesn't look like an
/// object or array is passed through as a bare string (e.g. `data: end`).
fn decode_data(data: String) -> Result<Value, QuillError> {
    match serde_json::from_str(&data) {
        Ok(value) => Ok(value),
        Err(e) => {
            let head = data.trim_start();
            if head.starts_with('{') || head.starts_with('[') {
                Err(QuillError::Protocol(format!("malformed event data: {e}")))
            } else {
                Ok(Value::String(data))
            }
        }
    }
}

/// Streaming UTF-8 decoder: holds back a multi-byte sequence split across
/// network chunks until it's complete. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }
}

/// Decode a streaming HTTP response body into event-stream records.
/// Ends without error once `cancel` fires; dropping the stream closes the connection.
pub(crate) fn response_records(
    response: reqwest::Response,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Value, QuillError>> + Send {
    async_stream::try_stream! {
        let mut body = std::pin::pin!(response.bytes_stream());
        let mut decoder = Utf8Decoder::default();
        let mut parser = FrameParser::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("event stream cancelled, closing connection");
                    break;
                }
                next = body.next() => next,
            };
            let Some(bytes) = next else { break };
            let bytes = bytes?;
            for record in parser.push(&decoder.decode(&bytes))? {
                yield record;
            }
        }

        parser.finish();
    }
}
