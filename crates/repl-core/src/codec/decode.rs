//! Incremental bencode decoding.
//!
//! [`StreamDecoder`] is a push decoder: feed it whatever chunk the socket
//! produced and pull complete top-level values out. A value split across
//! chunks is resumed once enough bytes have arrived; bytes already handed
//! back as a value are never looked at again.
//!
//! [`decode_stream`] wraps the same machinery around a pull-based
//! [`ByteSource`] and yields values lazily until end of stream.

use super::error::{ProtocolError, ProtocolErrorKind};
use super::value::{Dict, Value};
use crate::config::ProtocolConfig;
use crate::error::{ReplError, Result};
use bytes::{Buf, BytesMut};
use std::io::Read;

/// A scalar parse result: the value and the offset just past it, or the
/// buffer length needed before trying again.
type Scalar<T> = std::result::Result<std::result::Result<(T, usize), usize>, ProtocolError>;

/// Parse `i<digits>e` starting at `pos`.
fn integer(buf: &[u8], pos: usize) -> Scalar<i64> {
    let start = pos + 1;
    let Some(len) = buf[start..].iter().position(|&b| b == b'e') else {
        // Reject garbage before waiting for a terminator that may never come.
        let pending = &buf[start..];
        if pending.len() > 20 || !is_integer_prefix(pending) {
            return Err(ProtocolError::new(ProtocolErrorKind::InvalidInteger, pos));
        }
        return Ok(Err(buf.len() + 1));
    };
    let n = parse_integer(&buf[start..start + len]).map_err(|kind| ProtocolError::new(kind, pos))?;
    Ok(Ok((n, start + len + 1)))
}

/// Parse `<len>:<bytes>` starting at `pos`.
fn byte_string(buf: &[u8], pos: usize, max_len: usize) -> Scalar<&[u8]> {
    let Some(colon) = buf[pos..].iter().position(|&b| b == b':') else {
        let pending = &buf[pos..];
        if pending.len() > 20 || !pending.iter().all(u8::is_ascii_digit) {
            return Err(ProtocolError::new(ProtocolErrorKind::InvalidLength, pos));
        }
        return Ok(Err(buf.len() + 1));
    };
    let digits = &buf[pos..pos + colon];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::new(ProtocolErrorKind::InvalidLength, pos));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProtocolError::new(ProtocolErrorKind::InvalidLength, pos))?;
    if len > max_len {
        return Err(ProtocolError::new(
            ProtocolErrorKind::LengthTooLarge { len, max: max_len },
            pos,
        ));
    }
    let start = pos + colon + 1;
    let end = start + len;
    if buf.len() < end {
        return Ok(Err(end));
    }
    Ok(Ok((&buf[start..end], end)))
}

/// A container whose closing `e` has not arrived yet.
#[derive(Debug)]
enum Partial {
    List(Vec<Value>),
    Dict { dict: Dict, key: Option<Vec<u8>> },
}

fn is_integer_prefix(bytes: &[u8]) -> bool {
    let digits = bytes.strip_prefix(b"-").unwrap_or(bytes);
    digits.iter().all(u8::is_ascii_digit)
}

fn parse_integer(bytes: &[u8]) -> std::result::Result<i64, ProtocolErrorKind> {
    let (negative, digits) = match bytes.strip_prefix(b"-") {
        Some(rest) => (true, rest),
        None => (false, bytes),
    };
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolErrorKind::InvalidInteger);
    }
    // No leading zeros, no negative zero.
    if digits.len() > 1 && digits[0] == b'0' || negative && digits == b"0" {
        return Err(ProtocolErrorKind::InvalidInteger);
    }
    std::str::from_utf8(bytes)
        .map_err(|_| ProtocolErrorKind::InvalidInteger)?
        .parse::<i64>()
        .map_err(|_| ProtocolErrorKind::IntegerOverflow)
}

/// Push decoder for an unbounded stream of top-level values.
///
/// Containers still being read live on `stack` with `pos` pointing at the
/// next unparsed byte, so every byte is parsed once however the stream is
/// chunked. Only a scalar cut by a chunk boundary is parsed again.
#[derive(Debug)]
pub struct StreamDecoder {
    buf: BytesMut,
    /// Bytes consumed by values already returned.
    consumed: usize,
    /// Parse position within `buf` for the value in progress.
    pos: usize,
    stack: Vec<Partial>,
    /// Minimum buffered length before the next parse attempt is worthwhile.
    needed: usize,
    max_len: usize,
    max_depth: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_limits(ProtocolConfig::MAX_MESSAGE_SIZE, ProtocolConfig::MAX_NESTING_DEPTH)
    }

    pub fn with_limits(max_len: usize, max_depth: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            consumed: 0,
            pos: 0,
            stack: Vec::new(),
            needed: 1,
            max_len,
            max_depth,
        }
    }

    /// Append a chunk read from the stream.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet part of a returned value.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pull the next complete value, or `None` if more bytes are needed.
    pub fn next_value(&mut self) -> std::result::Result<Option<Value>, ProtocolError> {
        self.step().map_err(|e| e.shifted(self.consumed))
    }

    fn step(&mut self) -> std::result::Result<Option<Value>, ProtocolError> {
        loop {
            if self.buf.len() < self.needed {
                return Ok(None);
            }
            let pos = self.pos;
            let Some(&tag) = self.buf.get(pos) else {
                self.needed = pos + 1;
                return Ok(None);
            };

            if let Some(Partial::Dict { key: key @ None, .. }) = self.stack.last_mut() {
                match tag {
                    b'e' => {}
                    b'0'..=b'9' => match byte_string(&self.buf, pos, self.max_len)? {
                        Ok((bytes, end)) => {
                            *key = Some(bytes.to_vec());
                            self.pos = end;
                            continue;
                        }
                        Err(needed) => {
                            self.needed = needed;
                            return Ok(None);
                        }
                    },
                    _ => return Err(ProtocolError::new(ProtocolErrorKind::NonStringKey, pos)),
                }
            }

            let complete = match tag {
                b'i' => match integer(&self.buf, pos)? {
                    Ok((n, end)) => {
                        self.pos = end;
                        Value::Int(n)
                    }
                    Err(needed) => {
                        self.needed = needed;
                        return Ok(None);
                    }
                },
                b'0'..=b'9' => match byte_string(&self.buf, pos, self.max_len)? {
                    Ok((bytes, end)) => {
                        let value = Value::Bytes(bytes.to_vec());
                        self.pos = end;
                        value
                    }
                    Err(needed) => {
                        self.needed = needed;
                        return Ok(None);
                    }
                },
                b'l' | b'd' => {
                    if self.stack.len() >= self.max_depth {
                        return Err(ProtocolError::new(
                            ProtocolErrorKind::NestingTooDeep(self.max_depth),
                            pos,
                        ));
                    }
                    self.stack.push(if tag == b'l' {
                        Partial::List(Vec::new())
                    } else {
                        Partial::Dict {
                            dict: Dict::new(),
                            key: None,
                        }
                    });
                    self.pos = pos + 1;
                    continue;
                }
                b'e' => match self.stack.pop() {
                    Some(Partial::List(items)) => {
                        self.pos = pos + 1;
                        Value::List(items)
                    }
                    Some(Partial::Dict { dict, key: None }) => {
                        self.pos = pos + 1;
                        Value::Dict(dict)
                    }
                    // A key with no value, or `e` at the top level.
                    _ => return Err(ProtocolError::new(ProtocolErrorKind::UnexpectedByte(tag), pos)),
                },
                other => {
                    return Err(ProtocolError::new(ProtocolErrorKind::UnexpectedByte(other), pos))
                }
            };
            self.needed = 1;

            match self.stack.last_mut() {
                Some(Partial::List(items)) => items.push(complete),
                Some(Partial::Dict { dict, key }) => {
                    if let Some(key) = key.take() {
                        dict.insert(key, complete);
                    }
                }
                None => {
                    let end = self.pos;
                    self.buf.advance(end);
                    self.consumed += end;
                    self.pos = 0;
                    return Ok(Some(complete));
                }
            }
        }
    }

    /// Signal end of stream. Leftover bytes mean a value was cut short.
    pub fn finish(&self) -> std::result::Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::new(
                ProtocolErrorKind::UnexpectedEof,
                self.consumed + self.buf.len(),
            ))
        }
    }
}

/// Decode exactly one value from a complete buffer.
pub fn decode(bytes: &[u8]) -> std::result::Result<Value, ProtocolError> {
    let mut decoder = StreamDecoder::new();
    decoder.feed(bytes);
    match decoder.next_value()? {
        Some(value) if decoder.buffered() == 0 => Ok(value),
        Some(_) => Err(ProtocolError::new(
            ProtocolErrorKind::UnexpectedByte(bytes[bytes.len() - decoder.buffered()]),
            bytes.len() - decoder.buffered(),
        )),
        None => Err(ProtocolError::new(ProtocolErrorKind::UnexpectedEof, bytes.len())),
    }
}

/// A pull-based source of bytes.
pub trait ByteSource {
    /// Return up to `n` bytes. Fewer is fine; an empty result means end of stream.
    /// Bytes returned once are never returned again.
    fn read(&mut self, n: usize) -> std::io::Result<Vec<u8>>;
}

/// Adapts any [`std::io::Read`] into a [`ByteSource`].
#[derive(Debug)]
pub struct ReaderSource<R> {
    inner: R,
}

impl<R: Read> ReaderSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> ByteSource for ReaderSource<R> {
    fn read(&mut self, n: usize) -> std::io::Result<Vec<u8>> {
        let mut chunk = vec![0u8; n];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(read) => {
                    chunk.truncate(read);
                    return Ok(chunk);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Lazy sequence of values decoded from a [`ByteSource`].
///
/// Yields `Err` at most once, after which the stream is exhausted; a fresh
/// decoder over a fresh source is needed to start again.
pub struct DecodeStream<S> {
    source: S,
    decoder: StreamDecoder,
    finished: bool,
}

/// Decode a stream of values from `source` until end of stream.
pub fn decode_stream<S: ByteSource>(source: S) -> DecodeStream<S> {
    DecodeStream {
        source,
        decoder: StreamDecoder::new(),
        finished: false,
    }
}

impl<S: ByteSource> Iterator for DecodeStream<S> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            match self.decoder.next_value() {
                Ok(Some(value)) => return Some(Ok(value)),
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }

            match self.source.read(ProtocolConfig::READ_CHUNK_SIZE) {
                Ok(chunk) if chunk.is_empty() => {
                    self.finished = true;
                    return self.decoder.finish().err().map(|e| Err(e.into()));
                }
                Ok(chunk) => self.decoder.feed(&chunk),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(ReplError::from(e)));
                }
            }
        }
        None
    }
}
