//! Framed codec for daemon communication.
//!
//! Uses AnyDelimiterCodec for newline framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (stdio, pipes, in-memory streams).
//!
//! Undecodable lines surface as `Ok(Some(Err(DecodeError)))` rather than as a
//! codec error: a `FramedRead` stops yielding after its decoder errors, and a
//! bad line must not end the stream. Only I/O failures are codec errors.

use std::io;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

/// Default upper bound for a single frame. A full `processRecords` batch
/// (base64 inflates payloads by a third) stays well below this.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// Longest prefix of a bad line kept for diagnostics.
const DIAGNOSTIC_PREFIX_BYTES: usize = 256;

/// A line that could not be turned into a message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Not JSON, not UTF-8, missing a required field, or an unknown action.
    #[error("could not understand line {line:?}: {source}")]
    Malformed {
        line: String,
        /// The line's `action` tag, when it was an object that had one.
        action: Option<String>,
        #[source]
        source: serde_json::Error,
    },

    #[error("line exceeds {max} bytes")]
    TooLong { max: usize },
}

#[derive(Deserialize)]
struct ActionProbe {
    action: String,
}

/// Codec that frames messages one per line and serializes with JSON.
///
/// Wraps AnyDelimiterCodec and adds serde_json serialization.
pub struct JsonLinesCodec<T> {
    inner: AnyDelimiterCodec,
    max_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                max_length,
            ),
            max_length,
            _phantom: PhantomData,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl<T: DeserializeOwned> JsonLinesCodec<T> {
    /// Parse one framed line. `None` for blank lines.
    fn parse(line: &[u8]) -> Option<Result<T, DecodeError>> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        Some(serde_json::from_slice(line).map_err(|source| {
            let shown = &line[..line.len().min(DIAGNOSTIC_PREFIX_BYTES)];
            DecodeError::Malformed {
                line: String::from_utf8_lossy(shown).into_owned(),
                action: serde_json::from_slice::<ActionProbe>(line)
                    .ok()
                    .map(|probe| probe.action),
                source,
            }
        }))
    }

    /// Map a framing error: oversized lines are recoverable, I/O is not.
    fn chunk_error(
        &self,
        err: AnyDelimiterCodecError,
    ) -> Result<Result<T, DecodeError>, io::Error> {
        match err {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => Ok(Err(DecodeError::TooLong {
                max: self.max_length,
            })),
            AnyDelimiterCodecError::Io(e) => Err(e),
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = Result<T, DecodeError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src) {
                Ok(Some(line)) => {
                    if let Some(item) = Self::parse(&line) {
                        return Ok(Some(item));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return self.chunk_error(e).map(Some),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(item) = Self::parse(&line) {
                        return Ok(Some(item));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return self.chunk_error(e).map(Some),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(json, dst).map_err(|e| match e {
            AnyDelimiterCodecError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}
