//! State payload encoding.
//!
//! On write the raw state is optionally minified (JSON whitespace removed)
//! and then optionally gzip-compressed at maximum ratio.  On read only the
//! compression is undone; minification is one-way.  The flags are fixed
//! for the life of the server because stored bytes do not record how they
//! were encoded.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

/// Failure while encoding or decoding a state payload.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The compression stream could not be written or flushed.
    #[error("failed to compress Terraform state: {0}")]
    Compress(#[source] std::io::Error),

    /// The stored bytes are not a valid compressed stream.
    #[error("failed to read compressed Terraform state: {0}")]
    Decompress(#[source] std::io::Error),

    /// Minification was requested but the payload is not JSON.
    #[error("failed to minify Terraform state: {0}")]
    Minify(#[source] serde_json::Error),
}

/// The static encode/decode configuration for state payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateCodec {
    compress: bool,
    minify: bool,
}

impl StateCodec {
    pub fn new(compress: bool, minify: bool) -> Self {
        Self { compress, minify }
    }

    #[cfg(test)]
    pub(crate) fn compress(&self) -> bool {
        self.compress
    }

    #[cfg(test)]
    pub(crate) fn minify(&self) -> bool {
        self.minify
    }

    /// Transform raw request bytes into their stored form.
    pub fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        let minified;
        let input = if self.minify {
            minified = minify_json(raw)?;
            minified.as_slice()
        } else {
            raw
        };

        if !self.compress {
            return Ok(input.to_vec());
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(input.len() / 4), Compression::best());
        encoder.write_all(input).map_err(CodecError::Compress)?;
        encoder.finish().map_err(CodecError::Compress)
    }

    /// Recover the bytes handed to Terraform from their stored form.
    pub fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, CodecError> {
        if !self.compress {
            return Ok(stored.to_vec());
        }

        let mut decoder = GzDecoder::new(stored);
        let mut out = Vec::with_capacity(stored.len() * 4);
        decoder.read_to_end(&mut out).map_err(CodecError::Decompress)?;
        Ok(out)
    }
}

/// Re-serialize JSON compactly. Key order is preserved.
fn minify_json(raw: &[u8]) -> Result<Vec<u8>, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(raw).map_err(CodecError::Minify)?;
    serde_json::to_vec(&value).map_err(CodecError::Minify)
}
