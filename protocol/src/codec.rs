//! Envelope Codec: typed payload to `{message_type, bytes}` and back.
//!
//! Payloads are JSON. Compression is applied only when the JSON body is at
//! or above the configured threshold, and the algorithm used is recorded
//! beside the bytes, so decoding never needs outside context.

use idnet_messages::{MessageType, ProtocolMessage, SchemaRegistry};
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::version::MAX_PAYLOAD_SIZE;

/// Compression algorithms a payload may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    Zstd,
}

impl CompressionAlgorithm {
    /// Stable tag included in envelope signatures.
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::Zstd => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Bodies of at least this many bytes are compressed.
    pub compression_threshold: usize,
    pub algorithm: CompressionAlgorithm,
    pub level: i32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 4096,
            algorithm: CompressionAlgorithm::Zstd,
            level: 3,
        }
    }
}

impl CodecConfig {
    /// A config that never compresses.
    pub fn uncompressed() -> Self {
        Self {
            compression_threshold: usize::MAX,
            ..Self::default()
        }
    }
}

/// The codec's output, ready to be signed into an envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedPayload {
    pub message_type: MessageType,
    pub bytes: Vec<u8>,
    pub compression: Option<CompressionAlgorithm>,
}

/// Encode a message, compressing it when the body reaches the threshold.
pub fn encode(message: &ProtocolMessage, config: &CodecConfig) -> Result<EncodedPayload, CodecError> {
    let body = message
        .to_json()
        .map_err(|e| CodecError::Serialize(e.to_string()))?;
    if body.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::TooLarge {
            size: body.len(),
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let (bytes, compression) = if body.len() >= config.compression_threshold {
        let compressed = compress(&body, config.algorithm, config.level)?;
        (compressed, Some(config.algorithm))
    } else {
        (body, None)
    };

    Ok(EncodedPayload {
        message_type: message.message_type(),
        bytes,
        compression,
    })
}

/// Decode and schema-validate a payload against the registered shapes.
pub fn decode(
    payload: &EncodedPayload,
    schemas: &SchemaRegistry,
) -> Result<ProtocolMessage, CodecError> {
    let body = match payload.compression {
        Some(algorithm) => decompress(&payload.bytes, algorithm)?,
        None => {
            if payload.bytes.len() > MAX_PAYLOAD_SIZE {
                return Err(CodecError::TooLarge {
                    size: payload.bytes.len(),
                    max: MAX_PAYLOAD_SIZE,
                });
            }
            payload.bytes.clone()
        }
    };
    Ok(schemas.validate(payload.message_type, &body)?)
}

fn compress(data: &[u8], algorithm: CompressionAlgorithm, level: i32) -> Result<Vec<u8>, CodecError> {
    match algorithm {
        CompressionAlgorithm::Zstd => {
            zstd::bulk::compress(data, level).map_err(|e| CodecError::Compression {
                algorithm,
                reason: e.to_string(),
            })
        }
    }
}

fn decompress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Vec<u8>, CodecError> {
    match algorithm {
        // Capacity bounds the output, so a small bomb cannot expand past the limit.
        CompressionAlgorithm::Zstd => zstd::bulk::decompress(data, MAX_PAYLOAD_SIZE).map_err(|e| {
            CodecError::Decompression {
                algorithm,
                reason: e.to_string(),
            }
        }),
    }
}
