// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Protocol error types.

use thiserror::Error;

/// Malformed JSON text, framing or change record.
///
/// Any decode error rejects the whole response; callers resynchronize.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Input contained no payload.
    #[error("empty response")]
    Empty,
    /// A segment did not start with the `for(;;);` marker.
    #[error("missing payload prefix at byte {offset}")]
    MissingPrefix {
        /// Byte offset of the offending segment.
        offset: usize,
    },
    /// A framed segment was not a JSON array.
    #[error("payload segment is not a JSON array")]
    NotAnArray,
    /// JSON syntax error.
    #[error("invalid json: {0}")]
    Json(String),
    /// Expected a JSON object.
    #[error("expected a JSON object for {0}")]
    NotAnObject(&'static str),
    /// Required key absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    /// Key present with the wrong type or range.
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Key name.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },
    /// Unrecognized change `type` discriminator.
    #[error("unknown change type `{0}`")]
    UnknownType(String),
    /// Both `value` and `nodeValue` (or `add` and `addNodes`) present.
    #[error("conflicting fields `{0}` and `{1}`")]
    Conflicting(&'static str, &'static str),
}

/// Binary packet framing failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Fewer bytes than the header or declared length require.
    #[error("incomplete packet")]
    Incomplete,
    /// Magic bytes do not match.
    #[error("bad magic")]
    BadMagic,
    /// Unsupported wire version.
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    /// blake3 checksum over header and payload did not match.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// Declared or reassembled payload exceeds the configured limit.
    #[error("payload of {len} bytes exceeds limit {max}")]
    PayloadTooLarge {
        /// Offending length.
        len: usize,
        /// Configured limit.
        max: usize,
    },
    /// Segment size of zero requested.
    #[error("segment size must be positive")]
    ZeroSegment,
    /// CBOR encode/decode failure.
    #[error("cbor: {0}")]
    Cbor(String),
    /// Envelope carried an unknown op.
    #[error("unknown op {0}")]
    UnknownOp(String),
}
