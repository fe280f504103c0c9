// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Binary socket framing and CBOR helpers.
//!
//! Packet layout:
//!
//! ``"TTHR" | VERSION u16 | FLAGS u16 | LENGTH u32 | PAYLOAD | CHECKSUM [u8; 32]``
//!
//! Integers are big-endian.
//!
//! * PAYLOAD is a CBOR `OpEnvelope`, or a slice of one when segmented
//! * FLAGS bit 0 marks a segment that is continued by the next packet
//! * CHECKSUM is the blake3 hash of the 12 header bytes followed by PAYLOAD

use blake3::Hasher;
use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};
use tracing::trace;

use crate::error::FrameError;
use crate::{ErrorPayload, HelloPayload, Message, OpEnvelope, TextPayload, WelcomePayload};

/// Protocol magic constant "TTHR".
pub const MAGIC: [u8; 4] = *b"TTHR";
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// FLAGS bit: more segments of this envelope follow.
pub const FLAG_CONTINUED: u16 = 0x0001;
/// Header length in bytes.
pub const HEADER_LEN: usize = 12;
/// Checksum length in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// Encode to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| FrameError::Cbor(e.to_string()))?;
    Ok(out)
}

/// Parse a CBOR value of type `T`.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    ciborium::de::from_reader(bytes).map_err(|e| FrameError::Cbor(e.to_string()))
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// The 12 header bytes as sent.
    pub header: [u8; HEADER_LEN],
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Trailing blake3 hash.
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Packet {
    /// Build a packet around `payload` with the given flags.
    pub fn new(payload: Vec<u8>, flags: u16) -> Self {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&flags.to_be_bytes());
        header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&payload);
        let checksum = *hasher.finalize().as_bytes();

        Packet {
            header,
            payload,
            checksum,
        }
    }

    /// Header flags.
    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.header[6], self.header[7]])
    }

    /// Returns `true` when another segment follows.
    pub fn is_continued(&self) -> bool {
        self.flags() & FLAG_CONTINUED != 0
    }

    /// Serialized bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + CHECKSUM_LEN);
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.checksum);
        out
    }

    /// Decode one packet from the front of `bytes`, returning it and the bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Packet, usize), FrameError> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(FrameError::Incomplete);
        }
        if bytes[0..4] != MAGIC {
            return Err(FrameError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let len = payload_len(&bytes[..HEADER_LEN]);
        let total = HEADER_LEN + len + CHECKSUM_LEN;
        if bytes.len() < total {
            return Err(FrameError::Incomplete);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
        let checksum = &bytes[HEADER_LEN + len..total];

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        if hasher.finalize().as_bytes() != checksum {
            return Err(FrameError::ChecksumMismatch);
        }
        let mut sum = [0u8; CHECKSUM_LEN];
        sum.copy_from_slice(checksum);
        Ok((
            Packet {
                header,
                payload: payload.to_vec(),
                checksum: sum,
            },
            total,
        ))
    }
}

/// Payload length declared in a 12-byte header.
pub fn payload_len(header: &[u8]) -> usize {
    u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize
}

fn envelope_bytes(msg: &Message, ts: u64) -> Result<Vec<u8>, FrameError> {
    let cbor = |e: ciborium::value::Error| FrameError::Cbor(e.to_string());
    let payload = match msg {
        Message::Hello(p) => Value::serialized(p).map_err(cbor)?,
        Message::Welcome(p) => Value::serialized(p).map_err(cbor)?,
        Message::Sync { text } | Message::Update { text } => {
            Value::serialized(&TextPayload { text: text.clone() }).map_err(cbor)?
        }
        Message::Error(p) => Value::serialized(p).map_err(cbor)?,
    };
    let env = OpEnvelope {
        op: msg.op_name().to_string(),
        ts,
        payload,
    };
    to_cbor(&env)
}

fn message_from_envelope(bytes: &[u8]) -> Result<(Message, u64), FrameError> {
    let env: OpEnvelope<Value> = from_cbor(bytes)?;
    let cbor = |e: ciborium::value::Error| FrameError::Cbor(e.to_string());
    let msg = match env.op.as_str() {
        "hello" => Message::Hello(env.payload.deserialized::<HelloPayload>().map_err(cbor)?),
        "welcome" => Message::Welcome(env.payload.deserialized::<WelcomePayload>().map_err(cbor)?),
        "sync" => Message::Sync {
            text: env.payload.deserialized::<TextPayload>().map_err(cbor)?.text,
        },
        "update" => Message::Update {
            text: env.payload.deserialized::<TextPayload>().map_err(cbor)?.text,
        },
        "error" => Message::Error(env.payload.deserialized::<ErrorPayload>().map_err(cbor)?),
        other => return Err(FrameError::UnknownOp(other.to_string())),
    };
    Ok((msg, env.ts))
}

/// Encode a `Message` into one packet with the provided logical timestamp.
pub fn encode_message(msg: &Message, ts: u64) -> Result<Vec<u8>, FrameError> {
    Ok(Packet::new(envelope_bytes(msg, ts)?, 0).to_bytes())
}

/// Encode a `Message` into packets whose payloads are at most `max_segment` bytes.
pub fn encode_segmented(
    msg: &Message,
    ts: u64,
    max_segment: usize,
) -> Result<Vec<Vec<u8>>, FrameError> {
    if max_segment == 0 {
        return Err(FrameError::ZeroSegment);
    }
    let payload = envelope_bytes(msg, ts)?;
    let chunks: Vec<&[u8]> = payload.chunks(max_segment).collect();
    let last = chunks.len().saturating_sub(1);
    let packets: Vec<Vec<u8>> = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let flags = if i < last { FLAG_CONTINUED } else { 0 };
            Packet::new(chunk.to_vec(), flags).to_bytes()
        })
        .collect();
    trace!(op = msg.op_name(), segments = packets.len(), "encoded message");
    Ok(packets)
}

/// Decode a single unsegmented packet into (Message, ts, bytes_consumed).
pub fn decode_message(bytes: &[u8]) -> Result<(Message, u64, usize), FrameError> {
    let (packet, used) = Packet::decode(bytes)?;
    let (msg, ts) = message_from_envelope(&packet.payload)?;
    Ok((msg, ts, used))
}

/// Joins segmented packets back into messages.
#[derive(Debug)]
pub struct Reassembler {
    pending: Vec<u8>,
    max_payload: usize,
}

impl Reassembler {
    /// New reassembler accepting envelopes up to `max_payload` bytes.
    pub fn new(max_payload: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_payload,
        }
    }

    /// Returns `true` while a segmented envelope is incomplete.
    pub fn is_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drops any partially received envelope.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Feeds one verified packet; yields a message once its last segment arrives.
    pub fn push(&mut self, packet: Packet) -> Result<Option<(Message, u64)>, FrameError> {
        let len = self.pending.len() + packet.payload.len();
        if len > self.max_payload {
            self.pending.clear();
            return Err(FrameError::PayloadTooLarge {
                len,
                max: self.max_payload,
            });
        }
        let continued = packet.is_continued();
        self.pending.extend_from_slice(&packet.payload);
        if continued {
            return Ok(None);
        }
        let bytes = std::mem::take(&mut self.pending);
        message_from_envelope(&bytes).map(Some)
    }

    /// Decodes every complete packet at the front of `buf`, draining consumed bytes.
    ///
    /// Leaves a trailing partial packet in `buf` for the next read.
    pub fn drain(&mut self, buf: &mut Vec<u8>) -> Result<Vec<(Message, u64)>, FrameError> {
        let mut out = Vec::new();
        loop {
            if buf.len() < HEADER_LEN {
                break;
            }
            let len = payload_len(&buf[..HEADER_LEN]);
            if len > self.max_payload {
                return Err(FrameError::PayloadTooLarge {
                    len,
                    max: self.max_payload,
                });
            }
            if buf.len() < HEADER_LEN + len + CHECKSUM_LEN {
                break;
            }
            let (packet, used) = Packet::decode(buf)?;
            buf.drain(..used);
            if let Some(msg) = self.push(packet)? {
                out.push(msg);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex::FromHex;

    fn unhex(text: &str) -> Vec<u8> {
        let digits: String = text.split_whitespace().collect();
        Vec::from_hex(digits).unwrap()
    }

    #[test]
    fn header_layout_matches_vector() {
        let packet = Packet::new(vec![0xa0], FLAG_CONTINUED);
        assert_eq!(
            packet.header.to_vec(),
            unhex("54544852 0001 0001 00000001")
        );
        assert!(packet.is_continued());
    }

    #[test]
    fn hello_round_trips_through_a_packet() {
        let msg = Message::Hello(HelloPayload {
            session_id: Some("abc".into()),
            last_applied: Some(7),
            client_version: 1,
        });
        let bytes = encode_message(&msg, 3).unwrap();
        let (decoded, ts, used) = decode_message(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(ts, 3);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn corrupted_packets_are_rejected() {
        let bytes = encode_message(&Message::Update { text: "for(;;);[]".into() }, 0).unwrap();
        let mut flipped = bytes.clone();
        flipped[HEADER_LEN] ^= 0xff;
        assert_eq!(decode_message(&flipped), Err(FrameError::ChecksumMismatch));
        let mut magic = bytes.clone();
        magic[0] = b'X';
        assert_eq!(decode_message(&magic), Err(FrameError::BadMagic));
        assert_eq!(
            decode_message(&bytes[..bytes.len() - 1]),
            Err(FrameError::Incomplete)
        );
    }
}
