//! Record versions and their binary encoding.
//!
//! A version is written as a one-byte kind tag followed by the kind's payload.
//! Encoding and decoding go through [`VERSION_CODECS`], a fixed table indexed by
//! that tag, so an unknown or corrupt tag fails the decode instead of falling
//! back to a default version.

use std::fmt;

use crate::buf::ByteReader;
use crate::error::DecodeError;
use crate::types::current_timestamp_ms;

/// Revision marker of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordVersion {
    /// Never versioned. Also what an absent record reports.
    Untracked,
    /// Plain monotonic counter.
    Simple(i32),
    /// Counter plus the wall-clock time (ms) and node discriminator of the last writer.
    Distributed { counter: i32, timestamp: i64, node: i64 },
}

/// Tag identifying a version encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VersionKind {
    Untracked = 0,
    Simple = 1,
    Distributed = 2,
}

impl VersionKind {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl RecordVersion {
    /// Version assigned to a freshly created record.
    pub fn initial() -> Self {
        RecordVersion::Simple(0)
    }

    pub fn kind(&self) -> VersionKind {
        match self {
            RecordVersion::Untracked => VersionKind::Untracked,
            RecordVersion::Simple(_) => VersionKind::Simple,
            RecordVersion::Distributed { .. } => VersionKind::Distributed,
        }
    }

    /// Counter component; `-1` for untracked.
    pub fn counter(&self) -> i32 {
        match self {
            RecordVersion::Untracked => -1,
            RecordVersion::Simple(counter) => *counter,
            RecordVersion::Distributed { counter, .. } => *counter,
        }
    }

    /// The version a successful update produces.
    pub fn next(&self) -> Self {
        match self {
            RecordVersion::Untracked => RecordVersion::initial(),
            RecordVersion::Simple(counter) => RecordVersion::Simple(counter.wrapping_add(1)),
            RecordVersion::Distributed { counter, node, .. } => RecordVersion::Distributed {
                counter: counter.wrapping_add(1),
                timestamp: current_timestamp_ms() as i64,
                node: *node,
            },
        }
    }

    /// Append the tagged encoding of this version.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let codec = &VERSION_CODECS[self.kind().tag() as usize];
        buf.push(codec.kind.tag());
        (codec.encode)(self, buf);
    }

    /// Decode a version written by [`RecordVersion::encode`].
    pub fn decode(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        let codec = codec_for(tag).ok_or(DecodeError::UnknownTag { what: "version", tag })?;
        (codec.decode)(reader)
    }

    /// Canonical byte form, used for equality checks across the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(21);
        self.encode(&mut buf);
        buf
    }
}

impl fmt::Display for RecordVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordVersion::Untracked => write!(f, "untracked"),
            RecordVersion::Simple(counter) => write!(f, "{}", counter),
            RecordVersion::Distributed { counter, timestamp, node } => {
                write!(f, "{}.{}.{}", counter, timestamp, node)
            }
        }
    }
}

/// Encode/decode pair for one version kind.
pub struct VersionCodec {
    pub kind: VersionKind,
    pub encode: fn(&RecordVersion, &mut Vec<u8>),
    pub decode: fn(&mut ByteReader<'_>) -> Result<RecordVersion, DecodeError>,
}

/// Indexed by [`VersionKind::tag`].
pub static VERSION_CODECS: [VersionCodec; 3] = [
    VersionCodec {
        kind: VersionKind::Untracked,
        encode: encode_untracked,
        decode: decode_untracked,
    },
    VersionCodec {
        kind: VersionKind::Simple,
        encode: encode_simple,
        decode: decode_simple,
    },
    VersionCodec {
        kind: VersionKind::Distributed,
        encode: encode_distributed,
        decode: decode_distributed,
    },
];

pub fn codec_for(tag: u8) -> Option<&'static VersionCodec> {
    VERSION_CODECS.get(tag as usize)
}

fn encode_untracked(_version: &RecordVersion, _buf: &mut Vec<u8>) {}

fn decode_untracked(_reader: &mut ByteReader<'_>) -> Result<RecordVersion, DecodeError> {
    Ok(RecordVersion::Untracked)
}

fn encode_simple(version: &RecordVersion, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&version.counter().to_be_bytes());
}

fn decode_simple(reader: &mut ByteReader<'_>) -> Result<RecordVersion, DecodeError> {
    Ok(RecordVersion::Simple(reader.read_i32()?))
}

fn encode_distributed(version: &RecordVersion, buf: &mut Vec<u8>) {
    let (timestamp, node) = match version {
        RecordVersion::Distributed { timestamp, node, .. } => (*timestamp, *node),
        _ => (0, 0),
    };
    buf.extend_from_slice(&version.counter().to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&node.to_be_bytes());
}

fn decode_distributed(reader: &mut ByteReader<'_>) -> Result<RecordVersion, DecodeError> {
    let counter = reader.read_i32()?;
    let timestamp = reader.read_i64()?;
    let node = reader.read_i64()?;
    Ok(RecordVersion::Distributed { counter, timestamp, node })
}
