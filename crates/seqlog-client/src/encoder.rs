//! Batch Blob Encoding
//!
//! A batch travels to the sequencer as one opaque blob. Two body
//! layouts exist, picked by the shape of the appends:
//!
//! - **Single payloads**: every append is one byte string; the body is
//!   a sequence of varint-length-prefixed payloads.
//! - **Payload groups**: every append is a small map of sub-key to
//!   payload; the body frames each group as a varint entry count
//!   followed by `(key, varint length, bytes)` entries.
//!
//! ```text
//! +--------+-------------+---------------+------------------------+
//! | format | compression | varint count  | varint raw_len | body  |
//! +--------+-------------+---------------+------------------------+
//! ```
//!
//! The body is compressed as a whole (`None`/`LZ4`/`ZSTD(level)`).
//! `decode_batch` inverts `encode_batch` exactly; the sequencer and the
//! tests both rely on that.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use seqlog_core::wire::{get_varint_u64, put_varint_u64};
use seqlog_core::Status;

/// One record's payload: a plain byte string or a keyed group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Single(Bytes),
    Group(BTreeMap<u8, Bytes>),
}

impl Payload {
    /// Bytes this payload pins in memory while buffered.
    pub fn memory_size(&self) -> usize {
        match self {
            Payload::Single(bytes) => bytes.len(),
            Payload::Group(group) => group.values().map(Bytes::len).sum(),
        }
    }

    /// Exact encoded size of this payload inside the blob body.
    fn encoded_size(&self) -> usize {
        match self {
            Payload::Single(bytes) => varint_len(bytes.len() as u64) + bytes.len(),
            Payload::Group(group) => {
                varint_len(group.len() as u64)
                    + group
                        .iter()
                        .map(|(_, bytes)| 1 + varint_len(bytes.len() as u64) + bytes.len())
                        .sum::<usize>()
            }
        }
    }
}

/// Body layout of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlobFormat {
    SinglePayloads = 1,
    PayloadGroups = 2,
}

/// Compression applied to the blob body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Compression {
    fn tag(&self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd { .. } => 2,
        }
    }
}

/// Running estimate of the blob a building batch would produce.
///
/// Appending the same payloads to the estimator and then encoding gives
/// a body of exactly the estimated size (before compression).
#[derive(Debug, Clone, Default)]
pub struct BlobSizeEstimator {
    count: usize,
    body_bytes: usize,
    has_groups: bool,
}

impl BlobSizeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, payload: &Payload) {
        self.count += 1;
        self.body_bytes += payload.encoded_size();
        if matches!(payload, Payload::Group(_)) {
            self.has_groups = true;
        }
    }

    pub fn format(&self) -> BlobFormat {
        if self.has_groups {
            BlobFormat::PayloadGroups
        } else {
            BlobFormat::SinglePayloads
        }
    }

    /// Full blob size assuming no compression; compression only ever
    /// shrinks the body.
    pub fn calculate_size(&self) -> usize {
        2 + varint_len(self.count as u64) + varint_len(self.body_bytes as u64) + self.body_bytes
    }
}

/// Encode the payloads into one blob. In destroy mode payloads are
/// taken out of the appends as they are copied, and the freed memory
/// total is returned for budget accounting.
pub fn encode_batch(
    payloads: &mut [Payload],
    format: BlobFormat,
    compression: Compression,
    destroy_payloads: bool,
) -> (Bytes, usize) {
    let mut body = BytesMut::with_capacity(payloads.iter().map(Payload::encoded_size).sum());
    let mut freed = 0usize;

    for payload in payloads.iter_mut() {
        match (format, &payload) {
            (BlobFormat::SinglePayloads, Payload::Single(bytes)) => {
                put_varint_u64(&mut body, bytes.len() as u64);
                body.put_slice(bytes);
            }
            (BlobFormat::PayloadGroups, _) => {
                let group: BTreeMap<u8, Bytes> = match payload {
                    Payload::Single(bytes) => BTreeMap::from([(0u8, bytes.clone())]),
                    Payload::Group(group) => group.clone(),
                };
                put_varint_u64(&mut body, group.len() as u64);
                for (key, bytes) in &group {
                    body.put_u8(*key);
                    put_varint_u64(&mut body, bytes.len() as u64);
                    body.put_slice(bytes);
                }
            }
            (BlobFormat::SinglePayloads, Payload::Group(_)) => {
                // The estimator upgrades the format as soon as a group
                // shows up; reaching here is a bug in the caller.
                debug_assert!(false, "group payload in single-payload blob");
            }
        }
        if destroy_payloads {
            freed += payload.memory_size();
            *payload = Payload::Single(Bytes::new());
        }
    }

    let raw_len = body.len();
    let (compression_tag, compressed) = match compression {
        Compression::None => (Compression::None.tag(), body.freeze()),
        Compression::Lz4 => (Compression::Lz4.tag(), Bytes::from(lz4_flex::compress(&body))),
        Compression::Zstd { level } => match zstd::encode_all(&body[..], level) {
            Ok(out) => (compression.tag(), Bytes::from(out)),
            // An unsupported level is the only realistic failure; the
            // blob ships uncompressed rather than failing the batch.
            Err(_) => (Compression::None.tag(), body.freeze()),
        },
    };

    let count = payloads.len();
    let mut blob = BytesMut::with_capacity(2 + 10 + compressed.len());
    blob.put_u8(format as u8);
    blob.put_u8(compression_tag);
    put_varint_u64(&mut blob, count as u64);
    put_varint_u64(&mut blob, raw_len as u64);
    blob.extend_from_slice(&compressed);
    (blob.freeze(), freed)
}

/// Decode a blob produced by `encode_batch`.
pub fn decode_batch(blob: &Bytes) -> Result<Vec<Payload>, Status> {
    let mut buf = blob.clone();
    if buf.remaining() < 2 {
        return Err(Status::BadMsg);
    }
    let format = match buf.get_u8() {
        1 => BlobFormat::SinglePayloads,
        2 => BlobFormat::PayloadGroups,
        _ => return Err(Status::BadMsg),
    };
    let compression_tag = buf.get_u8();
    let count = get_varint_u64(&mut buf)? as usize;
    let raw_len = get_varint_u64(&mut buf)? as usize;

    let body: Bytes = match compression_tag {
        0 => buf,
        1 => {
            let raw = lz4_flex::decompress(&buf, raw_len).map_err(|_| Status::BadMsg)?;
            Bytes::from(raw)
        }
        2 => {
            let raw = zstd::decode_all(&buf[..]).map_err(|_| Status::BadMsg)?;
            Bytes::from(raw)
        }
        _ => return Err(Status::BadMsg),
    };
    if body.len() != raw_len {
        return Err(Status::BadMsg);
    }

    let mut body = body;
    let mut payloads = Vec::with_capacity(count);
    for _ in 0..count {
        match format {
            BlobFormat::SinglePayloads => {
                let len = get_varint_u64(&mut body)? as usize;
                if body.remaining() < len {
                    return Err(Status::BadMsg);
                }
                payloads.push(Payload::Single(body.split_to(len)));
            }
            BlobFormat::PayloadGroups => {
                let entries = get_varint_u64(&mut body)? as usize;
                let mut group = BTreeMap::new();
                for _ in 0..entries {
                    if !body.has_remaining() {
                        return Err(Status::BadMsg);
                    }
                    let key = body.get_u8();
                    let len = get_varint_u64(&mut body)? as usize;
                    if body.remaining() < len {
                        return Err(Status::BadMsg);
                    }
                    group.insert(key, body.split_to(len));
                }
                payloads.push(Payload::Group(group));
            }
        }
    }
    if body.has_remaining() {
        return Err(Status::BadMsg);
    }
    Ok(payloads)
}

fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn singles(payloads: &[&[u8]]) -> Vec<Payload> {
        payloads
            .iter()
            .map(|p| Payload::Single(Bytes::copy_from_slice(p)))
            .collect()
    }

    #[test]
    fn test_single_payload_roundtrip_uncompressed() {
        let mut payloads = singles(&[b"alpha", b"bravo", b""]);
        let original = payloads.clone();
        let (blob, freed) = encode_batch(
            &mut payloads,
            BlobFormat::SinglePayloads,
            Compression::None,
            false,
        );
        assert_eq!(freed, 0);
        assert_eq!(decode_batch(&blob).unwrap(), original);
    }

    #[test]
    fn test_single_payload_roundtrip_lz4() {
        let mut payloads = singles(&[&[7u8; 4096], &[9u8; 4096]]);
        let original = payloads.clone();
        let (blob, _) = encode_batch(
            &mut payloads,
            BlobFormat::SinglePayloads,
            Compression::Lz4,
            false,
        );
        // Repetitive input actually compresses.
        assert!(blob.len() < 8192);
        assert_eq!(decode_batch(&blob).unwrap(), original);
    }

    #[test]
    fn test_group_roundtrip_zstd() {
        let mut group = BTreeMap::new();
        group.insert(1u8, Bytes::from_static(b"metrics"));
        group.insert(4u8, Bytes::from_static(b"traces"));
        let mut payloads = vec![
            Payload::Group(group),
            Payload::Single(Bytes::from_static(b"mixed-in single")),
        ];
        let original = payloads.clone();
        let (blob, _) = encode_batch(
            &mut payloads,
            BlobFormat::PayloadGroups,
            Compression::Zstd { level: 3 },
            false,
        );
        let decoded = decode_batch(&blob).unwrap();
        // Singles are carried as single-entry groups under key 0.
        assert_eq!(decoded[0], original[0]);
        assert_eq!(
            decoded[1],
            Payload::Group(BTreeMap::from([(0u8, Bytes::from_static(b"mixed-in single"))]))
        );
    }

    #[test]
    fn test_destroy_payloads_reports_freed_bytes() {
        let mut payloads = singles(&[&[1u8; 100], &[2u8; 50]]);
        let (blob, freed) = encode_batch(
            &mut payloads,
            BlobFormat::SinglePayloads,
            Compression::None,
            true,
        );
        assert_eq!(freed, 150);
        assert!(payloads.iter().all(|p| p.memory_size() == 0));
        assert_eq!(decode_batch(&blob).unwrap().len(), 2);
    }

    #[test]
    fn test_estimator_matches_uncompressed_size() {
        let payloads = singles(&[b"one", b"three", &[0u8; 300]]);
        let mut estimator = BlobSizeEstimator::new();
        for p in &payloads {
            estimator.append(p);
        }
        let mut clone = payloads.clone();
        let (blob, _) = encode_batch(
            &mut clone,
            estimator.format(),
            Compression::None,
            false,
        );
        assert_eq!(estimator.calculate_size(), blob.len());
    }

    #[test]
    fn test_estimator_upgrades_format_on_group() {
        let mut estimator = BlobSizeEstimator::new();
        estimator.append(&Payload::Single(Bytes::from_static(b"x")));
        assert_eq!(estimator.format(), BlobFormat::SinglePayloads);
        estimator.append(&Payload::Group(BTreeMap::from([(
            2u8,
            Bytes::from_static(b"y"),
        )])));
        assert_eq!(estimator.format(), BlobFormat::PayloadGroups);
    }

    #[test]
    fn test_decode_garbage_is_badmsg() {
        assert_eq!(
            decode_batch(&Bytes::from_static(b"\xFF\xFFgarbage")),
            Err(Status::BadMsg)
        );
        assert_eq!(decode_batch(&Bytes::new()), Err(Status::BadMsg));
    }
}
