use std::convert::TryInto;

use anyhow::{bail, Error};
use bytes::Bytes;

use super::labels::Labels;

/// Opaque chunk identifier as issued by the chunk store.
pub type ChunkId = String;

// openssl::sha::sha256(b"tsdb-chunk-samples-v1")[0..8]
pub const CHUNK_SAMPLES_MAGIC_1_0: [u8; 8] = [203, 202, 40, 187, 43, 176, 21, 32];

const CHUNK_HEADER_SIZE: usize = 8 + 4 + 4; // magic, crc, sample count
const SAMPLE_SIZE: usize = 8 + 8;
const MAX_CHUNK_SAMPLES: usize = 1_000_000;

/// One timestamped value. Timestamps are milliseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: i64,
    pub value: f64,
}

/// A storage-resident sample run carrying its own copy of the series labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub metric: Labels,
    pub from: i64,
    pub through: i64,
    pub encoded: Bytes,
}

impl Chunk {
    /// Encode `samples` into the storage format and wrap them as a chunk.
    ///
    /// Samples must already be in timestamp order; the time range is taken
    /// from the first and last sample.
    pub fn from_samples(metric: Labels, samples: &[Sample]) -> Result<Self, Error> {
        if samples.is_empty() {
            bail!("refusing to encode empty chunk");
        }
        if samples.len() > MAX_CHUNK_SAMPLES {
            bail!("chunk too large ({} samples)", samples.len());
        }

        let mut payload = Vec::with_capacity(4 + samples.len() * SAMPLE_SIZE);
        payload.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        for sample in samples {
            payload.extend_from_slice(&sample.timestamp.to_le_bytes());
            payload.extend_from_slice(&sample.value.to_le_bytes());
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut raw = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len() - 4);
        raw.extend_from_slice(&CHUNK_SAMPLES_MAGIC_1_0);
        raw.extend_from_slice(&crc.to_le_bytes());
        raw.extend_from_slice(&payload);

        Ok(Self {
            metric,
            from: samples[0].timestamp,
            through: samples[samples.len() - 1].timestamp,
            encoded: raw.into(),
        })
    }

    /// Decode the sample payload, verifying magic and checksum.
    pub fn samples(&self) -> Result<Vec<Sample>, Error> {
        let raw = &self.encoded[..];
        if raw.len() < CHUNK_HEADER_SIZE {
            bail!("chunk data too small ({} bytes)", raw.len());
        }
        if raw[0..8] != CHUNK_SAMPLES_MAGIC_1_0 {
            bail!("wrong chunk magic number");
        }
        let expected_crc = u32::from_le_bytes(raw[8..12].try_into().unwrap());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&raw[12..]);
        if hasher.finalize() != expected_crc {
            bail!("chunk data has wrong CRC checksum");
        }

        let count = u32::from_le_bytes(raw[12..16].try_into().unwrap()) as usize;
        if raw.len() != CHUNK_HEADER_SIZE + count * SAMPLE_SIZE {
            bail!(
                "chunk sample count {} does not match payload size {}",
                count,
                raw.len()
            );
        }

        let mut samples = Vec::with_capacity(count);
        let mut offset = CHUNK_HEADER_SIZE;
        for _ in 0..count {
            let timestamp = i64::from_le_bytes(raw[offset..offset + 8].try_into().unwrap());
            let value = f64::from_le_bytes(raw[offset + 8..offset + 16].try_into().unwrap());
            samples.push(Sample { timestamp, value });
            offset += SAMPLE_SIZE;
        }
        Ok(samples)
    }

    /// Number of samples in the payload, without decoding it.
    pub fn sample_count(&self) -> Result<u32, Error> {
        let raw = &self.encoded[..];
        if raw.len() < CHUNK_HEADER_SIZE {
            bail!("chunk data too small ({} bytes)", raw.len());
        }
        if raw[0..8] != CHUNK_SAMPLES_MAGIC_1_0 {
            bail!("wrong chunk magic number");
        }
        Ok(u32::from_le_bytes(raw[12..16].try_into().unwrap()))
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded.len()
    }
}

/// Snap sample timestamps to whole-second multiples when the shift stays
/// within `tolerance_ms`.
///
/// Count, order and value association are preserved: a snap that would move
/// a sample before its predecessor is skipped. Returns true when any
/// timestamp changed.
pub fn align_timestamps(samples: &mut [Sample], tolerance_ms: i64) -> bool {
    if tolerance_ms <= 0 {
        return false;
    }
    let mut changed = false;
    let mut prev = i64::MIN;
    for sample in samples.iter_mut() {
        let rem = sample.timestamp.rem_euclid(1000);
        if rem != 0 {
            let down = sample.timestamp - rem;
            let aligned = if rem <= 500 { down } else { down + 1000 };
            if (aligned - sample.timestamp).abs() <= tolerance_ms && aligned >= prev {
                sample.timestamp = aligned;
                changed = true;
            }
        }
        prev = sample.timestamp;
    }
    changed
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::builder::labels::Label;

    fn metric() -> Labels {
        Labels::new(vec![
            Label::new("__name__", "up"),
            Label::new("job", "api"),
        ])
    }

    #[test]
    fn samples_survive_encode_decode() {
        let samples = vec![
            Sample { timestamp: 0, value: 1.0 },
            Sample { timestamp: 10_000, value: 2.5 },
            Sample { timestamp: 20_000, value: f64::NAN },
        ];
        let chunk = Chunk::from_samples(metric(), &samples).unwrap();
        assert_eq!(chunk.from, 0);
        assert_eq!(chunk.through, 20_000);

        let decoded = chunk.samples().unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], samples[0]);
        assert_eq!(decoded[1], samples[1]);
        assert!(decoded[2].value.is_nan());
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let chunk = Chunk::from_samples(metric(), &[Sample { timestamp: 5, value: 1.0 }]).unwrap();
        let mut raw = chunk.encoded.to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let bad = Chunk { encoded: raw.into(), ..chunk };
        let err = bad.samples().unwrap_err();
        assert!(err.to_string().contains("CRC"), "{}", err);
    }

    #[test]
    fn empty_chunk_is_rejected() {
        assert!(Chunk::from_samples(metric(), &[]).is_err());
    }

    #[test]
    fn alignment_respects_tolerance() {
        let mut samples = vec![
            Sample { timestamp: 999, value: 1.0 },
            Sample { timestamp: 10_400, value: 2.0 },
            Sample { timestamp: 20_000, value: 3.0 },
        ];
        let changed = align_timestamps(&mut samples, 5);
        assert!(changed);
        assert_eq!(samples[0].timestamp, 1000);
        // 400ms off, outside the 5ms tolerance
        assert_eq!(samples[1].timestamp, 10_400);
        assert_eq!(samples[2].timestamp, 20_000);
    }

    #[test]
    fn alignment_never_reorders() {
        let mut samples = vec![
            Sample { timestamp: 1_400, value: 1.0 },
            Sample { timestamp: 1_600, value: 2.0 },
        ];
        align_timestamps(&mut samples, 600);
        assert!(samples[0].timestamp <= samples[1].timestamp);
        assert_eq!(samples[1].value, 2.0);
    }

    #[test]
    fn zero_tolerance_is_a_no_op() {
        let mut samples = vec![Sample { timestamp: 999, value: 1.0 }];
        assert!(!align_timestamps(&mut samples, 0));
        assert_eq!(samples[0].timestamp, 999);
    }
}
