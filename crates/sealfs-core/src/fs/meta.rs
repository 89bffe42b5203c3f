//! Per-inode metadata and its on-disk record.
//!
//! Metadata holds the authoritative plaintext size and the master-key canary.
//! It is persisted as one extra chunk appended after the last data chunk, so
//! an encrypted file of `N` data chunks occupies `(N + 1) * chunk_size`
//! bytes. The plaintext of that chunk is a compact JSON record padded with
//! NUL bytes to exactly one block; parsers truncate at the first NUL.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors producing or consuming the metadata record.
#[derive(Error, Debug)]
pub enum MetaError {
    /// The serialized record would not fit in a single block.
    #[error("metadata record of {len} bytes does not fit one {block_size}-byte block")]
    TooLarge { len: usize, block_size: usize },

    /// The record could not be parsed.
    #[error("malformed metadata record: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The recorded key hash is not 32 bytes of hex.
    #[error("malformed key hash in metadata record")]
    MalformedKeyHash,
}

/// Authoritative per-inode state: plaintext size and key canary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// Plaintext length in bytes.
    pub size: u64,
    /// SHA-256 of the master key, verified on open of an existing file.
    pub key_hash: [u8; 32],
}

/// The JSON shape of the record; the key hash travels hex-encoded.
#[derive(Serialize, Deserialize)]
struct MetadataRecord {
    size: u64,
    #[serde(rename = "keyHash")]
    key_hash: String,
}

impl FileMetadata {
    pub fn new(size: u64, key_hash: [u8; 32]) -> Self {
        Self { size, key_hash }
    }

    /// Serialize to one NUL-padded block.
    ///
    /// # Errors
    ///
    /// [`MetaError::TooLarge`] if the record exceeds `block_size` bytes.
    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>, MetaError> {
        let record = MetadataRecord {
            size: self.size,
            key_hash: hex::encode(self.key_hash),
        };
        let mut encoded = serde_json::to_vec(&record)?;
        if encoded.len() > block_size {
            return Err(MetaError::TooLarge {
                len: encoded.len(),
                block_size,
            });
        }
        encoded.resize(block_size, 0);
        Ok(encoded)
    }

    /// Parse a decrypted metadata block, truncating at the first NUL.
    pub fn parse(block: &[u8]) -> Result<Self, MetaError> {
        let end = block.iter().position(|&b| b == 0).unwrap_or(block.len());
        let record: MetadataRecord = serde_json::from_slice(&block[..end])?;

        let bytes = hex::decode(&record.key_hash).map_err(|_| MetaError::MalformedKeyHash)?;
        let key_hash: [u8; 32] = bytes.try_into().map_err(|_| MetaError::MalformedKeyHash)?;

        Ok(Self {
            size: record.size,
            key_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileMetadata {
        FileMetadata::new(5000, [0xA5; 32])
    }

    #[test]
    fn encode_pads_to_one_block() {
        let block = sample().encode(4096).expect("encode");
        assert_eq!(block.len(), 4096);
        assert!(block.contains(&0), "record should be NUL-padded");
    }

    #[test]
    fn parse_round_trips() {
        let block = sample().encode(4096).expect("encode");
        assert_eq!(FileMetadata::parse(&block).expect("parse"), sample());
    }

    #[test]
    fn parse_stops_at_first_nul() {
        let mut block = sample().encode(4096).expect("encode");
        // Garbage after the NUL terminator must not confuse the parser.
        let len = block.len();
        block[len - 10..].fill(0xFF);
        block[len - 11] = 0;
        assert_eq!(FileMetadata::parse(&block).expect("parse"), sample());
    }

    #[test]
    fn oversized_record_rejected() {
        // A tiny block cannot hold the record.
        let err = sample().encode(16).unwrap_err();
        assert!(matches!(err, MetaError::TooLarge { block_size: 16, .. }));
    }

    #[test]
    fn worst_case_record_fits_the_minimum_block() {
        // The engine refuses block sizes below 128 precisely so that the
        // record always fits: 20 digits of u64::MAX plus 64 hex digits of
        // key hash is a 106-byte record.
        let meta = FileMetadata::new(u64::MAX, [0xFF; 32]);
        let block = meta.encode(128).expect("must fit the minimum block");
        assert_eq!(FileMetadata::parse(&block).expect("parse"), meta);
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            FileMetadata::parse(b"not json\0\0\0\0"),
            Err(MetaError::Malformed(_))
        ));
    }

    #[test]
    fn malformed_key_hash_rejected() {
        let block = br#"{"size":1,"keyHash":"abcd"}"#;
        assert!(matches!(
            FileMetadata::parse(block),
            Err(MetaError::MalformedKeyHash)
        ));
    }

    #[test]
    fn zero_sized_file_metadata() {
        let meta = FileMetadata::new(0, [0; 32]);
        let block = meta.encode(256).expect("encode");
        assert_eq!(FileMetadata::parse(&block).expect("parse"), meta);
    }
}
