//! Key transcoders turn stored values into [Id] keys.

use std::fmt::Debug;

use bytes::Bytes;
use sha1_smol::Sha1;
use sha3::{
    digest::{ExtendableOutput, Update, XofReader},
    Shake256,
};

use crate::common::Id;

/// Encode data as a key usable in the DHT, and decode a key back to its raw bytes.
pub trait KeyTranscoder: Send + Sync + Debug {
    /// Derive the key for `data`.
    fn encode(&self, data: &[u8]) -> Id;

    /// Raw bytes of a key.
    fn decode(&self, key: &Id) -> Bytes {
        Bytes::copy_from_slice(key.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// 160 bits keys from the SHA-1 digest of the value.
pub struct Sha1Transcoder;

impl KeyTranscoder for Sha1Transcoder {
    fn encode(&self, data: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(data);

        hasher.digest().bytes().into()
    }
}

#[derive(Debug, Clone, Copy)]
/// Variable length keys from a SHAKE-256 extendable output.
pub struct Shake256Transcoder {
    output_size: usize,
}

impl Shake256Transcoder {
    /// Create a transcoder producing `output_size` bytes keys.
    ///
    /// # Panics
    ///
    /// If `output_size` is zero.
    pub fn new(output_size: usize) -> Self {
        assert!(output_size > 0, "Shake256Transcoder output_size is zero");

        Self { output_size }
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }
}

impl KeyTranscoder for Shake256Transcoder {
    fn encode(&self, data: &[u8]) -> Id {
        let mut hasher = Shake256::default();
        hasher.update(data);

        let mut output = vec![0; self.output_size];
        hasher.finalize_xof().read(&mut output);

        Id::from_digest(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sha1_transcoder() {
        let key = Sha1Transcoder.encode(b"hello");

        assert_eq!(key.to_string(), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(key.bits(), 160);
        assert_eq!(Sha1Transcoder.decode(&key).as_ref(), key.as_bytes());
    }

    #[test]
    fn shake256_transcoder() {
        let table = [(1, "b8"), (10, "b8d01df855f7075882c6")];

        for (output_size, expected) in table {
            let transcoder = Shake256Transcoder::new(output_size);
            let key = transcoder.encode(&[0]);

            assert_eq!(key.to_string(), expected);
            assert_eq!(key.len(), output_size);
        }
    }
}
