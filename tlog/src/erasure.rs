//! Reed-Solomon sharding of sealed aggregations.
//!
//! A payload is split into `data` equal shards (length-prefixed and
//! zero-padded), extended with `parity` parity shards. Any `data` of the
//! `data + parity` shards recover the payload.

use crate::Error;
use bytes::Bytes;
use reed_solomon_erasure::galois_8::ReedSolomon;

/// The erasure-coding shape: `data` (K) + `parity` (M).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Coding {
    pub data: usize,
    pub parity: usize,
}

impl Coding {
    pub fn new(data: usize, parity: usize) -> Self {
        Self { data, parity }
    }

    /// Total shards per object.
    pub fn total(&self) -> usize {
        self.data + self.parity
    }
}

impl Default for Coding {
    fn default() -> Self {
        Self { data: 4, parity: 2 }
    }
}

/// Splits `payload` into `coding.total()` shards.
pub fn shard(coding: Coding, payload: &[u8]) -> Result<Vec<Bytes>, Error> {
    let coder = ReedSolomon::new(coding.data, coding.parity)
        .map_err(|err| Error::Erasure(format!("{err:?}")))?;

    // Length prefix so reconstruction can strip the padding.
    let prefixed_len = 4 + payload.len();
    let shard_len = prefixed_len.div_ceil(coding.data).max(1);
    let mut shards = vec![vec![0u8; shard_len]; coding.total()];
    let mut prefixed = Vec::with_capacity(prefixed_len);
    prefixed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    prefixed.extend_from_slice(payload);
    for (index, chunk) in prefixed.chunks(shard_len).enumerate() {
        shards[index][..chunk.len()].copy_from_slice(chunk);
    }

    coder
        .encode(&mut shards)
        .map_err(|err| Error::Erasure(format!("{err:?}")))?;
    Ok(shards.into_iter().map(Bytes::from).collect())
}

/// Recovers the payload from at least `coding.data` present shards.
pub fn reconstruct(coding: Coding, mut shards: Vec<Option<Vec<u8>>>) -> Result<Bytes, Error> {
    if shards.len() != coding.total() {
        return Err(Error::Erasure(format!(
            "expected {} shards, got {}",
            coding.total(),
            shards.len()
        )));
    }
    let coder = ReedSolomon::new(coding.data, coding.parity)
        .map_err(|err| Error::Erasure(format!("{err:?}")))?;
    coder
        .reconstruct(&mut shards)
        .map_err(|err| Error::Erasure(format!("{err:?}")))?;

    let mut prefixed = Vec::new();
    for shard in shards.into_iter().take(coding.data) {
        prefixed.extend_from_slice(&shard.expect("reconstructed shard present"));
    }
    if prefixed.len() < 4 {
        return Err(Error::Erasure("payload shorter than its prefix".to_string()));
    }
    let len = u32::from_be_bytes(prefixed[..4].try_into().expect("4-byte prefix")) as usize;
    if prefixed.len() < 4 + len {
        return Err(Error::Erasure("payload truncated".to_string()));
    }
    prefixed.drain(..4);
    prefixed.truncate(len);
    Ok(Bytes::from(prefixed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let coding = Coding::new(4, 2);
        let payload = b"an aggregation worth of bytes, definitely not shard-aligned".to_vec();
        let shards = shard(coding, &payload).unwrap();
        assert_eq!(shards.len(), 6);
        assert!(shards.iter().all(|shard| shard.len() == shards[0].len()));

        let present = shards.iter().map(|shard| Some(shard.to_vec())).collect();
        assert_eq!(reconstruct(coding, present).unwrap().as_ref(), payload);
    }

    #[test]
    fn test_recovers_with_parity_shards_missing() {
        let coding = Coding::new(4, 2);
        let payload = vec![42u8; 1000];
        let shards = shard(coding, &payload).unwrap();

        // Drop any two shards; the rest recover the payload.
        for (a, b) in [(0, 1), (0, 5), (4, 5), (2, 3)] {
            let present: Vec<Option<Vec<u8>>> = shards
                .iter()
                .enumerate()
                .map(|(index, shard)| (index != a && index != b).then(|| shard.to_vec()))
                .collect();
            assert_eq!(reconstruct(coding, present).unwrap().as_ref(), payload);
        }
    }

    #[test]
    fn test_too_many_missing() {
        let coding = Coding::new(2, 1);
        let payload = vec![1u8; 100];
        let shards = shard(coding, &payload).unwrap();
        let present = vec![Some(shards[0].to_vec()), None, None];
        assert!(matches!(
            reconstruct(coding, present),
            Err(Error::Erasure(_))
        ));
    }

    #[test]
    fn test_empty_payload() {
        let coding = Coding::new(3, 2);
        let shards = shard(coding, &[]).unwrap();
        let present = shards.iter().map(|shard| Some(shard.to_vec())).collect();
        assert_eq!(reconstruct(coding, present).unwrap().len(), 0);
    }
}
