//! Sealing of aggregations: compress, then encrypt.
//!
//! The sealed form is `[codec tag: 1][nonce: 12][ciphertext]`. The tag
//! names the compression codec so a decoder never has to guess, and the
//! nonce (derived from the digest of the plaintext) rides along in the
//! clear, as nonces do.

use crate::{Digest, Error};
use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes256,
};
use bytes::{BufMut, Bytes, BytesMut};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Bytes of the plaintext digest used as the CTR nonce.
const NONCE_LEN: usize = 12;

/// The symmetric key protecting aggregations at rest.
#[derive(Clone)]
pub struct Key([u8; 32]);

impl Key {
    pub fn new(key: [u8; 32]) -> Self {
        Self(key)
    }

    /// Builds a key from raw bytes, which must be exactly 32 bytes long.
    pub fn from_slice(raw: &[u8]) -> Result<Self, Error> {
        let key: [u8; 32] = raw.try_into().map_err(|_| Error::InvalidKey(raw.len()))?;
        Ok(Self(key))
    }
}

/// The compression codec applied before encryption.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Xz,
}

impl Compression {
    fn to_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Lz4 => 1,
            Self::Xz => 2,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, Error> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            2 => Ok(Self::Xz),
            _ => Err(Error::Compression(format!("unknown codec tag {raw}"))),
        }
    }
}

/// Seals a serialized aggregation whose plaintext digest is `digest`.
pub fn seal(
    key: &Key,
    compression: Compression,
    digest: &Digest,
    plain: &[u8],
) -> Result<Bytes, Error> {
    let mut compressed = compress(compression, plain)?;

    let nonce: [u8; NONCE_LEN] = digest.as_ref()[..NONCE_LEN]
        .try_into()
        .expect("digest is 32 bytes");
    let mut cipher = Aes256Ctr::new(&key.0.into(), &iv(&nonce).into());
    cipher.apply_keystream(&mut compressed);

    let mut sealed = BytesMut::with_capacity(1 + NONCE_LEN + compressed.len());
    sealed.put_u8(compression.to_u8());
    sealed.put_slice(&nonce);
    sealed.put_slice(&compressed);
    Ok(sealed.freeze())
}

/// Reverses [seal].
pub fn unseal(key: &Key, sealed: &[u8]) -> Result<Bytes, Error> {
    if sealed.len() < 1 + NONCE_LEN {
        return Err(Error::Compression("sealed payload too short".to_string()));
    }
    let compression = Compression::from_u8(sealed[0])?;
    let nonce: [u8; NONCE_LEN] = sealed[1..1 + NONCE_LEN]
        .try_into()
        .expect("length checked above");

    let mut compressed = sealed[1 + NONCE_LEN..].to_vec();
    let mut cipher = Aes256Ctr::new(&key.0.into(), &iv(&nonce).into());
    cipher.apply_keystream(&mut compressed);

    decompress(compression, &compressed)
}

fn iv(nonce: &[u8; NONCE_LEN]) -> [u8; 16] {
    // 12-byte nonce, 4-byte counter starting at zero.
    let mut iv = [0u8; 16];
    iv[..NONCE_LEN].copy_from_slice(nonce);
    iv
}

fn compress(compression: Compression, plain: &[u8]) -> Result<Vec<u8>, Error> {
    match compression {
        Compression::None => Ok(plain.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(plain)),
        Compression::Xz => {
            let mut out = Vec::new();
            lzma_rs::xz_compress(&mut &plain[..], &mut out)
                .map_err(|err| Error::Compression(err.to_string()))?;
            Ok(out)
        }
    }
}

fn decompress(compression: Compression, compressed: &[u8]) -> Result<Bytes, Error> {
    match compression {
        Compression::None => Ok(Bytes::copy_from_slice(compressed)),
        Compression::Lz4 => lz4_flex::decompress_size_prepended(compressed)
            .map(Bytes::from)
            .map_err(|err| Error::Compression(err.to_string())),
        Compression::Xz => {
            let mut out = Vec::new();
            lzma_rs::xz_decompress(&mut &compressed[..], &mut out)
                .map_err(|err| Error::Compression(format!("{err:?}")))?;
            Ok(Bytes::from(out))
        }
    }
}
