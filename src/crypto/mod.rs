//! AES-128 primitives for the Bolt Card SUN message.
//!
//! A tap carries `p` (one AES block holding the card UID and tap counter)
//! and `c` (an 8 byte truncated CMAC). Only the constructions the card
//! protocol needs live here.

use aes::Aes128;
use cipher::{BlockDecrypt, KeyInit};
use cmac::{Cmac, Mac};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use subtle::ConstantTimeEq;

/// First plaintext byte of a valid `p` block.
pub const PICC_DATA_TAG: u8 = 0xC7;

/// Fixed prefix of the SV2 session vector.
pub const SV2_HEADER: [u8; 6] = [0x3c, 0xc3, 0x00, 0x01, 0x00, 0x80];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CryptoError {
    #[error("key must be 16 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("block must be 16 bytes, got {0}")]
    InvalidBlockLength(usize),
    #[error("uid must be 7 bytes, got {0}")]
    InvalidUidLength(usize),
    #[error("counter must be 3 bytes, got {0}")]
    InvalidCounterLength(usize),
    #[error("decrypted block does not carry the PICC data tag")]
    MissingPiccTag,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// A 16-byte AES key
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; 16]);

impl AesKey {
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&hex::decode(s)?)
    }

    #[cfg(test)]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

// Keys never end up in logs.
impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

impl fmt::Display for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Serialize for AesKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for AesKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A 7-byte card UID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardUid([u8; 7]);

impl CardUid {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 7] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidUidLength(bytes.len()))?;
        Ok(Self(arr))
    }

    #[cfg(test)]
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        Self::from_bytes(&hex::decode(s)?)
    }

    pub fn as_bytes(&self) -> &[u8; 7] {
        &self.0
    }
}

impl fmt::Display for CardUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Card tap counter. The card only has 24 bits for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Counter(u32);

impl Counter {
    pub const MAX: u32 = 0x00FF_FFFF;

    pub fn new(value: u32) -> Self {
        Self(value & Self::MAX)
    }

    /// Little-endian, as the card writes it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let [b0, b1, b2]: [u8; 3] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidCounterLength(bytes.len()))?;
        Ok(Self(u32::from(b2) << 16 | u32::from(b1) << 8 | u32::from(b0)))
    }

    pub fn to_bytes(&self) -> [u8; 3] {
        [
            (self.0 & 0xFF) as u8,
            ((self.0 >> 8) & 0xFF) as u8,
            ((self.0 >> 16) & 0xFF) as u8,
        ]
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// No later tap can carry a larger value; the card must be re-issued.
    pub fn is_exhausted(&self) -> bool {
        self.0 == Self::MAX
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// AES-128-CBC decryption of a single block with an all-zero IV.
///
/// With one block and a zero IV, CBC reduces to a raw block decryption.
/// Any 16 byte input decrypts to some block; callers judge validity by
/// the tag byte.
pub fn decrypt_block(key: &[u8], ciphertext: &[u8]) -> Result<[u8; 16], CryptoError> {
    let cipher =
        Aes128::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    let mut block: [u8; 16] = ciphertext
        .try_into()
        .map_err(|_| CryptoError::InvalidBlockLength(ciphertext.len()))?;

    cipher.decrypt_block((&mut block).into());
    Ok(block)
}

/// Split a decrypted `p` block into UID (bytes 1..8) and counter (bytes 8..11).
pub fn parse_picc_data(decrypted: &[u8; 16]) -> Result<(CardUid, Counter), CryptoError> {
    if decrypted[0] != PICC_DATA_TAG {
        return Err(CryptoError::MissingPiccTag);
    }

    let uid = CardUid::from_bytes(&decrypted[1..8])?;
    let counter = Counter::from_bytes(&decrypted[8..11])?;

    Ok((uid, counter))
}

/// SV2 = 3C C3 00 01 00 80 || UID (7) || counter (3, little-endian).
pub fn build_sv2(uid: &CardUid, counter: &Counter) -> [u8; 16] {
    let mut sv2 = [0u8; 16];
    sv2[..6].copy_from_slice(&SV2_HEADER);
    sv2[6..13].copy_from_slice(uid.as_bytes());
    sv2[13..16].copy_from_slice(&counter.to_bytes());
    sv2
}

fn cmac(key: &[u8], message: &[u8]) -> Result<[u8; 16], CryptoError> {
    let mut mac = <Cmac<Aes128> as Mac>::new_from_slice(key)
        .map_err(|_| CryptoError::InvalidKeyLength(key.len()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// The 8 byte tag the card emits as `c` for a given SV2 vector.
///
/// The session key is CMAC(key, sv2); the tag is CMAC(session key, "")
/// keeping only the bytes at odd offsets.
pub fn sun_mac(key: &[u8], sv2: &[u8]) -> Result<[u8; 8], CryptoError> {
    let session_key = cmac(key, sv2)?;
    let full = cmac(&session_key, &[])?;

    let mut truncated = [0u8; 8];
    for (i, byte) in truncated.iter_mut().enumerate() {
        *byte = full[2 * i + 1];
    }
    Ok(truncated)
}

/// Constant-time check of `presented_tag` against the SUN MAC of `sv2`.
pub fn verify_cmac(key: &[u8], sv2: &[u8], presented_tag: &[u8]) -> Result<bool, CryptoError> {
    let expected = sun_mac(key, sv2)?;
    Ok(expected[..].ct_eq(presented_tag).into())
}

/// Constant-time equality for short secrets such as PINs and tokens.
pub fn secrets_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Fresh 128-bit random value, hex encoded.
pub fn random_hex() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
