//! Symmetric packet codec
//!
//! Two cipher suites are supported:
//!
//! - `aes-cbc`: AES-128/192/256 in CBC mode picked by key length, PKCS#7 padded.
//!   Wire layout: `[16: IV] [N*16: ciphertext]`.
//! - `chacha20-poly1305`: 32-byte key, AEAD.
//!   Wire layout: `[12: nonce] [N: ciphertext] [16: tag]`.
//!
//! IVs and nonces are random per call, so two encryptions of the same
//! plaintext differ. Inputs are never modified; every call returns a new buffer.

use std::fmt;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::CodecError;

const AES_BLOCK: usize = 16;
const CHACHA_KEY: usize = 32;
const CHACHA_NONCE: usize = 12;
const CHACHA_TAG: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Cipher suite used for the tunnel payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CipherSuite {
    #[default]
    #[serde(rename = "aes-cbc")]
    AesCbc,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::AesCbc => "aes-cbc",
            CipherSuite::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    /// Key lengths (in bytes) this suite accepts
    pub fn key_lengths(&self) -> &'static [usize] {
        match self {
            CipherSuite::AesCbc => &[16, 24, 32],
            CipherSuite::ChaCha20Poly1305 => &[CHACHA_KEY],
        }
    }

    /// Largest number of bytes encryption can add to a plaintext
    pub fn max_overhead(&self) -> usize {
        match self {
            // IV plus up to a full block of padding
            CipherSuite::AesCbc => AES_BLOCK * 2,
            CipherSuite::ChaCha20Poly1305 => CHACHA_NONCE + CHACHA_TAG,
        }
    }

    pub fn check_key_len(&self, len: usize) -> Result<(), CodecError> {
        if self.key_lengths().contains(&len) {
            Ok(())
        } else {
            Err(CodecError::InvalidKeyLength {
                len,
                suite: self.name(),
            })
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Secret key bytes. Not cloneable; wiped on drop.
pub struct KeyMaterial {
    bytes: Vec<u8>,
}

impl KeyMaterial {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Decode a hex string (surrounding whitespace ignored)
    pub fn from_hex(encoded: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(encoded.trim()).map(Self::new)
    }

    /// Generate a random key of `len` bytes
    pub fn generate(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill(bytes.as_mut_slice());
        Self::new(bytes)
    }

    /// Hex form, for writing freshly generated keys out
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial([redacted; {}])", self.bytes.len())
    }
}

/// A cipher suite bound to its key. The key is validated once here.
#[derive(Debug)]
pub struct Codec {
    suite: CipherSuite,
    key: KeyMaterial,
}

impl Codec {
    pub fn new(suite: CipherSuite, key: KeyMaterial) -> Result<Self, CodecError> {
        suite.check_key_len(key.len())?;
        Ok(Self { suite, key })
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn max_overhead(&self) -> usize {
        self.suite.max_overhead()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        encrypt(self.suite, plaintext, self.key.as_bytes())
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CodecError> {
        decrypt(self.suite, ciphertext, self.key.as_bytes())
    }
}

/// Encrypt `plaintext` under `key`, returning a new buffer
pub fn encrypt(suite: CipherSuite, plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CodecError> {
    suite.check_key_len(key.len())?;
    match suite {
        CipherSuite::AesCbc => aes_cbc_encrypt(plaintext, key),
        CipherSuite::ChaCha20Poly1305 => chacha_encrypt(plaintext, key),
    }
}

/// Decrypt `ciphertext` under `key`, returning a new buffer
pub fn decrypt(suite: CipherSuite, ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CodecError> {
    suite.check_key_len(key.len())?;
    match suite {
        CipherSuite::AesCbc => aes_cbc_decrypt(ciphertext, key),
        CipherSuite::ChaCha20Poly1305 => chacha_decrypt(ciphertext, key),
    }
}

fn invalid_key(key: &[u8], suite: CipherSuite) -> CodecError {
    CodecError::InvalidKeyLength {
        len: key.len(),
        suite: suite.name(),
    }
}

fn aes_cbc_encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CodecError> {
    let iv: [u8; AES_BLOCK] = rand::thread_rng().gen();
    let msg_len = plaintext.len();
    let padded_len = (msg_len / AES_BLOCK + 1) * AES_BLOCK;

    let mut out = vec![0u8; AES_BLOCK + padded_len];
    out[..AES_BLOCK].copy_from_slice(&iv);
    out[AES_BLOCK..AES_BLOCK + msg_len].copy_from_slice(plaintext);
    let body = &mut out[AES_BLOCK..];

    let bad_key = |_| invalid_key(key, CipherSuite::AesCbc);
    // The buffer always has room for a full padding block
    let sealed = match key.len() {
        16 => Aes128CbcEnc::new_from_slices(key, &iv)
            .map_err(bad_key)?
            .encrypt_padded_mut::<Pkcs7>(body, msg_len)
            .map(|c| c.len()),
        24 => Aes192CbcEnc::new_from_slices(key, &iv)
            .map_err(bad_key)?
            .encrypt_padded_mut::<Pkcs7>(body, msg_len)
            .map(|c| c.len()),
        32 => Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(bad_key)?
            .encrypt_padded_mut::<Pkcs7>(body, msg_len)
            .map(|c| c.len()),
        _ => return Err(invalid_key(key, CipherSuite::AesCbc)),
    };
    let sealed = sealed.map_err(|_| CodecError::CorruptCiphertext)?;
    out.truncate(AES_BLOCK + sealed);
    Ok(out)
}

fn aes_cbc_decrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() < AES_BLOCK * 2 || data.len() % AES_BLOCK != 0 {
        return Err(CodecError::CorruptCiphertext);
    }
    let (iv, body) = data.split_at(AES_BLOCK);
    let mut buffer = body.to_vec();

    let bad_key = |_| invalid_key(key, CipherSuite::AesCbc);
    let opened = match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map(|p| p.len()),
        24 => Aes192CbcDec::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map(|p| p.len()),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(bad_key)?
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map(|p| p.len()),
        _ => return Err(invalid_key(key, CipherSuite::AesCbc)),
    };
    let len = opened.map_err(|_| CodecError::CorruptCiphertext)?;
    buffer.truncate(len);
    Ok(buffer)
}

fn chacha_encrypt(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CodecError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| invalid_key(key, CipherSuite::ChaCha20Poly1305))?;
    let mut nonce = [0u8; CHACHA_NONCE];
    rand::thread_rng().fill(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CodecError::CorruptCiphertext)?;

    let mut out = Vec::with_capacity(CHACHA_NONCE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn chacha_decrypt(data: &[u8], key: &[u8]) -> Result<Vec<u8>, CodecError> {
    if data.len() < CHACHA_NONCE + CHACHA_TAG {
        return Err(CodecError::CorruptCiphertext);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| invalid_key(key, CipherSuite::ChaCha20Poly1305))?;
    let (nonce, sealed) = data.split_at(CHACHA_NONCE);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CodecError::CorruptCiphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY16: [u8; 16] = *b"0123456789abcdef";

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_aes_round_trip_all_key_sizes() {
        for key_len in [16, 24, 32] {
            let key = vec![0x42u8; key_len];
            for len in [0, 1, 15, 16, 17, 40, 1400] {
                let plain = sample(len);
                let sealed = encrypt(CipherSuite::AesCbc, &plain, &key).unwrap();
                assert_eq!(sealed.len(), AES_BLOCK + (len / AES_BLOCK + 1) * AES_BLOCK);
                assert!(sealed.len() - len <= CipherSuite::AesCbc.max_overhead());
                let opened = decrypt(CipherSuite::AesCbc, &sealed, &key).unwrap();
                assert_eq!(opened, plain);
            }
        }
    }

    #[test]
    fn test_chacha_round_trip() {
        let key = [7u8; 32];
        for len in [0, 1, 40, 1400] {
            let plain = sample(len);
            let sealed = encrypt(CipherSuite::ChaCha20Poly1305, &plain, &key).unwrap();
            assert_eq!(sealed.len(), len + CipherSuite::ChaCha20Poly1305.max_overhead());
            let opened = decrypt(CipherSuite::ChaCha20Poly1305, &sealed, &key).unwrap();
            assert_eq!(opened, plain);
        }
    }

    #[test]
    fn test_encryption_uses_fresh_iv() {
        let plain = sample(40);
        let a = encrypt(CipherSuite::AesCbc, &plain, &KEY16).unwrap();
        let b = encrypt(CipherSuite::AesCbc, &plain, &KEY16).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_invalid_key_length() {
        for len in [0, 8, 15, 17, 33] {
            let key = vec![1u8; len];
            assert_eq!(
                encrypt(CipherSuite::AesCbc, b"data", &key),
                Err(CodecError::InvalidKeyLength { len, suite: "aes-cbc" })
            );
            assert_eq!(
                decrypt(CipherSuite::AesCbc, &[0u8; 32], &key),
                Err(CodecError::InvalidKeyLength { len, suite: "aes-cbc" })
            );
        }
        assert!(matches!(
            encrypt(CipherSuite::ChaCha20Poly1305, b"data", &KEY16),
            Err(CodecError::InvalidKeyLength { len: 16, .. })
        ));
        assert!(Codec::new(CipherSuite::ChaCha20Poly1305, KeyMaterial::new(KEY16.to_vec())).is_err());
    }

    #[test]
    fn test_aes_rejects_misaligned_or_short_input() {
        let sealed = encrypt(CipherSuite::AesCbc, &sample(40), &KEY16).unwrap();
        assert_eq!(
            decrypt(CipherSuite::AesCbc, &sealed[..sealed.len() - 1], &KEY16),
            Err(CodecError::CorruptCiphertext)
        );
        assert_eq!(
            decrypt(CipherSuite::AesCbc, &sealed[..AES_BLOCK], &KEY16),
            Err(CodecError::CorruptCiphertext)
        );
    }

    #[test]
    fn test_aes_rejects_bad_padding() {
        // Empty plaintext: one block of 0x10 padding. Flipping the IV's last
        // byte by 0x10 turns the final pad byte into 0x00, which is invalid.
        let mut sealed = encrypt(CipherSuite::AesCbc, &[], &KEY16).unwrap();
        assert_eq!(sealed.len(), 2 * AES_BLOCK);
        sealed[AES_BLOCK - 1] ^= 0x10;
        assert_eq!(
            decrypt(CipherSuite::AesCbc, &sealed, &KEY16),
            Err(CodecError::CorruptCiphertext)
        );
    }

    #[test]
    fn test_chacha_rejects_tampering() {
        let key = [9u8; 32];
        let mut sealed = encrypt(CipherSuite::ChaCha20Poly1305, &sample(40), &key).unwrap();
        sealed[20] ^= 0x01;
        assert_eq!(
            decrypt(CipherSuite::ChaCha20Poly1305, &sealed, &key),
            Err(CodecError::CorruptCiphertext)
        );
        assert_eq!(
            decrypt(CipherSuite::ChaCha20Poly1305, &sealed[..10], &key),
            Err(CodecError::CorruptCiphertext)
        );
    }

    #[test]
    fn test_codec_wraps_key() {
        let codec = Codec::new(CipherSuite::AesCbc, KeyMaterial::new(KEY16.to_vec())).unwrap();
        let sealed = codec.encrypt(b"inner packet").unwrap();
        assert_eq!(codec.decrypt(&sealed).unwrap(), b"inner packet");
        assert_eq!(format!("{:?}", codec.key), "KeyMaterial([redacted; 16])");
    }

    #[test]
    fn test_key_hex_round_trip() {
        let key = KeyMaterial::generate(24);
        let parsed = KeyMaterial::from_hex(&format!("  {}\n", key.to_hex())).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
        assert!(KeyMaterial::from_hex("zz").is_err());
    }

    #[test]
    fn test_suite_serde_names() {
        #[derive(Deserialize)]
        struct Wrap {
            cipher: CipherSuite,
        }
        let w: Wrap = toml::from_str(r#"cipher = "chacha20-poly1305""#).unwrap();
        assert_eq!(w.cipher, CipherSuite::ChaCha20Poly1305);
        let w: Wrap = toml::from_str(r#"cipher = "aes-cbc""#).unwrap();
        assert_eq!(w.cipher, CipherSuite::AesCbc);
    }
}
