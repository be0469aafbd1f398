//! Wide-block cipher: deterministic, length-preserving encryption of a
//! mesoblock-sized buffer keyed by (seqno, slot, macro-id) via the IV.
//!
//! Modes are named `MODE(PRIMITIVE)`. AES-256 is the only primitive
//! implemented (chosen by its 32-byte key length). `CBC_ESSIV` is the
//! recommended mode; `NULL` is passthrough, for tests only.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::api::{Iv, AES256_KEY_LEN, CIPHER_BLOCK_LEN};
use crate::error::{Error, Result};
use crate::keymat::KeyMaterial;

pub trait WideBlockCipher: Send + Sync {
    /// Encrypts `buf` in place. `buf.len()` must be a multiple of the cipher block size.
    fn encrypt(&self, buf: &mut [u8], iv: Iv);
    /// Decrypts `buf` in place.
    fn decrypt(&self, buf: &mut [u8], iv: Iv);
}

/// Passthrough cipher, for testing the rest of the pipeline without the
/// cost (or the opacity) of real encryption.
pub struct NullCipher;

impl WideBlockCipher for NullCipher {
    fn encrypt(&self, _buf: &mut [u8], _iv: Iv) {}
    fn decrypt(&self, _buf: &mut [u8], _iv: Iv) {}
}

struct AesBlockCipher(Aes256);

impl AesBlockCipher {
    fn new(key: &[u8]) -> Result<Self> {
        if key.len() != AES256_KEY_LEN {
            return Err(Error::config(format!(
                "AES256 requires a {AES256_KEY_LEN}-byte key, got {}",
                key.len()
            )));
        }
        Ok(AesBlockCipher(Aes256::new(key.into())))
    }

    fn encrypt_block(&self, block: &mut [u8; CIPHER_BLOCK_LEN]) {
        let mut ga = aes::Block::clone_from_slice(block);
        self.0.encrypt_block(&mut ga);
        block.copy_from_slice(&ga);
    }

    fn decrypt_block(&self, block: &mut [u8; CIPHER_BLOCK_LEN]) {
        let mut ga = aes::Block::clone_from_slice(block);
        self.0.decrypt_block(&mut ga);
        block.copy_from_slice(&ga);
    }
}

/// CBC chained across the whole mesoblock, IV taken literally.
pub struct CbcPlain {
    cipher: AesBlockCipher,
}

impl CbcPlain {
    pub fn new(key: &[u8]) -> Result<Self> { Ok(CbcPlain { cipher: AesBlockCipher::new(key)? }) }

    fn encrypt_with_iv(&self, buf: &mut [u8], iv: [u8; CIPHER_BLOCK_LEN]) {
        assert_eq!(buf.len() % CIPHER_BLOCK_LEN, 0, "buffer is not a multiple of the block size");
        let mut prev = iv;
        for chunk in buf.chunks_mut(CIPHER_BLOCK_LEN) {
            let mut block = [0u8; CIPHER_BLOCK_LEN];
            block.copy_from_slice(chunk);
            for i in 0..CIPHER_BLOCK_LEN { block[i] ^= prev[i]; }
            self.cipher.encrypt_block(&mut block);
            chunk.copy_from_slice(&block);
            prev = block;
        }
    }

    fn decrypt_with_iv(&self, buf: &mut [u8], iv: [u8; CIPHER_BLOCK_LEN]) {
        assert_eq!(buf.len() % CIPHER_BLOCK_LEN, 0, "buffer is not a multiple of the block size");
        let mut prev = iv;
        for chunk in buf.chunks_mut(CIPHER_BLOCK_LEN) {
            let mut ciphertext = [0u8; CIPHER_BLOCK_LEN];
            ciphertext.copy_from_slice(chunk);
            let mut block = ciphertext;
            self.cipher.decrypt_block(&mut block);
            for i in 0..CIPHER_BLOCK_LEN { block[i] ^= prev[i]; }
            chunk.copy_from_slice(&block);
            prev = ciphertext;
        }
    }
}

impl WideBlockCipher for CbcPlain {
    fn encrypt(&self, buf: &mut [u8], iv: Iv) { self.encrypt_with_iv(buf, iv.to_bytes()); }
    fn decrypt(&self, buf: &mut [u8], iv: Iv) { self.decrypt_with_iv(buf, iv.to_bytes()); }
}

/// Identical to `CBC_PLAIN`, except the IV is first encrypted under a key
/// derived as SHA-256 of the user key, then used as the real IV.
pub struct CbcEssiv {
    plain: CbcPlain,
    essiv: AesBlockCipher,
}

impl CbcEssiv {
    pub fn new(key: &[u8]) -> Result<Self> {
        let plain = CbcPlain::new(key)?;
        let mut hasher = Sha256::new();
        hasher.update(key);
        let essiv_key: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());
        let essiv = AesBlockCipher::new(&essiv_key[..])?;
        Ok(CbcEssiv { plain, essiv })
    }

    fn derive_iv(&self, iv: Iv) -> [u8; CIPHER_BLOCK_LEN] {
        let mut ivb = iv.to_bytes();
        self.essiv.encrypt_block(&mut ivb);
        ivb
    }
}

impl WideBlockCipher for CbcEssiv {
    fn encrypt(&self, buf: &mut [u8], iv: Iv) {
        let derived = self.derive_iv(iv);
        self.plain.encrypt_with_iv(buf, derived);
    }
    fn decrypt(&self, buf: &mut [u8], iv: Iv) {
        let derived = self.derive_iv(iv);
        self.plain.decrypt_with_iv(buf, derived);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Null,
    CbcPlain,
    CbcEssiv,
}

/// A parsed `MODE(PRIMITIVE)` cipher spec string, e.g. `"CBC_ESSIV(AES256)"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherSpec {
    pub mode: CipherMode,
    pub primitive: String,
}

impl CipherSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (mode_str, primitive) = match spec.find('(') {
            Some(open) => {
                if !spec.ends_with(')') {
                    return Err(Error::config(format!("malformed cipher spec '{spec}'")));
                }
                (&spec[..open], spec[open + 1..spec.len() - 1].to_string())
            }
            None => (spec, "AES256".to_string()),
        };
        let mode = match mode_str {
            "NULL" => CipherMode::Null,
            "CBC_PLAIN" => CipherMode::CbcPlain,
            "CBC_ESSIV" => CipherMode::CbcEssiv,
            other => return Err(Error::config(format!("unknown cipher mode '{other}'"))),
        };
        if primitive != "AES256" {
            return Err(Error::config(format!(
                "unsupported cipher primitive '{primitive}'; only AES256 is implemented"
            )));
        }
        Ok(CipherSpec { mode, primitive })
    }

    pub fn build(&self, key: &[u8]) -> Result<Box<dyn WideBlockCipher>> {
        // the primitive determines the required key length regardless of mode,
        // so a malformed key is rejected even under NULL.
        if key.len() != AES256_KEY_LEN {
            return Err(Error::config(format!(
                "{} requires a {AES256_KEY_LEN}-byte key, got {}",
                self.primitive,
                key.len()
            )));
        }
        match self.mode {
            CipherMode::Null => Ok(Box::new(NullCipher)),
            CipherMode::CbcPlain => Ok(Box::new(CbcPlain::new(key)?)),
            CipherMode::CbcEssiv => Ok(Box::new(CbcEssiv::new(key)?)),
        }
    }

    /// Same as [`Self::build`], but takes the key already copied into
    /// locked, zeroize-on-drop storage rather than a bare slice — the path
    /// every caller holding a real partition passphrase should use.
    pub fn build_from_key_material(&self, key: &KeyMaterial) -> Result<Box<dyn WideBlockCipher>> {
        self.build(key.as_bytes())
    }
}

impl Default for CipherSpec {
    fn default() -> Self { CipherSpec { mode: CipherMode::CbcEssiv, primitive: "AES256".to_string() } }
}

impl std::fmt::Display for CipherSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            CipherMode::Null => "NULL",
            CipherMode::CbcPlain => "CBC_PLAIN",
            CipherMode::CbcEssiv => "CBC_ESSIV",
        };
        write!(f, "{mode}({})", self.primitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key32(b: u8) -> Vec<u8> { vec![b; AES256_KEY_LEN] }

    #[test]
    fn cbc_plain_round_trips() {
        let c = CbcPlain::new(&key32(0x41)).unwrap();
        let mut buf = vec![0xAAu8; 64];
        let orig = buf.clone();
        c.encrypt(&mut buf, Iv::data(1, 2, 3));
        assert_ne!(buf, orig);
        c.decrypt(&mut buf, Iv::data(1, 2, 3));
        assert_eq!(buf, orig);
    }

    #[test]
    fn cbc_essiv_round_trips_and_differs_from_plain() {
        let key = key32(0x41);
        let essiv = CbcEssiv::new(&key).unwrap();
        let plain = CbcPlain::new(&key).unwrap();
        let mut buf = vec![0x11u8; 32];
        let orig = buf.clone();
        essiv.encrypt(&mut buf, Iv::index(7));
        let mut plain_buf = orig.clone();
        plain.encrypt(&mut plain_buf, Iv::index(7));
        assert_ne!(buf, plain_buf, "ESSIV must not reuse the literal IV");
        essiv.decrypt(&mut buf, Iv::index(7));
        assert_eq!(buf, orig);
    }

    #[test]
    fn iv_uniqueness_changes_ciphertext() {
        let c = CbcEssiv::new(&key32(0x41)).unwrap();
        let mut a = vec![0x00u8; 32];
        let mut b = a.clone();
        c.encrypt(&mut a, Iv::data(1, 1, 0));
        c.encrypt(&mut b, Iv::data(1, 2, 0));
        assert_ne!(a, b);
    }

    #[test]
    fn null_cipher_is_passthrough_but_still_validates_key_length() {
        let spec = CipherSpec::parse("NULL(AES256)").unwrap();
        assert!(spec.build(&[0x41]).is_err());
        let cipher = spec.build(&key32(0x41)).unwrap();
        let mut buf = vec![5u8; 16];
        cipher.encrypt(&mut buf, Iv::index(0));
        assert_eq!(buf, vec![5u8; 16]);
    }

    #[test]
    fn parses_cipher_specs() {
        assert_eq!(CipherSpec::parse("CBC_ESSIV(AES256)").unwrap().mode, CipherMode::CbcEssiv);
        assert_eq!(CipherSpec::parse("CBC_PLAIN(AES256)").unwrap().mode, CipherMode::CbcPlain);
        assert!(CipherSpec::parse("CBC_ESSIV(AES128)").is_err());
        assert!(CipherSpec::parse("GARBAGE").is_err());
    }
}
