//! Key hygiene: partition keys are copied into locked memory when possible
//! and wiped with a compiler-resistant fill after use (§4.1).

use zeroize::Zeroizing;

use crate::api::AES256_KEY_LEN;
use crate::error::{Error, Result};

/// A 32-byte partition key, held in `Zeroizing` storage so it is wiped on
/// drop, best-effort `mlock`'d on unix so it is never paged to swap.
pub struct KeyMaterial {
    bytes: Zeroizing<[u8; 32]>,
    #[cfg(unix)]
    locked: bool,
}

impl KeyMaterial {
    pub fn new(key: [u8; 32]) -> Self {
        let bytes = Zeroizing::new(key);
        #[cfg(unix)]
        {
            let locked = unsafe { libc::mlock(bytes.as_ptr() as *const libc::c_void, bytes.len()) == 0 };
            if !locked {
                log::debug!("mlock on partition key failed; continuing without it");
            }
            KeyMaterial { bytes, locked }
        }
        #[cfg(not(unix))]
        {
            KeyMaterial { bytes }
        }
    }

    /// Copies a caller-supplied key slice into locked storage. The caller's
    /// own slice (e.g. decoded straight from control-protocol hex, or a
    /// registry argument) is not itself wiped; only this copy is.
    pub fn from_slice(key: &[u8]) -> Result<Self> {
        if key.len() != AES256_KEY_LEN {
            return Err(Error::config(format!("expected a {AES256_KEY_LEN}-byte key, got {}", key.len())));
        }
        let mut fixed = [0u8; AES256_KEY_LEN];
        fixed.copy_from_slice(key);
        Ok(KeyMaterial::new(fixed))
    }

    pub fn as_bytes(&self) -> &[u8] { &self.bytes[..] }
}

#[cfg(unix)]
impl Drop for KeyMaterial {
    fn drop(&mut self) {
        if self.locked {
            unsafe {
                libc::munlock(self.bytes.as_ptr() as *const libc::c_void, self.bytes.len());
            }
        }
        // `Zeroizing` wipes `bytes` itself once this drop returns.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_the_bytes_it_was_given() {
        let k = KeyMaterial::new([0x41; 32]);
        assert_eq!(k.as_bytes(), &[0x41u8; 32]);
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(KeyMaterial::from_slice(&[0x41; 31]).is_err());
        assert!(KeyMaterial::from_slice(&[0x41; 32]).is_ok());
    }
}
