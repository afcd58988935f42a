// Broker license: the cipher key plus the contract identity, handed to the
// operator as a single base64 string. A broker without one generates a fresh
// license on first start and logs it.
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

use crate::cipher::Cipher;
use crate::key::{Access, Key};
use crate::{Error, Result};

const LICENSE_LEN: usize = 24;

/// ```
/// use beacon_security::License;
///
/// let license = License::generate();
/// let parsed = License::parse(&license.to_string()).expect("parse");
/// assert_eq!(parsed.contract(), license.contract());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    cipher_key: [u8; 16],
    contract: u32,
    signature: u32,
}

impl License {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut cipher_key = [0u8; 16];
        rng.fill_bytes(&mut cipher_key);
        Self {
            cipher_key,
            // Zero would read as "unset" in key fields; avoid it.
            contract: rng.next_u32() | 1,
            signature: rng.next_u32() | 1,
        }
    }

    pub fn parse(text: &str) -> Result<License> {
        let decoded = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|_| Error::MalformedLicense)?;
        let buf: [u8; LICENSE_LEN] = decoded.try_into().map_err(|_| Error::MalformedLicense)?;
        let mut cipher_key = [0u8; 16];
        cipher_key.copy_from_slice(&buf[0..16]);
        Ok(License {
            cipher_key,
            contract: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
            signature: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }

    pub fn cipher(&self) -> Cipher {
        Cipher::new(self.cipher_key)
    }

    pub fn contract(&self) -> u32 {
        self.contract
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    // Mint the master key for this license's contract. The master key is
    // unscoped and never expires; children are minted from it over the wire.
    pub fn master_key(&self) -> Key {
        Key::new(
            rand::random::<u16>(),
            1,
            self.contract,
            self.signature,
            Access::ALL,
            0,
            0,
        )
    }
}

impl std::fmt::Display for License {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut buf = [0u8; LICENSE_LEN];
        buf[0..16].copy_from_slice(&self.cipher_key);
        buf[16..20].copy_from_slice(&self.contract.to_be_bytes());
        buf[20..24].copy_from_slice(&self.signature.to_be_bytes());
        f.write_str(&URL_SAFE_NO_PAD.encode(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let license = License::generate();
        let parsed = License::parse(&license.to_string()).expect("parse");
        assert_eq!(parsed, license);
    }

    #[test]
    fn rejects_malformed_text() {
        assert_eq!(
            License::parse("???").expect_err("garbage"),
            Error::MalformedLicense
        );
        let short = URL_SAFE_NO_PAD.encode([0u8; 4]);
        assert_eq!(
            License::parse(&short).expect_err("short"),
            Error::MalformedLicense
        );
    }

    #[test]
    fn master_key_is_master_and_unscoped() {
        let license = License::generate();
        let key = license.master_key();
        assert!(key.is_master());
        assert!(!key.is_expired());
        assert_eq!(key.contract(), license.contract());
        assert_eq!(key.signature(), license.signature());
        assert_eq!(key.target(), 0);
    }

    #[test]
    fn master_key_round_trips_through_cipher() {
        let license = License::generate();
        let cipher = license.cipher();
        let key = license.master_key();
        let decoded = cipher
            .decrypt_key(&cipher.encrypt_key(&key))
            .expect("decrypt");
        assert_eq!(decoded, key);
    }
}
