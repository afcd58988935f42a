// XTEA in CBC mode over the fixed-size key buffer, base64url on the wire.
// The encrypted form is exactly 32 characters, which is how the channel
// parser distinguishes a real key from the reserved RPC key.
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::key::{KEY_LEN, Key};
use crate::{Error, Result};

const ROUNDS: u32 = 32;
const DELTA: u32 = 0x9e37_79b9;
const BLOCK: usize = 8;

/// Symmetric cipher for channel keys, derived from the broker license.
///
/// ```
/// use beacon_security::{Access, Cipher, Key};
///
/// let cipher = Cipher::new([7u8; 16]);
/// let key = Key::new(1, 0, 42, 99, Access::READ, 0, 0);
/// let text = cipher.encrypt_key(&key);
/// assert_eq!(text.len(), 32);
/// assert_eq!(cipher.decrypt_key(&text).expect("decrypt"), key);
/// ```
#[derive(Debug, Clone)]
pub struct Cipher {
    key: [u32; 4],
}

impl Cipher {
    pub fn new(key: [u8; 16]) -> Self {
        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_be_bytes([
                key[i * 4],
                key[i * 4 + 1],
                key[i * 4 + 2],
                key[i * 4 + 3],
            ]);
        }
        Self { key: words }
    }

    fn encrypt_block(&self, v: [u32; 2]) -> [u32; 2] {
        let [mut v0, mut v1] = v;
        let mut sum = 0u32;
        for _ in 0..ROUNDS {
            v0 = v0.wrapping_add(
                (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                    ^ sum.wrapping_add(self.key[(sum & 3) as usize]),
            );
            sum = sum.wrapping_add(DELTA);
            v1 = v1.wrapping_add(
                (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                    ^ sum.wrapping_add(self.key[((sum >> 11) & 3) as usize]),
            );
        }
        [v0, v1]
    }

    fn decrypt_block(&self, v: [u32; 2]) -> [u32; 2] {
        let [mut v0, mut v1] = v;
        let mut sum = DELTA.wrapping_mul(ROUNDS);
        for _ in 0..ROUNDS {
            v1 = v1.wrapping_sub(
                (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                    ^ sum.wrapping_add(self.key[((sum >> 11) & 3) as usize]),
            );
            sum = sum.wrapping_sub(DELTA);
            v0 = v0.wrapping_sub(
                (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                    ^ sum.wrapping_add(self.key[(sum & 3) as usize]),
            );
        }
        [v0, v1]
    }

    fn encrypt_buffer(&self, buf: &mut [u8; KEY_LEN]) {
        // CBC with a zero IV; the per-key random salt in the first block
        // makes identical grants encrypt differently.
        let mut prev = [0u32; 2];
        for chunk in buf.chunks_exact_mut(BLOCK) {
            let block = [
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ prev[0],
                u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) ^ prev[1],
            ];
            prev = self.encrypt_block(block);
            chunk[0..4].copy_from_slice(&prev[0].to_be_bytes());
            chunk[4..8].copy_from_slice(&prev[1].to_be_bytes());
        }
    }

    fn decrypt_buffer(&self, buf: &mut [u8; KEY_LEN]) {
        let mut prev = [0u32; 2];
        for chunk in buf.chunks_exact_mut(BLOCK) {
            let block = [
                u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
                u32::from_be_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
            ];
            let plain = self.decrypt_block(block);
            chunk[0..4].copy_from_slice(&(plain[0] ^ prev[0]).to_be_bytes());
            chunk[4..8].copy_from_slice(&(plain[1] ^ prev[1]).to_be_bytes());
            prev = block;
        }
    }

    pub fn encrypt_key(&self, key: &Key) -> String {
        let mut buf = key.encode();
        self.encrypt_buffer(&mut buf);
        URL_SAFE_NO_PAD.encode(buf)
    }

    pub fn decrypt_key(&self, text: &str) -> Result<Key> {
        let decoded = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|_| Error::MalformedKey)?;
        let mut buf: [u8; KEY_LEN] = decoded.try_into().map_err(|_| Error::MalformedKey)?;
        self.decrypt_buffer(&mut buf);
        Key::decode(&buf)
    }
}
