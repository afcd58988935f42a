// Channel key: a fixed-size capability buffer minted under a contract.
// The encrypted form travels as the first segment of every channel topic.
use crate::channel::Channel;
use crate::hash::hash;
use crate::{Error, Result, unix_now};

pub const KEY_LEN: usize = 24;

/// Permission bits carried by a key.
///
/// ```
/// use beacon_security::Access;
///
/// let access = Access::READ | Access::WRITE;
/// assert!(access.contains(Access::READ));
/// assert!(!access.contains(Access::STORE));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Access(u8);

impl Access {
    pub const NONE: Access = Access(0);
    pub const READ: Access = Access(1 << 0);
    pub const WRITE: Access = Access(1 << 1);
    pub const STORE: Access = Access(1 << 2);
    pub const LOAD: Access = Access(1 << 3);
    pub const PRESENCE: Access = Access(1 << 4);
    pub const EXTEND: Access = Access(1 << 5);
    pub const EXECUTE: Access = Access(1 << 6);
    // Everything a regular client key may carry; Extend/Execute stay explicit.
    pub const ALL: Access = Access(0b0001_1111);

    pub fn contains(self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Access {
        Access(bits & 0x7f)
    }

    // Parse a permission spec such as "rwls"; unknown characters are ignored.
    pub fn parse(spec: &str) -> Access {
        let mut access = Access::NONE;
        for c in spec.chars() {
            access = access
                | match c {
                    'r' => Access::READ,
                    'w' => Access::WRITE,
                    's' => Access::STORE,
                    'l' => Access::LOAD,
                    'p' => Access::PRESENCE,
                    'e' => Access::EXTEND,
                    'x' => Access::EXECUTE,
                    _ => Access::NONE,
                };
        }
        access
    }
}

impl std::ops::BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Access) -> Access {
        Access(self.0 | rhs.0)
    }
}

/// Decrypted channel key.
///
/// Layout (big-endian): salt u16, master u16, contract u32, signature u32,
/// permissions u8, target u32, expires u32, three spare bytes. `target` is
/// the hash of the first channel segment the key is scoped to (0 = any),
/// `expires` is UNIX seconds (0 = never).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    salt: u16,
    master: u16,
    contract: u32,
    signature: u32,
    permissions: Access,
    target: u32,
    expires: u32,
}

impl Key {
    pub fn new(
        salt: u16,
        master: u16,
        contract: u32,
        signature: u32,
        permissions: Access,
        target: u32,
        expires: u32,
    ) -> Self {
        Self {
            salt,
            master,
            contract,
            signature,
            permissions,
            target,
            expires,
        }
    }

    pub fn contract(&self) -> u32 {
        self.contract
    }

    pub fn signature(&self) -> u32 {
        self.signature
    }

    pub fn permissions(&self) -> Access {
        self.permissions
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    pub fn expires(&self) -> u32 {
        self.expires
    }

    pub fn is_master(&self) -> bool {
        self.master != 0
    }

    pub fn is_expired(&self) -> bool {
        self.expires != 0 && (self.expires as i64) <= unix_now()
    }

    pub fn has_permission(&self, required: Access) -> bool {
        self.permissions.contains(required)
    }

    // A key is scoped to a top-level channel segment; target 0 grants the
    // whole contract namespace.
    pub fn validate_channel(&self, channel: &Channel) -> bool {
        if self.target == 0 {
            return true;
        }
        match channel.first_segment() {
            Some(segment) => self.target == hash(segment.as_bytes()),
            None => false,
        }
    }

    pub fn encode(&self) -> [u8; KEY_LEN] {
        let mut buf = [0u8; KEY_LEN];
        buf[0..2].copy_from_slice(&self.salt.to_be_bytes());
        buf[2..4].copy_from_slice(&self.master.to_be_bytes());
        buf[4..8].copy_from_slice(&self.contract.to_be_bytes());
        buf[8..12].copy_from_slice(&self.signature.to_be_bytes());
        buf[12] = self.permissions.bits();
        buf[13..17].copy_from_slice(&self.target.to_be_bytes());
        buf[17..21].copy_from_slice(&self.expires.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Key> {
        if buf.len() != KEY_LEN {
            return Err(Error::MalformedKey);
        }
        Ok(Key {
            salt: u16::from_be_bytes([buf[0], buf[1]]),
            master: u16::from_be_bytes([buf[2], buf[3]]),
            contract: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            signature: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            permissions: Access::from_bits(buf[12]),
            target: u32::from_be_bytes([buf[13], buf[14], buf[15], buf[16]]),
            expires: u32::from_be_bytes([buf[17], buf[18], buf[19], buf[20]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_key() -> Key {
        Key::new(
            0x1234,
            1,
            0xAABBCCDD,
            0x11223344,
            Access::READ | Access::WRITE,
            hash(b"sensors"),
            0,
        )
    }

    #[test]
    fn access_parse_maps_flags() {
        let access = Access::parse("rwslpex");
        assert!(access.contains(Access::READ));
        assert!(access.contains(Access::WRITE));
        assert!(access.contains(Access::STORE));
        assert!(access.contains(Access::LOAD));
        assert!(access.contains(Access::PRESENCE));
        assert!(access.contains(Access::EXTEND));
        assert!(access.contains(Access::EXECUTE));
    }

    #[test]
    fn access_parse_ignores_unknown_characters() {
        assert_eq!(Access::parse("r?z!w"), Access::READ | Access::WRITE);
    }

    #[test]
    fn encode_decode_round_trip() {
        let key = sample_key();
        let decoded = Key::decode(&key.encode()).expect("decode");
        assert_eq!(decoded, key);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = Key::decode(&[0u8; 23]).expect_err("short");
        assert_eq!(err, Error::MalformedKey);
    }

    #[test]
    fn zero_expiry_never_expires() {
        assert!(!sample_key().is_expired());
    }

    #[test]
    fn past_expiry_is_expired() {
        let mut key = sample_key();
        key.expires = 1;
        assert!(key.is_expired());
    }

    #[test]
    fn master_flag_tracks_field() {
        let mut key = sample_key();
        assert!(key.is_master());
        key.master = 0;
        assert!(!key.is_master());
    }

    #[test]
    fn channel_scope_validation() {
        let key = sample_key();
        let ok = Channel::parse(b"k/sensors/temp/").expect("channel");
        let bad = Channel::parse(b"k/other/temp/").expect("channel");
        assert!(key.validate_channel(&ok));
        assert!(!key.validate_channel(&bad));

        let unscoped = Key::new(0, 0, 1, 1, Access::READ, 0, 0);
        assert!(unscoped.validate_channel(&bad));
    }
}
