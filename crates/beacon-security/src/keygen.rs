// Key minting: master keys create children, extend-keys derive private
// sub-channels bound to a single connection.
use crate::channel::Channel;
use crate::cipher::Cipher;
use crate::hash::hash;
use crate::key::{Access, Key};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct KeyGenerator {
    cipher: Cipher,
}

impl KeyGenerator {
    pub fn new(cipher: Cipher) -> Self {
        Self { cipher }
    }

    pub fn decrypt(&self, text: &str) -> Result<Key> {
        self.cipher.decrypt_key(text)
    }

    pub fn encrypt(&self, key: &Key) -> String {
        self.cipher.encrypt_key(key)
    }

    // Scope hash for a minted key: the first concrete segment, 0 when the
    // channel starts with a wildcard (unscoped within the contract).
    fn target_for(channel: &Channel) -> u32 {
        match channel.first_segment() {
            Some("+") | None => 0,
            Some(segment) => hash(segment.as_bytes()),
        }
    }

    /// Mint a child key under `parent`'s contract for `channel`. The caller
    /// decides whether `parent` is entitled to mint (master / extend rules).
    pub fn create_key(
        &self,
        parent: &Key,
        channel: &str,
        access: Access,
        expires: i64,
    ) -> Result<String> {
        let channel = Channel::make("_", channel).ok_or(Error::InvalidChannel)?;
        let key = Key::new(
            rand::random::<u16>(),
            0,
            parent.contract(),
            parent.signature(),
            access,
            Self::target_for(&channel),
            expires.clamp(0, u32::MAX as i64) as u32,
        );
        Ok(self.cipher.encrypt_key(&key))
    }

    /// Extend `parent_text` into a private sub-channel bound to `binding`
    /// (the requesting connection id). Returns the fully keyed channel.
    pub fn extend_key(
        &self,
        parent_text: &str,
        channel: &str,
        binding: &str,
        access: Access,
        expires: i64,
    ) -> Result<Channel> {
        let parent = self.cipher.decrypt_key(parent_text)?;
        if parent.is_expired() {
            return Err(Error::Expired);
        }
        let base = channel.strip_suffix('/').unwrap_or(channel);
        if base.is_empty() {
            return Err(Error::InvalidChannel);
        }
        let extended = format!("{base}/{binding}/");
        let text = self.create_key(&parent, &extended, access, expires)?;
        Channel::make(&text, &extended).ok_or(Error::InvalidChannel)
    }
}
