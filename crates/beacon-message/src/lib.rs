// Subscription identifiers and messages flowing through the broker core.
use beacon_security::{WILDCARD, hash};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod store;
pub mod trie;

pub use store::{MemoryStore, Storage, StoreError};
pub use trie::{PresenceEntry, Subscriber, SubscriptionTrie};

// Contract id reserved for broker-internal channels (presence events).
pub const SYSTEM_CONTRACT: u32 = 1;

// Default TTL applied to retained publishes without an explicit ttl option.
pub const RETAINED_TTL: u32 = 30 * 24 * 3600;

const PRESENCE_QUERY: u32 = hash(b"presence");

/// Subscription identifier: the contract id followed by the hashed channel
/// path segments. Equality is elementwise; the trie walks it level by level.
///
/// ```
/// use beacon_message::Ssid;
/// use beacon_security::hash;
///
/// let ssid = Ssid::new(42, &[hash(b"a"), hash(b"b")]);
/// assert_eq!(ssid.contract(), 42);
/// assert_eq!(ssid.len(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ssid(Vec<u32>);

impl Ssid {
    pub fn new(contract: u32, query: &[u32]) -> Self {
        let mut parts = Vec::with_capacity(query.len() + 1);
        parts.push(contract);
        parts.extend_from_slice(query);
        Ssid(parts)
    }

    // The presence namespace twin of this ssid: same elements under the
    // reserved system prefix, so clients can subscribe to presence events.
    pub fn for_presence(&self) -> Ssid {
        let mut parts = Vec::with_capacity(self.0.len() + 2);
        parts.push(SYSTEM_CONTRACT);
        parts.push(PRESENCE_QUERY);
        parts.extend_from_slice(&self.0);
        Ssid(parts)
    }

    pub fn contract(&self) -> u32 {
        self.0[0]
    }

    pub fn parts(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether a stored ssid falls under this (possibly wildcard) query:
    /// the query must be an elementwise prefix, `+` matching any element.
    pub fn matches(&self, stored: &Ssid) -> bool {
        if stored.0.len() < self.0.len() {
            return false;
        }
        self.0
            .iter()
            .zip(stored.0.iter())
            .all(|(q, s)| *q == WILDCARD || q == s)
    }
}

/// A message addressed by ssid, carrying the channel path for delivery.
/// `ttl == 0` means transient; anything else makes the message storable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub ssid: Ssid,
    pub channel: String,
    pub payload: Bytes,
    pub ttl: u32,
    pub time: i64,
}

impl Message {
    pub fn new(ssid: Ssid, channel: impl Into<String>, payload: Bytes) -> Self {
        Self {
            ssid,
            channel: channel.into(),
            payload,
            ttl: 0,
            time: unix_timestamp(),
        }
    }

    pub fn stored(&self) -> bool {
        self.ttl > 0
    }

    pub fn expires_at(&self) -> i64 {
        self.time + self.ttl as i64
    }
}

// UNIX seconds; message times and windows use second precision.
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
