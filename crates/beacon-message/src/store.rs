// Message store: retains published messages for replay on subscribe.
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{Message, Ssid, unix_timestamp};

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Time-indexed message store. `query` answers with messages whose ssid
/// falls under the requested (possibly wildcard) ssid, within the UNIX
/// second window `(t0, t1)` (0 = unbounded), newest `limit` entries in
/// stored order.
#[async_trait]
pub trait Storage: Debug + Send + Sync {
    async fn store(&self, msg: &Message) -> Result<()>;

    async fn query(&self, ssid: &Ssid, window: (i64, i64), limit: usize) -> Result<Vec<Message>>;
}

const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// In-memory store; entries expire by message TTL and the per-ssid history
/// is bounded, oldest entries dropped first.
#[derive(Debug)]
pub struct MemoryStore {
    history: Mutex<HashMap<Ssid, VecDeque<Message>>>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn store(&self, msg: &Message) -> Result<()> {
        let mut history = self.history.lock().expect("store lock");
        let entries = history.entry(msg.ssid.clone()).or_default();
        entries.push_back(msg.clone());
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        Ok(())
    }

    async fn query(&self, ssid: &Ssid, window: (i64, i64), limit: usize) -> Result<Vec<Message>> {
        let now = unix_timestamp();
        let (t0, t1) = window;
        let mut history = self.history.lock().expect("store lock");
        // Prune lazily; expired history should not survive a query.
        history.retain(|_, entries| {
            entries.retain(|msg| msg.expires_at() > now);
            !entries.is_empty()
        });

        let mut matched: Vec<Message> = history
            .iter()
            .filter(|(stored, _)| ssid.matches(stored))
            .flat_map(|(_, entries)| entries.iter().cloned())
            .filter(|msg| (t0 == 0 || msg.time >= t0) && (t1 == 0 || msg.time <= t1))
            .collect();
        matched.sort_by_key(|msg| msg.time);
        if matched.len() > limit {
            matched.drain(0..matched.len() - limit);
        }
        Ok(matched)
    }
}
