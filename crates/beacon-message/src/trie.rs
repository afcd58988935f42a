// Concurrent subscription trie over ssid elements. The trie holds weak
// references: a subscriber's lifetime belongs to its connection, and a
// closing connection removes itself by identity.
use std::collections::HashMap;
use std::sync::{RwLock, Weak};

use beacon_security::WILDCARD;
use serde::{Deserialize, Serialize};

use crate::{Message, Ssid};

/// Presence identity of a local subscriber, captured at read time. The
/// field set stays flat and unconditional: entries travel both as JSON and
/// as bincode survey payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub id: String,
    #[serde(default)]
    pub username: String,
}

/// Capability to deliver a message. `send` returns the number of payload
/// bytes accepted (0 when the delivery was dropped); `presence` returns
/// `None` for subscribers that are not local client connections.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> &str;
    fn send(&self, msg: &Message) -> usize;
    fn presence(&self) -> Option<PresenceEntry>;
}

#[derive(Default)]
struct Node {
    subs: Vec<(String, Weak<dyn Subscriber>)>,
    children: HashMap<u32, Node>,
}

impl Node {
    fn prune(&mut self) {
        self.subs.retain(|(_, weak)| weak.strong_count() > 0);
    }

    // Drop empty leaves so long-gone subscriptions do not pin memory.
    fn remove_all(&mut self, id: &str) -> usize {
        let before = self.subs.len();
        self.subs.retain(|(sub_id, _)| sub_id != id);
        let mut removed = before - self.subs.len();
        self.children.retain(|_, child| {
            removed += child.remove_all(id);
            !child.subs.is_empty() || !child.children.is_empty()
        });
        removed
    }

    fn collect_ssids(&self, id: &str, prefix: &mut Vec<u32>, out: &mut Vec<Ssid>) {
        if self.subs.iter().any(|(sub_id, _)| sub_id == id) {
            out.push(Ssid::new(prefix[0], &prefix[1..]));
        }
        for (element, child) in &self.children {
            prefix.push(*element);
            child.collect_ssids(id, prefix, out);
            prefix.pop();
        }
    }
}

/// Process-lifetime subscription index.
///
/// Lookup is hierarchical: a subscriber registered at `a/` receives
/// everything published below it (`a/b/`, `a/b/c/`, ...), and wildcard
/// branches are followed at every level.
pub struct SubscriptionTrie {
    root: RwLock<Node>,
}

impl Default for SubscriptionTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTrie {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Node::default()),
        }
    }

    /// Register a subscriber under `ssid`. Idempotent per subscriber id:
    /// returns false when the exact subscription already existed.
    pub fn subscribe(&self, ssid: &Ssid, subscriber: &std::sync::Arc<dyn Subscriber>) -> bool {
        let id = subscriber.id().to_string();
        let mut root = self.root.write().expect("trie lock");
        let mut node = &mut *root;
        for element in ssid.parts() {
            node = node.children.entry(*element).or_default();
        }
        node.prune();
        if node.subs.iter().any(|(sub_id, _)| *sub_id == id) {
            return false;
        }
        node.subs.push((id, std::sync::Arc::downgrade(subscriber)));
        true
    }

    /// Remove one subscription. Removing a non-existent entry is a no-op.
    pub fn unsubscribe(&self, ssid: &Ssid, id: &str) -> bool {
        let mut root = self.root.write().expect("trie lock");
        let mut node = &mut *root;
        for element in ssid.parts() {
            match node.children.get_mut(element) {
                Some(child) => node = child,
                None => return false,
            }
        }
        let before = node.subs.len();
        node.subs.retain(|(sub_id, _)| sub_id != id);
        before != node.subs.len()
    }

    /// Remove every subscription held by `id` (disconnect path) and return
    /// the ssids that were dropped.
    pub fn unsubscribe_all(&self, id: &str) -> Vec<Ssid> {
        let mut root = self.root.write().expect("trie lock");
        let mut ssids = Vec::new();
        let mut prefix = Vec::new();
        for (element, child) in &root.children {
            prefix.push(*element);
            child.collect_ssids(id, &mut prefix, &mut ssids);
            prefix.pop();
        }
        root.remove_all(id);
        ssids
    }

    /// All live subscribers matching the published ssid, deduplicated by
    /// subscriber id.
    pub fn lookup(&self, ssid: &Ssid) -> Vec<std::sync::Arc<dyn Subscriber>> {
        let root = self.root.read().expect("trie lock");
        let mut out: Vec<std::sync::Arc<dyn Subscriber>> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        Self::walk(&root, ssid.parts(), &mut out, &mut seen);
        out
    }

    fn walk(
        node: &Node,
        remaining: &[u32],
        out: &mut Vec<std::sync::Arc<dyn Subscriber>>,
        seen: &mut std::collections::HashSet<String>,
    ) {
        for (id, weak) in &node.subs {
            if let Some(sub) = weak.upgrade() {
                if seen.insert(id.clone()) {
                    out.push(sub);
                }
            }
        }
        let Some((element, rest)) = remaining.split_first() else {
            return;
        };
        if let Some(child) = node.children.get(element) {
            Self::walk(child, rest, out, seen);
        }
        if *element != WILDCARD {
            if let Some(child) = node.children.get(&WILDCARD) {
                Self::walk(child, rest, out, seen);
            }
        }
    }
}
