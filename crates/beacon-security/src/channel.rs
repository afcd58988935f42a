// Channel parsing: turns a topic byte string into key, path, hashed query
// and options. Topic grammar: `<key>/<seg1>/<seg2>/.../[?opt=v&opt=v]`.
use crate::hash::{WILDCARD, hash};

// The reserved key selecting the in-band RPC surface.
pub const RPC_KEY: &str = "emitter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    // No wildcard segment; addressable by publish.
    Static,
    // At least one `+` segment; only valid for subscriptions.
    Wildcard,
}

/// Parsed form of a topic.
///
/// ```
/// use beacon_security::{Channel, ChannelKind};
///
/// let channel = Channel::parse(b"key1/sensors/temp/?last=5").expect("parse");
/// assert_eq!(channel.kind(), ChannelKind::Static);
/// assert_eq!(channel.key(), "key1");
/// assert_eq!(channel.path(), "sensors/temp/");
/// assert_eq!(channel.last(), Some(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    kind: ChannelKind,
    key: String,
    path: String,
    query: Vec<u32>,
    options: Vec<(String, String)>,
}

impl Channel {
    /// Parse a topic. Returns `None` for anything malformed: empty key or
    /// segment, missing trailing slash, broken option pair, or the reserved
    /// RPC key combined with a wildcard path.
    pub fn parse(topic: &[u8]) -> Option<Channel> {
        let topic = std::str::from_utf8(topic).ok()?;
        let (key, rest) = topic.split_once('/')?;
        if key.is_empty() || key.contains('?') {
            return None;
        }

        let (path_part, opts_part) = match rest.split_once('?') {
            Some((path, opts)) => (path, Some(opts)),
            None => (rest, None),
        };
        // The path always carries a trailing slash so "a/b/" and "a/b" never
        // alias to different queries.
        let trimmed = path_part.strip_suffix('/')?;

        let mut kind = ChannelKind::Static;
        let mut query = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() || segment.contains('?') {
                return None;
            }
            if segment == "+" {
                kind = ChannelKind::Wildcard;
                query.push(WILDCARD);
            } else {
                query.push(hash(segment.as_bytes()));
            }
        }

        // The RPC surface is only addressable on a concrete path.
        if key == RPC_KEY && kind != ChannelKind::Static {
            return None;
        }

        let mut options = Vec::new();
        if let Some(opts) = opts_part {
            for pair in opts.split('&') {
                let (name, value) = pair.split_once('=')?;
                if name.is_empty() {
                    return None;
                }
                options.push((name.to_string(), value.to_string()));
            }
        }

        Some(Channel {
            kind,
            key: key.to_string(),
            path: path_part.to_string(),
            query,
            options,
        })
    }

    // Build a channel from a key and a path, normalizing the trailing slash.
    pub fn make(key: &str, path: &str) -> Option<Channel> {
        let path = if path.ends_with('/') || path.contains('?') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        Channel::parse(format!("{key}/{path}").as_bytes())
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    // Channel path without the key, always with its trailing slash.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[u32] {
        &self.query
    }

    pub fn first_segment(&self) -> Option<&str> {
        self.path.split('/').next().filter(|s| !s.is_empty())
    }

    pub fn is_rpc(&self) -> bool {
        self.key == RPC_KEY
    }

    fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn int_option(&self, name: &str) -> Option<i64> {
        self.option(name).and_then(|v| v.parse::<i64>().ok())
    }

    // Replay limit requested with `last=N`.
    pub fn last(&self) -> Option<usize> {
        self.int_option("last")
            .filter(|v| *v >= 0)
            .map(|v| v as usize)
    }

    // Message TTL requested with `ttl=N` seconds.
    pub fn ttl(&self) -> Option<u32> {
        self.int_option("ttl").filter(|v| *v >= 0).map(|v| v as u32)
    }

    // Replay time window `(from, until)` as UNIX seconds; 0 means unbounded.
    pub fn window(&self) -> (i64, i64) {
        let t0 = self.int_option("from").unwrap_or(0).max(0);
        let t1 = self.int_option("until").unwrap_or(0).max(0);
        (t0, t1)
    }

    // True when the publisher asked to be excluded from fan-out (`me=0`).
    pub fn excludes_sender(&self) -> bool {
        self.option("me") == Some("0")
    }

    fn options_suffix(&self) -> String {
        if self.options.is_empty() {
            return String::new();
        }
        let pairs: Vec<String> = self
            .options
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect();
        format!("?{}", pairs.join("&"))
    }

    // The channel without its secret key, safe to echo back to clients.
    pub fn safe_string(&self) -> String {
        format!("{}{}", self.path, self.options_suffix())
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}{}", self.key, self.path, self.options_suffix())
    }
}
