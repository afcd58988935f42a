// Request and response shapes for the in-band RPC surface. Responses are a
// small sum type so the response codec can stamp the originating request id
// on anything before it goes out.
use std::collections::HashMap;

use beacon_message::{PresenceEntry, Ssid, unix_timestamp};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorReply;

#[derive(Debug, Deserialize)]
pub struct KeyGenRequest {
    // The master or extend key to derive from.
    pub key: String,
    // The channel to create a key for.
    pub channel: String,
    // The permission set, one character per bit ("rwslpex").
    #[serde(rename = "type", default)]
    pub access: String,
    // Key lifetime in seconds; 0 means the key never expires.
    #[serde(default)]
    pub ttl: i64,
}

impl KeyGenRequest {
    pub fn access(&self) -> beacon_security::Access {
        beacon_security::Access::parse(&self.access)
    }

    // Absolute expiry as UNIX seconds; the zero sentinel survives as-is.
    pub fn expires(&self) -> i64 {
        if self.ttl == 0 {
            0
        } else {
            unix_timestamp() + self.ttl
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct KeyGenResponse {
    #[serde(rename = "req", skip_serializing_if = "Option::is_none")]
    pub request: Option<u16>,
    pub status: u16,
    pub key: String,
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    // The name of the shortcut, max 2 alphanumeric characters.
    pub name: String,
    // The key for the channel.
    pub key: String,
    // The channel to alias.
    pub channel: String,
    // Subscribe the connection to the channel as well.
    #[serde(default)]
    pub subscribe: bool,
    // Derive a private sub-channel bound to this connection.
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct LinkResponse {
    #[serde(rename = "req", skip_serializing_if = "Option::is_none")]
    pub request: Option<u16>,
    pub status: u16,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MeResponse {
    #[serde(rename = "req", skip_serializing_if = "Option::is_none")]
    pub request: Option<u16>,
    pub id: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub links: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    pub key: String,
    pub channel: String,
    // Whether a status snapshot should be sent back.
    #[serde(default = "default_true")]
    pub status: bool,
    // Tri-state: absent leaves the change subscription untouched.
    #[serde(default)]
    pub changes: Option<bool>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEvent {
    Status,
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PresenceResponse {
    #[serde(rename = "req", skip_serializing_if = "Option::is_none")]
    pub request: Option<u16>,
    pub time: i64,
    pub event: PresenceEvent,
    pub channel: String,
    pub who: Vec<PresenceEntry>,
}

/// Subscribe/unsubscribe notification fanned out on the presence ssid.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceNotify {
    pub time: i64,
    pub event: PresenceEvent,
    pub channel: String,
    pub who: PresenceEntry,
    #[serde(skip)]
    pub ssid: Option<Ssid>,
}

impl PresenceNotify {
    pub fn new(ssid: &Ssid, event: PresenceEvent, channel: &str, who: PresenceEntry) -> Self {
        Self {
            time: unix_timestamp(),
            event,
            channel: channel.to_string(),
            who,
            ssid: Some(ssid.for_presence()),
        }
    }
}

/// Anything that can answer an RPC request: one of the four response shapes
/// or an error envelope.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    KeyGen(KeyGenResponse),
    Link(LinkResponse),
    Me(MeResponse),
    Presence(PresenceResponse),
    Error(ErrorReply),
}

impl Response {
    // Stamp the MQTT message id of the originating request on the body.
    pub fn for_request(&mut self, id: u16) {
        match self {
            Response::KeyGen(r) => r.request = Some(id),
            Response::Link(r) => r.request = Some(id),
            Response::Me(r) => r.request = Some(id),
            Response::Presence(r) => r.request = Some(id),
            Response::Error(r) => r.for_request(id),
        }
    }
}

impl From<ErrorReply> for Response {
    fn from(err: ErrorReply) -> Self {
        Response::Error(err)
    }
}
