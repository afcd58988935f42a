// Request handlers for the broker edge: subscribe/unsubscribe/publish state
// transitions and the four in-band RPCs carried over the reserved channel.
use std::collections::HashMap;
use std::sync::OnceLock;

use beacon_message::{Message, RETAINED_TTL, Ssid, unix_timestamp};
use beacon_mqtt::Publish;
use beacon_security::{Access, Channel, ChannelKind, hash};
use regex::Regex;

use crate::conn::Conn;
use crate::errors::ErrorReply;
use crate::handlers_dto::{
    KeyGenRequest, KeyGenResponse, LinkRequest, LinkResponse, MeResponse, PresenceEvent,
    PresenceRequest, PresenceResponse, Response,
};

// RPC ids are the hash of the verb, exactly as the channel parser hashes
// path segments, so `emitter/<verb>/` routes on its first query element.
const REQUEST_KEYGEN: u32 = hash(b"keygen");
const REQUEST_PRESENCE: u32 = hash(b"presence");
const REQUEST_LINK: u32 = hash(b"link");
const REQUEST_ME: u32 = hash(b"me");

// Shortcut names are 1-2 alphanumeric characters.
fn shortcut() -> &'static Regex {
    static SHORTCUT: OnceLock<Regex> = OnceLock::new();
    SHORTCUT.get_or_init(|| Regex::new("^[a-zA-Z0-9]{1,2}$").expect("shortcut regex"))
}

type HandlerResult = Result<(), ErrorReply>;

impl Conn {
    // CONNECT only contributes the username used in presence answers.
    pub(crate) fn on_connect(&self, packet: &beacon_mqtt::Connect) {
        if let Some(username) = &packet.username {
            self.set_username(username.clone());
        }
    }

    /// Subscribe this connection to a channel, replaying stored messages
    /// when the key carries the load permission. A store failure surfaces
    /// as a server error but leaves the subscription applied.
    pub(crate) async fn on_subscribe(&self, topic: &[u8]) -> HandlerResult {
        let channel = Channel::parse(topic).ok_or_else(ErrorReply::bad_request)?;

        let (contract, key) = self
            .service
            .authorize(&channel, Access::READ)
            .ok_or_else(ErrorReply::unauthorized)?;

        // Keys minted for extension may not be used to subscribe.
        if key.has_permission(Access::EXTEND) {
            return Err(ErrorReply::unauthorized_ext());
        }

        let ssid = Ssid::new(key.contract(), channel.query());
        self.subscribe(ssid.clone(), Some(channel.path()));

        // Retained-message semantics: replay one message unless the client
        // asked for more.
        let limit = channel.last().unwrap_or(1);
        if key.has_permission(Access::LOAD) {
            let window = channel.window();
            match self.service.storage.query(&ssid, window, limit).await {
                Ok(replay) => {
                    use beacon_message::Subscriber;
                    for msg in replay {
                        self.send(&msg);
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "query last messages");
                    metrics::counter!("broker_store_errors_total").increment(1);
                    return Err(ErrorReply::server_error());
                }
            }
        }

        contract.stats().add_ingress(topic.len() as i64);
        Ok(())
    }

    pub(crate) fn on_unsubscribe(&self, topic: &[u8]) -> HandlerResult {
        let channel = Channel::parse(topic).ok_or_else(ErrorReply::bad_request)?;

        let (contract, key) = self
            .service
            .authorize(&channel, Access::READ)
            .ok_or_else(ErrorReply::unauthorized)?;

        let ssid = Ssid::new(key.contract(), channel.query());
        self.unsubscribe(&ssid, Some(channel.path()));
        contract.stats().add_ingress(topic.len() as i64);
        Ok(())
    }

    /// Publish a message: resolve shortcut links, gate on the write
    /// permission, store when asked to, then fan out.
    pub(crate) async fn on_publish(&self, packet: &Publish) -> HandlerResult {
        // Length <= 2 topics go through the connection's link map first.
        let mut topic = packet.topic.to_vec();
        if topic.len() <= 2 {
            let links = self.links.lock().expect("links lock");
            if let Some(channel) = String::from_utf8(topic.clone())
                .ok()
                .and_then(|name| links.get(&name))
            {
                topic = channel.clone().into_bytes();
            }
        }

        let channel = Channel::parse(&topic).ok_or_else(ErrorReply::bad_request)?;

        // Publish must address a concrete channel.
        if channel.kind() != ChannelKind::Static {
            return Err(ErrorReply::forbidden());
        }

        // The reserved key hands the packet to the RPC router instead.
        if channel.is_rpc() {
            self.on_rpc_request(&channel, &packet.payload, packet.message_id)
                .await;
            return Ok(());
        }

        let (contract, key) = self
            .service
            .authorize(&channel, Access::WRITE)
            .ok_or_else(ErrorReply::unauthorized)?;

        // Keys minted for extension may not be used to publish.
        if key.has_permission(Access::EXTEND) {
            return Err(ErrorReply::unauthorized_ext());
        }

        let mut msg = Message::new(
            Ssid::new(key.contract(), channel.query()),
            channel.path(),
            packet.payload.clone(),
        );

        // TTL resolution: explicit option beats the retain flag.
        if packet.retain {
            msg.ttl = RETAINED_TTL;
        }
        if let Some(ttl) = channel.ttl().filter(|ttl| *ttl > 0) {
            msg.ttl = ttl;
        }

        // Storage is best-effort; failures are logged and never fail the
        // publish.
        if msg.stored() && key.has_permission(Access::STORE) {
            if let Err(err) = self.service.storage.store(&msg).await {
                tracing::warn!(error = %err, "store published message");
                metrics::counter!("broker_store_errors_total").increment(1);
            }
        }

        let exclude = channel.excludes_sender().then(|| self.id().to_string());
        let size = self.service.publish(&msg, exclude.as_deref());

        contract.stats().add_ingress(packet.payload.len() as i64);
        contract.stats().add_egress(size as i64);
        Ok(())
    }

    // The router: dispatch on the hash of the verb, reply on the topic the
    // request arrived on, stamped with its message id.
    pub(crate) async fn on_rpc_request(
        &self,
        channel: &Channel,
        payload: &[u8],
        request_id: u16,
    ) {
        let response = match channel.query().first() {
            Some(&REQUEST_KEYGEN) => self.on_keygen(payload),
            Some(&REQUEST_PRESENCE) => self.on_presence(payload).await,
            Some(&REQUEST_LINK) => self.on_link(payload),
            Some(&REQUEST_ME) => Some(self.on_me()),
            _ => Some(ErrorReply::not_found().into()),
        };
        if let Some(response) = response {
            self.send_response(&channel.to_string(), response, request_id);
        }
    }

    /// Mint a new key: masters create children anywhere under the contract,
    /// extend-keys derive a private sub-channel bound to this connection.
    pub(crate) fn on_keygen(&self, payload: &[u8]) -> Option<Response> {
        let request: KeyGenRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(_) => return Some(ErrorReply::bad_request().into()),
        };

        let parent = match self.service.keys.decrypt(&request.key) {
            Ok(parent) if !parent.is_expired() => parent,
            _ => return Some(ErrorReply::unauthorized().into()),
        };

        if parent.is_master() {
            let key = match self.service.keys.create_key(
                &parent,
                &request.channel,
                request.access(),
                request.expires(),
            ) {
                Ok(key) => key,
                Err(_) => return Some(ErrorReply::bad_request().into()),
            };
            return Some(Response::KeyGen(KeyGenResponse {
                request: None,
                status: 200,
                key,
                channel: request.channel,
            }));
        }

        if parent.has_permission(Access::EXTEND) {
            let extended = match self.service.keys.extend_key(
                &request.key,
                &request.channel,
                self.id(),
                request.access(),
                request.expires(),
            ) {
                Ok(extended) => extended,
                Err(_) => return Some(ErrorReply::bad_request().into()),
            };
            return Some(Response::KeyGen(KeyGenResponse {
                request: None,
                status: 200,
                key: extended.key().to_string(),
                channel: extended.path().to_string(),
            }));
        }

        Some(ErrorReply::unauthorized().into())
    }

    /// Create a 1-2 character shortcut for a channel, optionally private
    /// (bound to this connection) and optionally auto-subscribed.
    pub(crate) fn on_link(&self, payload: &[u8]) -> Option<Response> {
        let request: LinkRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(_) => return Some(ErrorReply::bad_request().into()),
        };

        if !shortcut().is_match(&request.name) {
            return Some(ErrorReply::link_invalid().into());
        }

        let channel = if request.private {
            match self.service.keys.extend_key(
                &request.key,
                &request.channel,
                self.id(),
                Access::ALL,
                0,
            ) {
                Ok(channel) => Some(channel),
                Err(_) => return Some(ErrorReply::unauthorized().into()),
            }
        } else {
            Channel::make(&request.key, &request.channel)
        };
        let Some(channel) = channel else {
            return Some(ErrorReply::bad_request().into());
        };

        self.links
            .lock()
            .expect("links lock")
            .insert(request.name.clone(), channel.to_string());

        // Auto-subscribe when requested and the key grants read; no replay
        // on this path.
        if request.subscribe {
            if let Some((_, key)) = self.service.authorize(&channel, Access::READ) {
                self.subscribe(
                    Ssid::new(key.contract(), channel.query()),
                    Some(channel.path()),
                );
            }
        }

        Some(Response::Link(LinkResponse {
            request: None,
            status: 200,
            name: request.name,
            channel: channel.safe_string(),
        }))
    }

    /// Information about this connection; link targets are rewritten so the
    /// secret key portion never leaves the broker.
    pub(crate) fn on_me(&self) -> Response {
        let links: HashMap<String, String> = {
            let links = self.links.lock().expect("links lock");
            links
                .iter()
                .map(|(name, target)| {
                    let safe = Channel::parse(target.as_bytes())
                        .map(|channel| channel.safe_string())
                        .unwrap_or_default();
                    (name.clone(), safe)
                })
                .collect()
        };
        Response::Me(MeResponse {
            request: None,
            id: self.id().to_string(),
            links,
        })
    }

    /// Presence: optionally toggle change notifications, optionally answer
    /// with a status snapshot gathered locally and across the cluster.
    pub(crate) async fn on_presence(&self, payload: &[u8]) -> Option<Response> {
        let mut request: PresenceRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(_) => return Some(ErrorReply::bad_request().into()),
        };

        let key = match self.service.keys.decrypt(&request.key) {
            Ok(key) if key.has_permission(Access::PRESENCE) && !key.is_expired() => key,
            _ => return Some(ErrorReply::unauthorized().into()),
        };

        let contract = match self.service.contracts.get(key.contract()) {
            Some(contract) => contract,
            None => return Some(ErrorReply::not_found().into()),
        };
        if !contract.validate(&key) {
            return Some(ErrorReply::unauthorized().into());
        }

        if !request.channel.ends_with('/') {
            request.channel.push('/');
        }

        // Parse through the RPC namespace so the channel grammar applies.
        let channel = match Channel::parse(format!("emitter/{}", request.channel).as_bytes()) {
            Some(channel) => channel,
            None => return Some(ErrorReply::bad_request().into()),
        };

        let ssid = Ssid::new(key.contract(), channel.query());

        // Tri-state changes toggle: subscribe, unsubscribe, or leave as-is.
        // Change subscriptions carry no channel and emit no notifications.
        match request.changes {
            Some(true) => self.subscribe(ssid.for_presence(), None),
            Some(false) => self.unsubscribe(&ssid.for_presence(), None),
            None => {}
        }

        if !request.status {
            // The changes toggle alone warrants no reply body.
            return None;
        }

        let who = self.service.all_presence(&ssid).await;
        Some(Response::Presence(PresenceResponse {
            request: None,
            time: unix_timestamp(),
            event: PresenceEvent::Status,
            channel: request.channel,
            who,
        }))
    }
}
