// Per-connection state and the tasks driving it: one reader decoding MQTT
// packets off the socket, one writer draining a bounded outgoing queue.
// Everything mutable on the connection is owned by its reader task; other
// tasks only reach it through the subscriber capability in the trie.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use beacon_message::{Message, PresenceEntry, Ssid, Subscriber};
use beacon_mqtt::{Connack, Packet, Publish, Suback};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::errors::ErrorReply;
use crate::handlers_dto::{PresenceEvent, Response};
use crate::service::Service;

// Outgoing queue depth per connection; a full queue drops deliveries the
// same way a lagging broadcast receiver would.
const WRITE_QUEUE_DEPTH: usize = 1024;

// Handler errors are reported on this reserved topic.
const ERROR_TOPIC: &str = "emitter/error/";

pub struct Conn {
    id: String,
    pub(crate) service: Arc<Service>,
    username: RwLock<String>,
    pub(crate) links: Mutex<HashMap<String, String>>,
    // Tracked subscriptions: ssid -> channel path (None for presence-change
    // subscriptions, which carry no channel and emit no notifications).
    subscriptions: Mutex<HashMap<Ssid, Option<String>>>,
    sender: mpsc::Sender<Packet>,
    // Weak handle to this connection, registered in the trie on subscribe.
    self_ref: Weak<Conn>,
}

impl Conn {
    pub fn new(service: Arc<Service>) -> (Arc<Conn>, mpsc::Receiver<Packet>) {
        let (sender, receiver) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let conn = Arc::new_cyclic(|self_ref| Conn {
            id: uuid::Uuid::new_v4().simple().to_string(),
            service,
            username: RwLock::new(String::new()),
            links: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            sender,
            self_ref: self_ref.clone(),
        });
        (conn, receiver)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn username(&self) -> String {
        self.username.read().expect("username lock").clone()
    }

    pub(crate) fn set_username(&self, username: String) {
        *self.username.write().expect("username lock") = username;
    }

    pub(crate) fn presence_entry(&self) -> PresenceEntry {
        PresenceEntry {
            id: self.id.clone(),
            username: self.username(),
        }
    }

    // Queue a packet for the writer task; drops when the client lags.
    fn enqueue(&self, packet: Packet) -> bool {
        match self.sender.try_send(packet) {
            Ok(()) => true,
            Err(_) => {
                metrics::counter!("broker_deliveries_dropped_total").increment(1);
                false
            }
        }
    }

    /// Register a subscription in the trie and, for regular channels, emit
    /// the presence subscribe event. Idempotent per connection.
    pub(crate) fn subscribe(&self, ssid: Ssid, channel: Option<&str>) {
        let Some(strong) = self.self_ref.upgrade() else {
            return;
        };
        let subscriber = strong as Arc<dyn Subscriber>;
        if !self.service.subscriptions.subscribe(&ssid, &subscriber) {
            return;
        }
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .insert(ssid.clone(), channel.map(str::to_string));
        if let Some(channel) = channel {
            self.service.notify_presence(
                PresenceEvent::Subscribe,
                &ssid,
                channel,
                self.presence_entry(),
            );
        }
    }

    /// Remove a subscription; removing one that does not exist is a no-op.
    pub(crate) fn unsubscribe(&self, ssid: &Ssid, channel: Option<&str>) {
        if !self.service.subscriptions.unsubscribe(ssid, &self.id) {
            return;
        }
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .remove(ssid);
        if let Some(channel) = channel {
            self.service.notify_presence(
                PresenceEvent::Unsubscribe,
                ssid,
                channel,
                self.presence_entry(),
            );
        }
    }

    /// Response codec: stamp the request id on the body, serialize it and
    /// publish it back to this connection on the originating topic.
    pub(crate) fn send_response(&self, channel: &str, mut response: Response, request_id: u16) {
        response.for_request(request_id);
        match serde_json::to_vec(&response) {
            Ok(body) => {
                self.enqueue(Packet::Publish(Publish {
                    topic: channel.to_string().into_bytes().into(),
                    payload: body.into(),
                    message_id: 0,
                    qos: 0,
                    retain: false,
                }));
            }
            Err(err) => {
                tracing::warn!(error = %err, "encoding rpc response");
            }
        }
    }

    fn send_error(&self, err: ErrorReply, request_id: u16) {
        self.send_response(ERROR_TOPIC, Response::Error(err), request_id);
    }

    // Disconnect path: drop every subscription this connection holds and
    // notify presence watchers of the ones bound to a channel.
    fn cleanup(&self) {
        let tracked: Vec<(Ssid, Option<String>)> = {
            let mut subscriptions = self.subscriptions.lock().expect("subscriptions lock");
            subscriptions.drain().collect()
        };
        for (ssid, channel) in tracked {
            self.service.subscriptions.unsubscribe(&ssid, &self.id);
            if let Some(channel) = channel {
                self.service.notify_presence(
                    PresenceEvent::Unsubscribe,
                    &ssid,
                    &channel,
                    self.presence_entry(),
                );
            }
        }
        // Safety net: nothing owned by this id may outlive it in the trie.
        self.service.subscriptions.unsubscribe_all(&self.id);
    }

    /// Drive one client connection to completion.
    pub async fn run(
        socket: TcpStream,
        service: Arc<Service>,
        max_packet: usize,
    ) -> anyhow::Result<()> {
        socket.set_nodelay(true).ok();
        let (mut reader, mut writer) = socket.into_split();
        let (conn, mut outgoing) = Conn::new(service);
        metrics::counter!("broker_connections_total").increment(1);

        let writer_task = tokio::spawn(async move {
            let mut buf = BytesMut::new();
            while let Some(packet) = outgoing.recv().await {
                buf.clear();
                packet.encode(&mut buf);
                if writer.write_all(&buf).await.is_err() {
                    break;
                }
            }
        });

        let result = conn.read_loop(&mut reader, max_packet).await;
        conn.cleanup();
        drop(conn);
        // The queue closes once the last sender is gone; let it drain.
        let _ = writer_task.await;
        result
    }

    async fn read_loop(
        &self,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
        max_packet: usize,
    ) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            loop {
                match Packet::decode(&mut buf, max_packet)? {
                    Some(packet) => {
                        if !self.process(packet).await {
                            return Ok(());
                        }
                    }
                    None => break,
                }
            }
            if reader.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        }
    }

    // Dispatch one packet; returns false when the connection should close.
    async fn process(&self, packet: Packet) -> bool {
        match packet {
            Packet::Connect(connect) => {
                self.on_connect(&connect);
                self.enqueue(Packet::Connack(Connack {
                    session_present: false,
                    return_code: beacon_mqtt::CONNECT_ACCEPTED,
                }));
            }
            Packet::Subscribe(subscribe) => {
                let mut return_codes = Vec::with_capacity(subscribe.topics.len());
                for (topic, _qos) in &subscribe.topics {
                    match self.on_subscribe(topic.as_ref()).await {
                        // Delivery is QoS 0 regardless of the request.
                        Ok(()) => return_codes.push(0),
                        Err(err) => {
                            tracing::debug!(error = %err, "subscribe rejected");
                            self.send_error(err, subscribe.message_id);
                            return_codes.push(beacon_mqtt::SUBACK_FAILURE);
                        }
                    }
                }
                self.enqueue(Packet::Suback(Suback {
                    message_id: subscribe.message_id,
                    return_codes,
                }));
            }
            Packet::Unsubscribe(unsubscribe) => {
                for topic in &unsubscribe.topics {
                    if let Err(err) = self.on_unsubscribe(topic.as_ref()) {
                        tracing::debug!(error = %err, "unsubscribe rejected");
                        self.send_error(err, unsubscribe.message_id);
                    }
                }
                self.enqueue(Packet::Unsuback {
                    message_id: unsubscribe.message_id,
                });
            }
            Packet::Publish(publish) => {
                let message_id = publish.message_id;
                let qos = publish.qos;
                if let Err(err) = self.on_publish(&publish).await {
                    tracing::debug!(error = %err, "publish rejected");
                    self.send_error(err, message_id);
                }
                if qos > 0 {
                    self.enqueue(Packet::Puback { message_id });
                }
            }
            Packet::Pingreq => {
                self.enqueue(Packet::Pingresp);
            }
            Packet::Disconnect => return false,
            // Server-to-client packets arriving inbound are ignored.
            _ => {}
        }
        true
    }
}

impl Subscriber for Conn {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, msg: &Message) -> usize {
        let delivered = self.enqueue(Packet::Publish(Publish {
            topic: msg.channel.clone().into_bytes().into(),
            payload: msg.payload.clone(),
            message_id: 0,
            qos: 0,
            retain: false,
        }));
        if delivered { msg.payload.len() } else { 0 }
    }

    fn presence(&self) -> Option<PresenceEntry> {
        Some(self.presence_entry())
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").field("id", &self.id).finish()
    }
}

/// Accept loop: one task per client connection.
pub async fn serve(
    listener: TcpListener,
    service: Arc<Service>,
    max_packet: usize,
) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            tracing::debug!(%peer, "connection accepted");
            if let Err(err) = Conn::run(socket, service, max_packet).await {
                tracing::debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}
