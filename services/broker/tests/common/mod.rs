// Shared fixtures for integration tests: an in-process broker bound to a
// loopback listener and a minimal MQTT client speaking the real codec.
#![allow(dead_code)]
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use beacon_mqtt::{Connect, Packet, Publish, Subscribe, Unsubscribe};
use beacon_security::License;
use broker::{Service, ServiceOptions, serve};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const MAX_PACKET: usize = 1024 * 1024;
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn start_broker() -> Result<(SocketAddr, Arc<Service>)> {
    start_broker_with(ServiceOptions::new(License::generate())).await
}

pub async fn start_broker_with(options: ServiceOptions) -> Result<(SocketAddr, Arc<Service>)> {
    let service = Service::new(options);
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind test listener")?;
    let addr = listener.local_addr()?;
    let serving = Arc::clone(&service);
    tokio::spawn(async move {
        let _ = serve(listener, serving, MAX_PACKET).await;
    });
    Ok((addr, service))
}

pub struct TestClient {
    stream: TcpStream,
    buf: BytesMut,
    // Publishes that arrived while waiting for an ack; served first.
    pending: VecDeque<Publish>,
    next_id: u16,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, username: &str) -> Result<TestClient> {
        let stream = TcpStream::connect(addr).await.context("connect")?;
        let mut client = TestClient {
            stream,
            buf: BytesMut::new(),
            pending: VecDeque::new(),
            next_id: 1,
        };
        client
            .send(Packet::Connect(Connect {
                client_id: format!("test-{username}"),
                username: Some(username.to_string()),
                password: None,
                keep_alive: 30,
                clean_session: true,
            }))
            .await?;
        match client.recv().await? {
            Packet::Connack(ack) if ack.return_code == beacon_mqtt::CONNECT_ACCEPTED => Ok(client),
            other => Err(anyhow!("unexpected connack: {other:?}")),
        }
    }

    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf);
        self.stream.write_all(&buf).await.context("write packet")
    }

    pub async fn recv(&mut self) -> Result<Packet> {
        loop {
            if let Some(packet) = Packet::decode(&mut self.buf, MAX_PACKET)? {
                return Ok(packet);
            }
            let read = timeout(RECV_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .context("recv timeout")??;
            if read == 0 {
                return Err(anyhow!("connection closed"));
            }
        }
    }

    /// Next inbound PUBLISH, skipping acks.
    pub async fn recv_publish(&mut self) -> Result<Publish> {
        if let Some(publish) = self.pending.pop_front() {
            return Ok(publish);
        }
        loop {
            match self.recv().await? {
                Packet::Publish(publish) => return Ok(publish),
                Packet::Puback { .. }
                | Packet::Suback(_)
                | Packet::Unsuback { .. }
                | Packet::Pingresp => continue,
                other => return Err(anyhow!("unexpected packet: {other:?}")),
            }
        }
    }

    /// True when nothing arrives within a short grace period.
    pub async fn expect_silence(&mut self) -> bool {
        if !self.pending.is_empty() {
            return false;
        }
        timeout(Duration::from_millis(300), self.recv()).await.is_err()
    }

    fn allocate_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    /// Subscribe to one topic and wait for the SUBACK return code.
    pub async fn subscribe(&mut self, topic: &str) -> Result<u8> {
        let message_id = self.allocate_id();
        self.send(Packet::Subscribe(Subscribe {
            message_id,
            topics: vec![(Bytes::from(topic.to_string().into_bytes()), 0)],
        }))
        .await?;
        loop {
            match self.recv().await? {
                Packet::Suback(suback) if suback.message_id == message_id => {
                    return suback
                        .return_codes
                        .first()
                        .copied()
                        .ok_or_else(|| anyhow!("empty suback"));
                }
                // Replayed messages may land before the ack; keep them.
                Packet::Publish(publish) => self.pending.push_back(publish),
                other => return Err(anyhow!("unexpected packet: {other:?}")),
            }
        }
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        let message_id = self.allocate_id();
        self.send(Packet::Unsubscribe(Unsubscribe {
            message_id,
            topics: vec![Bytes::from(topic.to_string().into_bytes())],
        }))
        .await?;
        loop {
            match self.recv().await? {
                Packet::Unsuback { message_id: id } if id == message_id => return Ok(()),
                Packet::Publish(publish) => self.pending.push_back(publish),
                other => return Err(anyhow!("unexpected packet: {other:?}")),
            }
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        self.publish_with(topic, payload, false).await
    }

    pub async fn publish_with(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.send(Packet::Publish(Publish {
            topic: Bytes::from(topic.to_string().into_bytes()),
            payload: Bytes::from(payload.to_vec()),
            message_id: 0,
            qos: 0,
            retain,
        }))
        .await
    }

    /// Issue an in-band RPC: QoS 1 publish to `emitter/<verb>/`, correlate
    /// the JSON reply through its `req` field.
    pub async fn rpc(&mut self, verb: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        let message_id = self.allocate_id();
        self.send(Packet::Publish(Publish {
            topic: Bytes::from(format!("emitter/{verb}/").into_bytes()),
            payload: Bytes::from(body.to_string().into_bytes()),
            message_id,
            qos: 1,
            retain: false,
        }))
        .await?;
        // The reply can only arrive after the request; read the socket
        // directly and set aside unrelated deliveries.
        loop {
            let publish = match self.recv().await? {
                Packet::Publish(publish) => publish,
                _ => continue,
            };
            let reply = serde_json::from_slice::<serde_json::Value>(&publish.payload).ok();
            match reply {
                Some(reply)
                    if reply.get("req").and_then(|v| v.as_u64()) == Some(message_id as u64) =>
                {
                    return Ok(reply);
                }
                _ => self.pending.push_back(publish),
            }
        }
    }
}
