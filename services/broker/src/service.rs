// Process-lifetime broker state: the subscription trie, the message store,
// the contract cache and the cluster surveyor. Initialized before the
// listener accepts and shared by every connection.
use std::sync::{Arc, Weak};
use std::time::Duration;

use beacon_cluster::{NoopSurveyor, SurveyHandler, Surveyor};
use beacon_message::{
    MemoryStore, Message, PresenceEntry, Ssid, Storage, SubscriptionTrie,
};
use beacon_security::{
    Access, Channel, Contract, ContractCache, ContractProvider, Key, KeyGenerator, License,
    SingleContractProvider,
};

use crate::handlers_dto::{PresenceEvent, PresenceNotify};

// Hard deadline for the cluster presence gather.
pub const SURVEY_DEADLINE: Duration = Duration::from_millis(1000);

const PRESENCE_QUERY_TYPE: &str = "presence";

/// Pluggable backends; defaults cover a single-node broker.
pub struct ServiceOptions {
    pub license: License,
    pub storage: Arc<dyn Storage>,
    pub surveyor: Arc<dyn Surveyor>,
    pub contracts: Arc<dyn ContractProvider>,
}

impl ServiceOptions {
    pub fn new(license: License) -> Self {
        let contracts = Arc::new(SingleContractProvider::new(&license));
        Self {
            license,
            storage: Arc::new(MemoryStore::new()),
            surveyor: Arc::new(NoopSurveyor),
            contracts,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_surveyor(mut self, surveyor: Arc<dyn Surveyor>) -> Self {
        self.surveyor = surveyor;
        self
    }
}

pub struct Service {
    pub(crate) subscriptions: SubscriptionTrie,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) contracts: ContractCache,
    pub(crate) keys: KeyGenerator,
    // Swappable so a node can join a mesh after construction; the member
    // handle needs this service as its survey handler.
    surveyor: std::sync::RwLock<Arc<dyn Surveyor>>,
    license: License,
    self_ref: Weak<Service>,
}

impl Service {
    pub fn new(options: ServiceOptions) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            subscriptions: SubscriptionTrie::new(),
            storage: options.storage,
            contracts: ContractCache::new(options.contracts),
            keys: KeyGenerator::new(options.license.cipher()),
            surveyor: std::sync::RwLock::new(options.surveyor),
            license: options.license,
            self_ref: self_ref.clone(),
        })
    }

    /// Join an in-process mesh: this service answers the other members'
    /// surveys and gains the ability to ask them.
    pub fn join_mesh(&self, mesh: &Arc<beacon_cluster::LocalMesh>) {
        let Some(strong) = self.self_ref.upgrade() else {
            return;
        };
        let member = beacon_cluster::LocalMesh::join(mesh, strong as Arc<dyn SurveyHandler>);
        *self.surveyor.write().expect("surveyor lock") = Arc::new(member);
    }

    fn surveyor(&self) -> Arc<dyn Surveyor> {
        Arc::clone(&self.surveyor.read().expect("surveyor lock"))
    }

    pub fn license(&self) -> &License {
        &self.license
    }

    pub fn keys(&self) -> &KeyGenerator {
        &self.keys
    }

    // The encrypted master key for this broker's contract; logged at startup
    // so an operator can mint channel keys.
    pub fn master_key(&self) -> String {
        self.keys.encrypt(&self.license.master_key())
    }

    /// Check a channel key against the required permission mask. Returns the
    /// contract and the decrypted key only when every gate passes.
    pub fn authorize(&self, channel: &Channel, required: Access) -> Option<(Arc<Contract>, Key)> {
        let key = self.keys.decrypt(channel.key()).ok()?;
        if key.is_expired() || !key.has_permission(required) || !key.validate_channel(channel) {
            return None;
        }
        let contract = self.contracts.get(key.contract())?;
        if !contract.validate(&key) {
            return None;
        }
        Some((contract, key))
    }

    /// Fan a message out to every matching local subscriber and return the
    /// total payload bytes delivered.
    pub fn publish(&self, msg: &Message, exclude: Option<&str>) -> u64 {
        let mut size = 0u64;
        for subscriber in self.subscriptions.lookup(&msg.ssid) {
            if exclude == Some(subscriber.id()) {
                continue;
            }
            size += subscriber.send(msg) as u64;
        }
        metrics::counter!("broker_messages_published_total").increment(1);
        metrics::counter!("broker_bytes_egress_total").increment(size);
        size
    }

    // Best-effort presence event; an encode failure is logged and dropped.
    pub fn notify_presence(
        &self,
        event: PresenceEvent,
        ssid: &Ssid,
        channel: &str,
        who: PresenceEntry,
    ) {
        let notify = PresenceNotify::new(ssid, event, channel, who);
        let Some(target) = notify.ssid.clone() else {
            return;
        };
        match serde_json::to_vec(&notify) {
            Ok(payload) => {
                let msg = Message::new(target, channel, payload.into());
                self.publish(&msg, None);
            }
            Err(err) => {
                tracing::warn!(error = %err, "encoding presence notification");
            }
        }
    }

    /// Local trie walk filtered to local client connections.
    pub fn local_presence(&self, ssid: &Ssid) -> Vec<PresenceEntry> {
        self.subscriptions
            .lookup(ssid)
            .iter()
            .filter_map(|subscriber| subscriber.presence())
            .collect()
    }

    /// Ask the rest of the cluster; everything received within the deadline
    /// is decoded and concatenated, late responses are dropped.
    pub async fn cluster_presence(&self, ssid: &Ssid) -> Vec<PresenceEntry> {
        let Ok(payload) = bincode::serialize(ssid) else {
            return Vec::new();
        };
        let Ok(awaiter) = self.surveyor().survey(PRESENCE_QUERY_TYPE, payload) else {
            return Vec::new();
        };
        let mut who = Vec::new();
        for response in awaiter.gather(SURVEY_DEADLINE).await {
            if let Ok(mut entries) = bincode::deserialize::<Vec<PresenceEntry>>(&response) {
                who.append(&mut entries);
            }
        }
        who
    }

    pub async fn all_presence(&self, ssid: &Ssid) -> Vec<PresenceEntry> {
        let mut who = self.local_presence(ssid);
        who.extend(self.cluster_presence(ssid).await);
        who
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("contract", &self.license.contract())
            .field("peers", &self.surveyor().peer_count())
            .finish()
    }
}

// Cluster membership is trusted: no authorization happens at this layer.
impl SurveyHandler for Service {
    fn on_survey(&self, query_type: &str, payload: &[u8]) -> Option<Vec<u8>> {
        if query_type != PRESENCE_QUERY_TYPE {
            return None;
        }
        let target: Ssid = bincode::deserialize(payload).ok()?;
        tracing::debug!(?target, "presence query received");
        bincode::serialize(&self.local_presence(&target)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_message::Subscriber;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct Probe {
        id: String,
        username: String,
        delivered: AtomicUsize,
    }

    impl Probe {
        pub(crate) fn new(id: &str, username: &str) -> Arc<Probe> {
            Arc::new(Probe {
                id: id.to_string(),
                username: username.to_string(),
                delivered: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.delivered.load(Ordering::Relaxed)
        }
    }

    impl Subscriber for Probe {
        fn id(&self) -> &str {
            &self.id
        }

        fn send(&self, msg: &Message) -> usize {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            msg.payload.len()
        }

        fn presence(&self) -> Option<PresenceEntry> {
            Some(PresenceEntry {
                id: self.id.clone(),
                username: self.username.clone(),
            })
        }
    }

    fn service() -> Arc<Service> {
        Service::new(ServiceOptions::new(License::generate()))
    }

    fn channel_key(service: &Service, channel: &str, access: Access) -> String {
        let master = service.license().master_key();
        service
            .keys
            .create_key(&master, channel, access, 0)
            .expect("create key")
    }

    #[test]
    fn authorize_accepts_a_valid_key() {
        let service = service();
        let key = channel_key(&service, "a/b/", Access::READ);
        let channel = Channel::parse(format!("{key}/a/b/").as_bytes()).expect("channel");
        let (contract, decrypted) = service.authorize(&channel, Access::READ).expect("authorized");
        assert_eq!(contract.id(), service.license().contract());
        assert!(decrypted.has_permission(Access::READ));
    }

    #[test]
    fn authorize_rejects_missing_permission() {
        let service = service();
        let key = channel_key(&service, "a/b/", Access::READ);
        let channel = Channel::parse(format!("{key}/a/b/").as_bytes()).expect("channel");
        assert!(service.authorize(&channel, Access::WRITE).is_none());
    }

    #[test]
    fn authorize_rejects_out_of_scope_channel() {
        let service = service();
        let key = channel_key(&service, "a/b/", Access::READ);
        let channel = Channel::parse(format!("{key}/other/").as_bytes()).expect("channel");
        assert!(service.authorize(&channel, Access::READ).is_none());
    }

    #[test]
    fn authorize_rejects_garbage_keys() {
        let service = service();
        let channel = Channel::parse(b"bogus/a/b/").expect("channel");
        assert!(service.authorize(&channel, Access::READ).is_none());
    }

    #[test]
    fn authorize_rejects_foreign_contract_keys() {
        let ours = service();
        let theirs = service();
        let foreign = channel_key(&theirs, "a/b/", Access::READ);
        let channel = Channel::parse(format!("{foreign}/a/b/").as_bytes()).expect("channel");
        assert!(ours.authorize(&channel, Access::READ).is_none());
    }

    #[test]
    fn publish_excludes_the_sender() {
        let service = service();
        let probe = Probe::new("c1", "alice");
        let other = Probe::new("c2", "bob");
        let sub: Arc<dyn Subscriber> = probe.clone();
        let sub2: Arc<dyn Subscriber> = other.clone();
        let ssid = Ssid::new(1, &[2, 3]);
        service.subscriptions.subscribe(&ssid, &sub);
        service.subscriptions.subscribe(&ssid, &sub2);

        let msg = Message::new(ssid, "a/b/", Bytes::from_static(b"payload"));
        let size = service.publish(&msg, Some("c1"));
        assert_eq!(size, b"payload".len() as u64);
        assert_eq!(probe.count(), 0);
        assert_eq!(other.count(), 1);
    }

    #[test]
    fn survey_responder_answers_presence_only() {
        let service = service();
        let probe = Probe::new("c1", "alice");
        let sub: Arc<dyn Subscriber> = probe.clone();
        let ssid = Ssid::new(1, &[2]);
        service.subscriptions.subscribe(&ssid, &sub);

        let payload = bincode::serialize(&ssid).expect("encode");
        assert!(service.on_survey("other", &payload).is_none());
        assert!(service.on_survey("presence", b"garbage").is_none());

        let reply = service.on_survey("presence", &payload).expect("reply");
        let entries: Vec<PresenceEntry> = bincode::deserialize(&reply).expect("decode");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "c1");
        assert_eq!(entries[0].username, "alice");
    }

    #[tokio::test]
    async fn all_presence_merges_local_and_cluster() {
        use beacon_cluster::LocalMesh;
        use std::time::Instant;

        // Two nodes sharing one license, joined through the in-process mesh.
        let mesh = LocalMesh::new();
        let license = License::generate();
        let node_a = Service::new(ServiceOptions::new(license.clone()));
        let node_b = Service::new(ServiceOptions::new(license));
        node_a.join_mesh(&mesh);
        node_b.join_mesh(&mesh);

        let ssid = Ssid::new(1, &[2]);
        let local = Probe::new("c1", "alice");
        let remote_1 = Probe::new("c2", "bob");
        let remote_2 = Probe::new("c3", "carol");
        node_a
            .subscriptions
            .subscribe(&ssid, &(local.clone() as Arc<dyn Subscriber>));
        node_b
            .subscriptions
            .subscribe(&ssid, &(remote_1.clone() as Arc<dyn Subscriber>));
        node_b
            .subscriptions
            .subscribe(&ssid, &(remote_2.clone() as Arc<dyn Subscriber>));

        let start = Instant::now();
        let mut who: Vec<String> = node_a
            .all_presence(&ssid)
            .await
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        who.sort();
        assert_eq!(who, vec!["c1", "c2", "c3"]);
        assert!(start.elapsed() < SURVEY_DEADLINE + Duration::from_millis(500));
    }

    #[tokio::test]
    async fn all_presence_without_a_cluster_is_local_only() {
        let service = service();
        let probe = Probe::new("c1", "alice");
        let ssid = Ssid::new(1, &[2]);
        service
            .subscriptions
            .subscribe(&ssid, &(probe.clone() as Arc<dyn Subscriber>));
        let who = service.all_presence(&ssid).await;
        assert_eq!(who.len(), 1);
        assert_eq!(who[0].id, "c1");
    }
}
