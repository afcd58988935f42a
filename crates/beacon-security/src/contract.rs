// Contracts scope channels to a tenant and validate the keys minted for it.
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::key::Key;
use crate::license::License;

// Ingress/egress byte counters, incremented concurrently from fan-out.
#[derive(Debug, Default)]
pub struct UsageStats {
    ingress: AtomicI64,
    egress: AtomicI64,
}

impl UsageStats {
    pub fn add_ingress(&self, bytes: i64) {
        self.ingress.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_egress(&self, bytes: i64) {
        self.egress.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn ingress(&self) -> i64 {
        self.ingress.load(Ordering::Relaxed)
    }

    pub fn egress(&self) -> i64 {
        self.egress.load(Ordering::Relaxed)
    }
}

/// Tenant scope owning usage counters and key validation.
#[derive(Debug)]
pub struct Contract {
    id: u32,
    signature: u32,
    stats: UsageStats,
}

impl Contract {
    pub fn new(id: u32, signature: u32) -> Self {
        Self {
            id,
            signature,
            stats: UsageStats::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    // A key belongs to the contract when its embedded signature matches.
    pub fn validate(&self, key: &Key) -> bool {
        key.signature() == self.signature
    }

    pub fn stats(&self) -> &UsageStats {
        &self.stats
    }
}

// Cached lookup by contract id; the provider decides where contracts come
// from (the single-tenant provider below, or a control plane in front).
pub trait ContractProvider: Debug + Send + Sync {
    fn get(&self, id: u32) -> Option<Arc<Contract>>;
}

/// Provider backed by one license: exactly the license's contract exists.
#[derive(Debug)]
pub struct SingleContractProvider {
    contract: Arc<Contract>,
}

impl SingleContractProvider {
    pub fn new(license: &License) -> Self {
        Self {
            contract: Arc::new(Contract::new(license.contract(), license.signature())),
        }
    }
}

impl ContractProvider for SingleContractProvider {
    fn get(&self, id: u32) -> Option<Arc<Contract>> {
        (self.contract.id() == id).then(|| Arc::clone(&self.contract))
    }
}

/// Read-through cache in front of a provider; contract lookups sit on the
/// publish hot path so misses only hit the backing provider once.
#[derive(Debug)]
pub struct ContractCache {
    provider: Arc<dyn ContractProvider>,
    cache: dashmap::DashMap<u32, Arc<Contract>>,
}

impl ContractCache {
    pub fn new(provider: Arc<dyn ContractProvider>) -> Self {
        Self {
            provider,
            cache: dashmap::DashMap::new(),
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<Contract>> {
        if let Some(found) = self.cache.get(&id) {
            return Some(Arc::clone(&found));
        }
        let contract = self.provider.get(id)?;
        self.cache.insert(id, Arc::clone(&contract));
        Some(contract)
    }
}
