// Cluster survey plumbing: one node asks a question, every peer may answer,
// and the asker gathers whatever arrived before a hard deadline. The gossip
// transport behind a production mesh stays out of this crate; what lives
// here is the deadline-bounded fan-in and an in-process mesh used by tests
// and embedded multi-node setups.
use std::fmt::Debug;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("cluster transport unavailable")]
    Unavailable,
}

/// Answers survey questions on behalf of the local node. Returning `None`
/// means "no reply" and the asker simply never hears from this peer.
pub trait SurveyHandler: Send + Sync {
    fn on_survey(&self, query_type: &str, payload: &[u8]) -> Option<Vec<u8>>;
}

/// Collects survey responses as they arrive.
pub struct SurveyAwaiter {
    rx: mpsc::Receiver<Vec<u8>>,
    expected: usize,
}

impl SurveyAwaiter {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>, expected: usize) -> Self {
        Self { rx, expected }
    }

    // An awaiter with no peers behind it; gathers nothing, immediately.
    pub fn empty() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx, expected: 0 }
    }

    /// Wait for responses until the deadline, returning everything received
    /// by then. Stops early once all expected peers have answered; late
    /// responses are dropped with the channel.
    pub async fn gather(mut self, deadline: Duration) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + deadline;
        let mut responses = Vec::with_capacity(self.expected);
        while responses.len() < self.expected {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(response)) => responses.push(response),
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(
                        received = responses.len(),
                        expected = self.expected,
                        "survey gather hit deadline"
                    );
                    break;
                }
            }
        }
        responses
    }
}

/// Issues surveys to the rest of the cluster.
pub trait Surveyor: Debug + Send + Sync {
    fn survey(&self, query_type: &str, payload: Vec<u8>) -> Result<SurveyAwaiter>;

    // Number of peers a survey will reach; 0 for a single-node deployment.
    fn peer_count(&self) -> usize;
}

/// Single-node deployment: surveys reach nobody.
#[derive(Debug, Default)]
pub struct NoopSurveyor;

impl Surveyor for NoopSurveyor {
    fn survey(&self, _query_type: &str, _payload: Vec<u8>) -> Result<SurveyAwaiter> {
        Ok(SurveyAwaiter::empty())
    }

    fn peer_count(&self) -> usize {
        0
    }
}

struct Peer {
    index: usize,
    handler: Weak<dyn SurveyHandler>,
}

/// In-process mesh: every joined node answers the others' surveys on a
/// spawned task, which is enough to exercise real scatter/gather timing.
#[derive(Default)]
pub struct LocalMesh {
    peers: RwLock<Vec<Peer>>,
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the mesh; the returned member is the node's surveyor handle.
    /// The mesh holds the handler weakly so departed nodes fall away.
    pub fn join(mesh: &Arc<LocalMesh>, handler: Arc<dyn SurveyHandler>) -> LocalMeshMember {
        let mut peers = mesh.peers.write().expect("mesh lock");
        let index = peers.len();
        peers.push(Peer {
            index,
            handler: Arc::downgrade(&handler),
        });
        LocalMeshMember {
            mesh: Arc::clone(mesh),
            index,
        }
    }
}

impl Debug for LocalMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let peers = self.peers.read().expect("mesh lock");
        f.debug_struct("LocalMesh")
            .field("peers", &peers.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct LocalMeshMember {
    mesh: Arc<LocalMesh>,
    index: usize,
}

impl Surveyor for LocalMeshMember {
    fn survey(&self, query_type: &str, payload: Vec<u8>) -> Result<SurveyAwaiter> {
        let peers: Vec<Arc<dyn SurveyHandler>> = {
            let peers = self.mesh.peers.read().expect("mesh lock");
            peers
                .iter()
                .filter(|peer| peer.index != self.index)
                .filter_map(|peer| peer.handler.upgrade())
                .collect()
        };
        let expected = peers.len();
        let (tx, rx) = mpsc::channel(expected.max(1));
        for peer in peers {
            let tx = tx.clone();
            let query_type = query_type.to_string();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Some(response) = peer.on_survey(&query_type, &payload) {
                    let _ = tx.send(response).await;
                }
            });
        }
        Ok(SurveyAwaiter::new(rx, expected))
    }

    fn peer_count(&self) -> usize {
        let peers = self.mesh.peers.read().expect("mesh lock");
        peers
            .iter()
            .filter(|peer| peer.index != self.index && peer.handler.strong_count() > 0)
            .count()
    }
}
