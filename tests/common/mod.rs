use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use topic_discovery::{random_id_at, NodeId, NodeRecord, RegConfirmation, TopicId, TopicTransport};

/// Scripted behavior of one registrar for topic-register calls.
#[derive(Clone)]
pub enum RegistrarScript {
    /// Confirm immediately with the given time-to-live in seconds.
    Confirm { ttl: u32 },
    /// Issue a ticket on the first call, confirm once it is presented back.
    TicketThenConfirm { wait: u32, ttl: u32 },
    /// Refuse every registration.
    Refuse,
}

/// In-memory transport: a fixed lookup answer plus per-registrar scripts.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    lookup_nodes: Vec<NodeRecord>,
    scripts: HashMap<NodeId, RegistrarScript>,
    query_results: HashMap<NodeId, Vec<NodeRecord>>,
    register_calls: Vec<(NodeId, Vec<u8>)>,
    query_calls: Vec<NodeId>,
    lookups: usize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_lookup_nodes(&self, nodes: Vec<NodeRecord>) {
        self.inner.lock().await.lookup_nodes = nodes;
    }

    pub async fn set_script(&self, node: NodeId, script: RegistrarScript) {
        self.inner.lock().await.scripts.insert(node, script);
    }

    pub async fn set_query_results(&self, node: NodeId, results: Vec<NodeRecord>) {
        self.inner.lock().await.query_results.insert(node, results);
    }

    /// Every topic-register call observed: (registrar id, presented ticket).
    pub async fn register_calls(&self) -> Vec<(NodeId, Vec<u8>)> {
        self.inner.lock().await.register_calls.clone()
    }

    pub async fn query_calls(&self) -> Vec<NodeId> {
        self.inner.lock().await.query_calls.clone()
    }

    pub async fn lookup_count(&self) -> usize {
        self.inner.lock().await.lookups
    }
}

#[async_trait]
impl TopicTransport for MockTransport {
    async fn lookup(&self, _target: NodeId) -> Result<Vec<NodeRecord>> {
        let mut state = self.inner.lock().await;
        state.lookups += 1;
        Ok(state.lookup_nodes.clone())
    }

    async fn topic_register(
        &self,
        node: &NodeRecord,
        _topic: TopicId,
        ticket: &[u8],
    ) -> Result<RegConfirmation> {
        let mut state = self.inner.lock().await;
        state.register_calls.push((node.id, ticket.to_vec()));
        match state.scripts.get(&node.id) {
            None => Err(anyhow!("no route to registrar")),
            Some(RegistrarScript::Confirm { ttl }) => Ok(RegConfirmation::confirmed(*ttl)),
            Some(RegistrarScript::TicketThenConfirm { wait, ttl }) => {
                if ticket.is_empty() {
                    Ok(RegConfirmation::deferred(*wait, vec![0xAA]))
                } else {
                    Ok(RegConfirmation::confirmed(*ttl))
                }
            }
            Some(RegistrarScript::Refuse) => Err(anyhow!("registration refused")),
        }
    }

    async fn topic_query(&self, node: &NodeRecord, _topic: TopicId) -> Result<Vec<NodeRecord>> {
        let mut state = self.inner.lock().await;
        state.query_calls.push(node.id);
        Ok(state
            .query_results
            .get(&node.id)
            .cloned()
            .unwrap_or_default())
    }
}

/// A record at an exact log-distance from the topic.
pub fn record_at(topic: &TopicId, dist: usize, seq: u64) -> NodeRecord {
    NodeRecord::new(random_id_at(topic, dist), seq, format!("node-d{dist}"))
}

pub fn make_node_id(index: u32) -> NodeId {
    let mut id = [0u8; 32];
    id[..4].copy_from_slice(&index.to_be_bytes());
    id
}

pub fn make_record(index: u32) -> NodeRecord {
    NodeRecord::new(make_node_id(index), 1, format!("node-{index}"))
}
