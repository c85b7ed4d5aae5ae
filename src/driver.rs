//! Driver runtime binding the topic state machines to a transport.
//!
//! Each active topic is served by three cooperating tasks:
//!
//! 1. a **control loop** that owns the state object and is the only caller of
//!    its operations,
//! 2. a **lookup worker** running iterative Kademlia walks toward targets the
//!    control loop picks, and
//! 3. a **request worker** performing one wire round-trip (topic-register or
//!    topic-query) at a time.
//!
//! The workers talk to the control loop exclusively over capacity-1 channels,
//! which keeps the state object's single-threaded discipline mechanically
//! enforced: nothing mutates an attempt while its request is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::core::{
    AbsTime, AttemptId, Clock, Config, NodeId, NodeRecord, Registration, Search, TopicId,
};
use crate::protocol::RegConfirmation;

/// Rest between two iterative lookups started for a registration.
const REG_LOOKUP_INTERVAL: Duration = Duration::from_secs(2);

/// Capacity of the channel delivering search results to the consumer.
const SEARCH_RESULT_BUFFER: usize = 200;

/// Network abstraction for the topic discovery round-trips.
///
/// This trait is the seam where the UDP transport, wire codec, and iterative
/// lookup engine plug in. Tests use an in-memory mock; production wires it to
/// the discovery transport.
#[async_trait]
pub trait TopicTransport: Send + Sync + 'static {
    /// Run one iterative Kademlia lookup toward `target` and return the
    /// closest nodes found.
    async fn lookup(&self, target: NodeId) -> Result<Vec<NodeRecord>>;

    /// Send a topic-register request to `node`, presenting `ticket` (empty on
    /// the first attempt).
    async fn topic_register(
        &self,
        node: &NodeRecord,
        topic: TopicId,
        ticket: &[u8],
    ) -> Result<RegConfirmation>;

    /// Send a topic-query to `node`, returning the records it advertises for
    /// the topic.
    async fn topic_query(&self, node: &NodeRecord, topic: TopicId) -> Result<Vec<NodeRecord>>;
}

/// Manages the per-topic registration and search runtimes.
///
/// Registrations run until explicitly stopped; searches run until their state
/// declares itself done, streaming found peers to the receiver returned by
/// [`TopicSystem::search`].
pub struct TopicSystem<T: TopicTransport> {
    transport: Arc<T>,
    config: Config,
    reg: HashMap<TopicId, TopicHandle>,
    searches: Vec<TopicHandle>,
}

impl<T: TopicTransport> TopicSystem<T> {
    /// Create a system on top of the given transport.
    pub fn new(transport: T, config: Config) -> Self {
        Self {
            transport: Arc::new(transport),
            config,
            reg: HashMap::new(),
            searches: Vec::new(),
        }
    }

    /// Start advertising a topic. Idempotent while the registration runs.
    pub fn register(&mut self, topic: TopicId) {
        if self.reg.contains_key(&topic) {
            return;
        }
        debug!(topic = %hex::encode(&topic[..8]), "starting topic registration");
        let handle = start_registration(self.transport.clone(), topic, self.config.clone());
        self.reg.insert(topic, handle);
    }

    /// Stop advertising a topic. Placed ads expire on their own at the
    /// registrars.
    pub async fn stop_register(&mut self, topic: TopicId) {
        if let Some(handle) = self.reg.remove(&topic) {
            debug!(topic = %hex::encode(&topic[..8]), "stopping topic registration");
            handle.stop().await;
        }
    }

    /// Start searching a topic.
    ///
    /// Found peer records stream out of the returned receiver. The channel
    /// closes when the search saturates; search again with a fresh call.
    pub fn search(&mut self, topic: TopicId) -> mpsc::Receiver<NodeRecord> {
        debug!(topic = %hex::encode(&topic[..8]), "starting topic search");
        let (handle, results) = start_search(self.transport.clone(), topic, self.config.clone());
        self.searches.push(handle);
        results
    }

    /// Tear down every registration and search. In-flight requests are
    /// abandoned.
    pub async fn stop(&mut self) {
        for (_, handle) in self.reg.drain() {
            handle.stop().await;
        }
        for handle in self.searches.drain(..) {
            handle.stop().await;
        }
    }
}

/// Quit signal plus the tasks serving one topic.
struct TopicHandle {
    quit: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TopicHandle {
    async fn stop(self) {
        let _ = self.quit.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Sleep until `at` on the driver clock.
async fn sleep_until_abs(clock: &dyn Clock, at: AbsTime) {
    sleep(at.saturating_since(clock.now())).await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration runtime
// ─────────────────────────────────────────────────────────────────────────────

struct RegRequest {
    id: AttemptId,
    node: NodeRecord,
    ticket: Vec<u8>,
}

struct RegResponse {
    id: AttemptId,
    outcome: Result<RegConfirmation>,
}

fn start_registration<T: TopicTransport>(
    transport: Arc<T>,
    topic: TopicId,
    cfg: Config,
) -> TopicHandle {
    let (quit_tx, quit_rx) = watch::channel(false);
    let (target_tx, target_rx) = mpsc::channel(1);
    let (nodes_tx, nodes_rx) = mpsc::channel(1);
    let (req_tx, req_rx) = mpsc::channel(1);
    let (resp_tx, resp_rx) = mpsc::channel(1);

    let clock = cfg.clock.clone();
    let state = Registration::new(topic, cfg);
    let tasks = vec![
        tokio::spawn(registration_loop(
            state,
            clock,
            target_tx,
            nodes_rx,
            req_tx,
            resp_rx,
            quit_rx.clone(),
        )),
        tokio::spawn(lookup_worker(
            transport.clone(),
            target_rx,
            nodes_tx,
            Some(REG_LOOKUP_INTERVAL),
            quit_rx.clone(),
        )),
        tokio::spawn(register_worker(transport, topic, req_rx, resp_tx, quit_rx)),
    ];
    TopicHandle {
        quit: quit_tx,
        tasks,
    }
}

/// Control loop owning a [`Registration`].
async fn registration_loop(
    mut state: Registration,
    clock: Arc<dyn Clock>,
    target_tx: mpsc::Sender<NodeId>,
    mut nodes_rx: mpsc::Receiver<Vec<NodeRecord>>,
    req_tx: mpsc::Sender<RegRequest>,
    mut resp_rx: mpsc::Receiver<RegResponse>,
    mut quit: watch::Receiver<bool>,
) {
    // The attempt picked by update(), waiting for the request worker to
    // become free.
    let mut staged: Option<AttemptId> = None;

    loop {
        // Updates are disabled while an attempt is staged for dispatch.
        let next = if staged.is_none() {
            state.next_update_time()
        } else {
            AbsTime::NEVER
        };

        tokio::select! {
            _ = quit.changed() => return,

            // Keep the lookup worker supplied with a target whenever it is
            // ready for one.
            Ok(permit) = target_tx.reserve() => {
                permit.send(state.lookup_target());
            }
            Some(nodes) = nodes_rx.recv() => {
                state.add_nodes(&nodes);
            }

            // Attempt queue updates.
            _ = sleep_until_abs(&*clock, next), if next != AbsTime::NEVER => {
                staged = state.update();
            }

            // Registration requests.
            Ok(permit) = req_tx.reserve(), if staged.is_some() => {
                let id = staged.take().expect("staged attempt");
                state.start_request(id);
                let att = state.attempt(id);
                permit.send(RegRequest {
                    id,
                    node: att.node().clone(),
                    ticket: att.ticket().to_vec(),
                });
            }
            Some(resp) = resp_rx.recv() => {
                match resp.outcome {
                    Err(err) => state.handle_error_response(resp.id, &err),
                    Ok(conf) => {
                        let wait = conf.wait_time();
                        if conf.is_confirmation() {
                            state.handle_registered(resp.id, wait);
                        } else {
                            state.handle_ticket_response(resp.id, conf.ticket, wait);
                        }
                    }
                }
            }
        }
    }
}

/// Performs iterative lookups for the control loop, one target at a time.
///
/// Failed lookups fold in as empty batches so the state machines still see
/// the lookup round. `rest` spaces out consecutive walks.
async fn lookup_worker<T: TopicTransport>(
    transport: Arc<T>,
    mut targets: mpsc::Receiver<NodeId>,
    results: mpsc::Sender<Vec<NodeRecord>>,
    rest: Option<Duration>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        let target = tokio::select! {
            _ = quit.changed() => return,
            next = targets.recv() => match next {
                Some(target) => target,
                None => return,
            },
        };

        let nodes = match transport.lookup(target).await {
            Ok(nodes) => nodes,
            Err(err) => {
                debug!(target = %hex::encode(&target[..8]), %err, "topic lookup failed");
                Vec::new()
            }
        };
        tokio::select! {
            _ = quit.changed() => return,
            _ = results.send(nodes) => {}
        }

        if let Some(d) = rest {
            tokio::select! {
                _ = quit.changed() => return,
                _ = sleep(d) => {}
            }
        }
    }
}

/// Performs topic-register round-trips, one at a time.
async fn register_worker<T: TopicTransport>(
    transport: Arc<T>,
    topic: TopicId,
    mut requests: mpsc::Receiver<RegRequest>,
    responses: mpsc::Sender<RegResponse>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        let req = tokio::select! {
            _ = quit.changed() => return,
            next = requests.recv() => match next {
                Some(req) => req,
                None => return,
            },
        };

        trace!(id = %hex::encode(&req.node.id[..8]), "sending topic-register");
        let outcome = transport.topic_register(&req.node, topic, &req.ticket).await;
        tokio::select! {
            _ = quit.changed() => return,
            _ = responses.send(RegResponse { id: req.id, outcome }) => {}
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Search runtime
// ─────────────────────────────────────────────────────────────────────────────

struct QueryResponse {
    from: NodeRecord,
    outcome: Result<Vec<NodeRecord>>,
}

fn start_search<T: TopicTransport>(
    transport: Arc<T>,
    topic: TopicId,
    cfg: Config,
) -> (TopicHandle, mpsc::Receiver<NodeRecord>) {
    let (quit_tx, quit_rx) = watch::channel(false);
    let (target_tx, target_rx) = mpsc::channel(1);
    let (nodes_tx, nodes_rx) = mpsc::channel(1);
    let (query_tx, query_rx) = mpsc::channel(1);
    let (resp_tx, resp_rx) = mpsc::channel(1);
    let (results_tx, results_rx) = mpsc::channel(SEARCH_RESULT_BUFFER);

    let clock = cfg.clock.clone();
    let state = Search::new(topic, cfg);
    let tasks = vec![
        tokio::spawn(search_loop(
            state,
            clock,
            target_tx,
            nodes_rx,
            query_tx,
            resp_rx,
            results_tx,
            quit_rx.clone(),
        )),
        tokio::spawn(lookup_worker(
            transport.clone(),
            target_rx,
            nodes_tx,
            None,
            quit_rx.clone(),
        )),
        tokio::spawn(query_worker(transport, topic, query_rx, resp_tx, quit_rx)),
    ];
    (
        TopicHandle {
            quit: quit_tx,
            tasks,
        },
        results_rx,
    )
}

/// Control loop owning a [`Search`].
#[allow(clippy::too_many_arguments)]
async fn search_loop(
    mut state: Search,
    clock: Arc<dyn Clock>,
    target_tx: mpsc::Sender<NodeId>,
    mut nodes_rx: mpsc::Receiver<Vec<NodeRecord>>,
    query_tx: mpsc::Sender<NodeRecord>,
    mut resp_rx: mpsc::Receiver<QueryResponse>,
    results_tx: mpsc::Sender<NodeRecord>,
    mut quit: watch::Receiver<bool>,
) {
    // Set once the lookup pacing delay has elapsed; cleared when a target is
    // handed to the lookup worker.
    let mut lookup_due = false;
    let mut query_in_flight = false;

    loop {
        if state.is_done() && !query_in_flight {
            debug!(
                topic = %hex::encode(&state.topic()[..8]),
                results = state.num_results(),
                "topic search finished"
            );
            // Dropping the channels closes the consumer stream and winds down
            // the workers.
            return;
        }

        let next_lookup = state.next_lookup_time();
        let query_target = if query_in_flight {
            None
        } else {
            state.query_target()
        };
        let pending_result = state.peek_result().cloned();

        tokio::select! {
            _ = quit.changed() => return,

            // Lookup management: wait out the pacing delay, then hand a
            // target to the worker as soon as it is free.
            _ = sleep_until_abs(&*clock, next_lookup), if !lookup_due => {
                lookup_due = true;
            }
            Ok(permit) = target_tx.reserve(), if lookup_due => {
                permit.send(state.lookup_target());
                lookup_due = false;
            }
            Some(nodes) = nodes_rx.recv() => {
                state.add_nodes(None, &nodes);
            }

            // Queries, one in flight at a time.
            Ok(permit) = query_tx.reserve(), if query_target.is_some() => {
                let node = query_target.expect("query target");
                query_in_flight = true;
                permit.send(node);
            }
            Some(resp) = resp_rx.recv() => {
                query_in_flight = false;
                match resp.outcome {
                    Ok(nodes) => state.add_query_results(&resp.from, &nodes),
                    Err(err) => {
                        debug!(
                            id = %hex::encode(&resp.from.id[..8]),
                            %err,
                            "topic query failed"
                        );
                        // Still mark the node as asked; failed registrars are
                        // not re-queried.
                        state.add_query_results(&resp.from, &[]);
                    }
                }
            }

            // Drain the result buffer toward the consumer.
            Ok(permit) = results_tx.reserve(), if pending_result.is_some() => {
                permit.send(pending_result.expect("pending result"));
                state.pop_result();
            }
        }
    }
}

/// Performs topic-query round-trips, one at a time.
async fn query_worker<T: TopicTransport>(
    transport: Arc<T>,
    topic: TopicId,
    mut queries: mpsc::Receiver<NodeRecord>,
    responses: mpsc::Sender<QueryResponse>,
    mut quit: watch::Receiver<bool>,
) {
    loop {
        let node = tokio::select! {
            _ = quit.changed() => return,
            next = queries.recv() => match next {
                Some(node) => node,
                None => return,
            },
        };

        trace!(id = %hex::encode(&node.id[..8]), "sending topic-query");
        let outcome = transport.topic_query(&node, topic).await;
        tokio::select! {
            _ = quit.changed() => return,
            _ = responses.send(QueryResponse { from: node, outcome }) => {}
        }
    }
}
