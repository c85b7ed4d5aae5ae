//! Core topic-discovery logic: pure, single-threaded, clock-driven state machines.
//!
//! This module contains the fundamental building blocks of the subsystem:
//!
//! - **Identity & Distance**: [`NodeId`], [`TopicId`], [`log_dist`], [`random_id_at`]
//! - **Records**: [`NodeRecord`], a signed/versioned peer record abstraction
//! - **Time**: [`AbsTime`], the [`Clock`] trait, [`SystemClock`] and [`ManualClock`]
//! - **Advertising**: [`Registration`], the per-topic state of placing our own
//!   record on remote registrars
//! - **Seeking**: [`Search`], the per-topic state of collecting topic-bearing
//!   peer records
//!
//! Both state machines are deliberately free of I/O and concurrency: they
//! expose decisions ("who should I contact next", "is this search done") and
//! accept events ("the lookup produced these nodes", "this registrar gave me a
//! ticket"). The surrounding runtime lives in [`crate::driver`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

// ============================================================================
// Type Aliases
// ============================================================================

/// A 256-bit identifier for nodes, derived from the node's public key.
pub type NodeId = [u8; 32];

/// A 256-bit application-chosen identifier that peers rendezvous on.
///
/// Topics are treated exactly like node identifiers for distance purposes,
/// so both advertisers and seekers converge on the region of the keyspace
/// surrounding the topic.
pub type TopicId = [u8; 32];

// ============================================================================
// Configuration Constants
// ============================================================================

/// Number of buckets kept in the registration table.
///
/// The table only distinguishes nodes at `log_dist(topic, n) > 256 - REG_TABLE_DEPTH`.
/// Any node closer than that goes into the overflow bucket.
pub const REG_TABLE_DEPTH: usize = 40;

/// Maximum number of Standby (replacement) attempts per registration bucket.
pub const REG_BUCKET_MAX_REPLACEMENTS: usize = 20;

/// Number of buckets kept in the search table.
pub const SEARCH_TABLE_DEPTH: usize = 40;

/// Minimum delay between two iterative lookups started by a single search.
pub const SEARCH_LOOKUP_MIN_DELAY: Duration = Duration::from_secs(3);

/// Default target count of concurrently Waiting attempts per registration bucket.
const DEFAULT_REG_BUCKET_SIZE: usize = 10;

/// Default cap on tracked nodes (candidates plus already-queried) per search bucket.
const DEFAULT_SEARCH_BUCKET_SIZE: usize = 16;

// ============================================================================
// Identity and Distance
// ============================================================================

/// Derive a stable 256-bit [`TopicId`] by hashing an application-chosen name
/// with BLAKE3.
///
/// ```
/// use topic_discovery::topic_id;
///
/// let topic = topic_id(b"my-application/v1");
/// assert_eq!(topic, topic_id(b"my-application/v1"));
/// assert_ne!(topic, topic_id(b"my-application/v2"));
/// ```
pub fn topic_id(name: &[u8]) -> TopicId {
    *blake3::hash(name).as_bytes()
}

/// Compute the Kademlia XOR log-distance between two 256-bit identifiers.
///
/// The result is `256 - leading_zero_bits(a XOR b)`, which is 0 iff `a == b`
/// and 256 when the identifiers differ in their first bit.
pub fn log_dist(a: &NodeId, b: &NodeId) -> usize {
    let mut leading = 0;
    for i in 0..32 {
        let x = a[i] ^ b[i];
        if x == 0 {
            leading += 8;
        } else {
            leading += x.leading_zeros() as usize;
            return 256 - leading;
        }
    }
    0
}

/// Sample a uniformly random identifier whose log-distance to `center` is
/// exactly `dist`.
///
/// Flips the bit that fixes the distance, then randomizes every bit below it.
/// For `dist == 0` the only such identifier is `center` itself.
pub fn random_id_at(center: &NodeId, dist: usize) -> NodeId {
    assert!(dist <= 256, "log-distance out of range: {dist}");
    if dist == 0 {
        return *center;
    }

    let mut id = *center;
    // The bit at offset 256 - dist from the MSB determines the distance.
    let pos = 256 - dist;
    id[pos / 8] ^= 0x80 >> (pos % 8);

    // Randomize the dist - 1 trailing bits.
    let mut rng = rand::thread_rng();
    let trailing = dist - 1;
    for i in 0..trailing / 8 {
        id[31 - i] = rand::Rng::gen(&mut rng);
    }
    let rem = trailing % 8;
    if rem > 0 {
        let idx = 31 - trailing / 8;
        let mask = (1u8 << rem) - 1;
        let random: u8 = rand::Rng::gen(&mut rng);
        id[idx] = (id[idx] & !mask) | (random & mask);
    }
    id
}

// ============================================================================
// Node Records
// ============================================================================

/// A signed, versioned record describing another node.
///
/// Records are immutable once constructed and comparable by sequence number:
/// a record with a higher `seq` supersedes an earlier one for the same id.
/// The signature itself is validated by the record store collaborator before
/// a record ever reaches this crate.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// The node's unique identifier.
    pub id: NodeId,
    /// Sequence number of this version of the record.
    pub seq: u64,
    /// Serialized endpoint address for contacting the node.
    pub addr: String,
}

impl NodeRecord {
    /// Create a new record.
    pub fn new(id: NodeId, seq: u64, addr: impl Into<String>) -> Self {
        Self {
            id,
            seq,
            addr: addr.into(),
        }
    }
}

// ============================================================================
// Time
// ============================================================================

/// An absolute instant on the monotonic clock driving the state machines.
///
/// Internally nanoseconds since the clock's origin. [`AbsTime::NEVER`] is the
/// "infinitely far future" sentinel used by [`Registration::next_update_time`]
/// when there is nothing scheduled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsTime(u64);

impl AbsTime {
    /// The clock origin.
    pub const ZERO: AbsTime = AbsTime(0);

    /// An instant that never arrives.
    pub const NEVER: AbsTime = AbsTime(u64::MAX);

    /// Add a duration, saturating at [`AbsTime::NEVER`].
    pub fn saturating_add(self, d: Duration) -> AbsTime {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        AbsTime(self.0.saturating_add(nanos))
    }

    /// Duration elapsed since `earlier`, zero if `earlier` is later.
    pub fn saturating_since(self, earlier: AbsTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for AbsTime {
    type Output = AbsTime;

    fn add(self, rhs: Duration) -> AbsTime {
        self.saturating_add(rhs)
    }
}

/// Monotonic time source consulted by the state machines.
///
/// The core never sleeps and never reads wall-clock time; everything is
/// derived from `now()`, which makes the machines fully deterministic under a
/// [`ManualClock`].
pub trait Clock: Send + Sync {
    /// The current instant. Resolution must be 1ms or better.
    fn now(&self) -> AbsTime;
}

/// Production clock anchored to a std monotonic instant at construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the moment of construction.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> AbsTime {
        let nanos = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        AbsTime(nanos)
    }
}

/// Hand-advanced clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock stopped at the origin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the clock by `d`.
    pub fn advance(&self, d: Duration) {
        let nanos = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> AbsTime {
        AbsTime(self.nanos.load(Ordering::SeqCst))
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration shared by the registration and search state machines.
#[derive(Clone)]
pub struct Config {
    /// The local node's identifier, filtered out on every ingest.
    pub self_id: NodeId,
    /// Monotonic time source.
    pub clock: Arc<dyn Clock>,
    /// Target count of concurrently Waiting attempts per registration bucket.
    pub reg_bucket_size: usize,
    /// Cap on tracked nodes (candidates plus already-queried) per search bucket.
    pub search_bucket_size: usize,
    /// Drop a registration attempt whose registrar advertises a wait longer
    /// than this. Disabled by default.
    pub max_reg_wait_time: Option<Duration>,
    /// Drop a registration attempt after this many ticket rounds.
    /// Disabled by default.
    pub max_reg_retries: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            self_id: [0u8; 32],
            clock: Arc::new(SystemClock::new()),
            reg_bucket_size: DEFAULT_REG_BUCKET_SIZE,
            search_bucket_size: DEFAULT_SEARCH_BUCKET_SIZE,
            max_reg_wait_time: None,
            max_reg_retries: None,
        }
    }
}

impl Config {
    /// Replace zero-valued sizes with their defaults.
    fn with_defaults(mut self) -> Self {
        if self.reg_bucket_size == 0 {
            self.reg_bucket_size = DEFAULT_REG_BUCKET_SIZE;
        }
        if self.search_bucket_size == 0 {
            self.search_bucket_size = DEFAULT_SEARCH_BUCKET_SIZE;
        }
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration Attempts
// ─────────────────────────────────────────────────────────────────────────────

/// State of a registration attempt on a single registrar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegState {
    /// Known candidate, not yet being contacted.
    Standby,
    /// Actively trying to register; `next_time` is the next attempt.
    Waiting,
    /// Ad placed; `next_time` is when it expires.
    Registered,
}

const N_REG_STATES: usize = 3;

/// Where an attempt currently sits relative to the attempt heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueSlot {
    /// Not scheduled. Only Standby attempts are idle.
    Idle,
    /// Scheduled at this position in the heap.
    Queued(usize),
    /// A registration request is in flight; off the heap until the response
    /// is handled.
    InFlight,
}

/// Stable handle to a registration attempt in its arena.
///
/// Handles are returned by [`Registration::update`] and passed back into the
/// `start_request` / `handle_*` operations. A handle is invalidated when the
/// attempt is removed; using a stale handle is a programmer error and panics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AttemptId(usize);

/// The state of the registration process against a single registrar node.
pub struct RegAttempt {
    node: NodeRecord,
    state: RegState,
    /// In state Waiting: the time of the next registration attempt.
    /// In state Registered: the time the ad expires.
    next_time: AbsTime,
    /// Ticket data returned by the last registration call.
    ticket: Vec<u8>,
    /// Time spent waiting on tickets so far.
    total_wait_time: Duration,
    /// Number of ticket rounds completed.
    retries: u32,
    /// Index of the owning bucket.
    bucket: usize,
    slot: QueueSlot,
}

impl RegAttempt {
    /// The registrar node's record.
    pub fn node(&self) -> &NodeRecord {
        &self.node
    }

    /// Current state of the attempt.
    pub fn state(&self) -> RegState {
        self.state
    }

    /// When the next action related to this attempt must occur.
    pub fn next_time(&self) -> AbsTime {
        self.next_time
    }

    /// Ticket to present on the next registration call. Empty until the
    /// registrar has issued one.
    pub fn ticket(&self) -> &[u8] {
        &self.ticket
    }

    /// Accumulated ticket wait time across retries.
    pub fn total_wait_time(&self) -> Duration {
        self.total_wait_time
    }
}

/// Slotted arena owning every live [`RegAttempt`].
///
/// Buckets and the heap refer to attempts by [`AttemptId`]; the arena is the
/// single owner, which keeps the cross-structure back-references (bucket map,
/// heap position) as plain indices.
struct AttemptArena {
    slots: Vec<Option<RegAttempt>>,
    free: Vec<usize>,
}

impl AttemptArena {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, att: RegAttempt) -> AttemptId {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(att);
                AttemptId(idx)
            }
            None => {
                self.slots.push(Some(att));
                AttemptId(self.slots.len() - 1)
            }
        }
    }

    fn remove(&mut self, id: AttemptId) -> RegAttempt {
        let att = self.slots[id.0].take().expect("stale attempt handle");
        self.free.push(id.0);
        att
    }

    fn get(&self, id: AttemptId) -> &RegAttempt {
        self.slots[id.0].as_ref().expect("stale attempt handle")
    }

    fn get_mut(&mut self, id: AttemptId) -> &mut RegAttempt {
        self.slots[id.0].as_mut().expect("stale attempt handle")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Attempt Heap
// ─────────────────────────────────────────────────────────────────────────────

/// Binary min-heap of attempts ordered by `next_time`.
///
/// Every sift writes the new position back into the attempt's queue slot, so
/// removal by handle is O(log n). The invariant `heap[pos] == att` for every
/// queued attempt is what the rest of the registration machine leans on.
struct AttemptHeap {
    order: Vec<AttemptId>,
}

impl AttemptHeap {
    fn new() -> Self {
        Self { order: Vec::new() }
    }

    fn peek(&self) -> Option<AttemptId> {
        self.order.first().copied()
    }

    fn push(&mut self, arena: &mut AttemptArena, id: AttemptId) {
        if let QueueSlot::Queued(_) = arena.get(id).slot {
            panic!("pushing attempt that is already queued");
        }
        let pos = self.order.len();
        self.order.push(id);
        arena.get_mut(id).slot = QueueSlot::Queued(pos);
        self.sift_up(arena, pos);
    }

    /// Remove `id` from the heap and mark it idle.
    fn remove(&mut self, arena: &mut AttemptArena, id: AttemptId) {
        let pos = match arena.get(id).slot {
            QueueSlot::Queued(pos) => pos,
            slot => panic!("removing attempt that is not queued: {slot:?}"),
        };
        let last = self.order.len() - 1;
        self.order.swap(pos, last);
        let removed = self.order.pop().expect("heap is empty");
        debug_assert_eq!(removed, id);
        arena.get_mut(removed).slot = QueueSlot::Idle;
        if pos < self.order.len() {
            arena.get_mut(self.order[pos]).slot = QueueSlot::Queued(pos);
            self.sift_down(arena, pos);
            self.sift_up(arena, pos);
        }
    }

    fn less(&self, arena: &AttemptArena, a: usize, b: usize) -> bool {
        arena.get(self.order[a]).next_time < arena.get(self.order[b]).next_time
    }

    fn swap(&mut self, arena: &mut AttemptArena, a: usize, b: usize) {
        self.order.swap(a, b);
        arena.get_mut(self.order[a]).slot = QueueSlot::Queued(a);
        arena.get_mut(self.order[b]).slot = QueueSlot::Queued(b);
    }

    fn sift_up(&mut self, arena: &mut AttemptArena, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(arena, pos, parent) {
                break;
            }
            self.swap(arena, pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, arena: &mut AttemptArena, mut pos: usize) {
        loop {
            let mut smallest = pos;
            for child in [2 * pos + 1, 2 * pos + 2] {
                if child < self.order.len() && self.less(arena, child, smallest) {
                    smallest = child;
                }
            }
            if smallest == pos {
                return;
            }
            self.swap(arena, pos, smallest);
            pos = smallest;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────────────────

struct RegBucket {
    /// Log-distance band this bucket covers.
    dist: usize,
    att: HashMap<NodeId, AttemptId>,
    count: [usize; N_REG_STATES],
}

/// The state associated with advertising a single topic.
///
/// Candidate registrars are partitioned into [`REG_TABLE_DEPTH`] buckets by
/// log-distance to the topic. Per bucket, up to `reg_bucket_size` attempts are
/// kept Waiting (actively contacted) and up to [`REG_BUCKET_MAX_REPLACEMENTS`]
/// more on Standby as replacements. A single min-heap schedules the next
/// action across all buckets.
pub struct Registration {
    topic: TopicId,
    cfg: Config,
    /// Buckets ordered close to far: bucket 0 covers the overflow band.
    buckets: Vec<RegBucket>,
    arena: AttemptArena,
    heap: AttemptHeap,
}

impl Registration {
    /// Create the registration state for a topic.
    pub fn new(topic: TopicId, cfg: Config) -> Self {
        let cfg = cfg.with_defaults();
        let mut buckets = Vec::with_capacity(REG_TABLE_DEPTH);
        for i in 0..REG_TABLE_DEPTH {
            buckets.push(RegBucket {
                dist: 256 - (REG_TABLE_DEPTH - 1) + i,
                att: HashMap::new(),
                count: [0; N_REG_STATES],
            });
        }
        Self {
            topic,
            cfg,
            buckets,
            arena: AttemptArena::new(),
            heap: AttemptHeap::new(),
        }
    }

    /// The topic being advertised.
    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// The identifier the next iterative lookup should be steered toward.
    ///
    /// Picks a random identifier in the band of the first bucket holding no
    /// Registered attempt, biasing exploration toward uncovered distance
    /// bands. Once every bucket holds a registration, the topic itself is the
    /// target.
    pub fn lookup_target(&self) -> NodeId {
        for b in &self.buckets {
            if b.count[RegState::Registered as usize] == 0 {
                return random_id_at(&self.topic, b.dist);
            }
        }
        self.topic
    }

    /// Fold nodes produced by the lookup engine into the candidate table.
    pub fn add_nodes(&mut self, nodes: &[NodeRecord]) {
        for n in nodes {
            if n.id == self.cfg.self_id {
                continue;
            }

            let bi = self.bucket_index(&n.id);
            if let Some(&id) = self.buckets[bi].att.get(&n.id) {
                // There is already an attempt scheduled with this node.
                // Upgrade the record if the incoming one is newer.
                let att = self.arena.get_mut(id);
                if att.node.seq < n.seq {
                    att.node = n.clone();
                }
                continue;
            }

            if self.buckets[bi].count[RegState::Standby as usize] >= REG_BUCKET_MAX_REPLACEMENTS {
                // Enough replacements already, ignore the node.
                continue;
            }

            let id = self.arena.insert(RegAttempt {
                node: n.clone(),
                state: RegState::Standby,
                next_time: AbsTime::ZERO,
                ticket: Vec::new(),
                total_wait_time: Duration::ZERO,
                retries: 0,
                bucket: bi,
                slot: QueueSlot::Idle,
            });
            self.buckets[bi].att.insert(n.id, id);
            self.buckets[bi].count[RegState::Standby as usize] += 1;
            self.refill(bi);
        }
    }

    /// The next time [`Registration::update`] should be called, or
    /// [`AbsTime::NEVER`] when nothing is scheduled.
    pub fn next_update_time(&self) -> AbsTime {
        match self.heap.peek() {
            None => AbsTime::NEVER,
            Some(id) => {
                let att = self.arena.get(id);
                match att.state {
                    RegState::Standby => panic!("standby attempt in registration heap"),
                    RegState::Waiting | RegState::Registered => att.next_time,
                }
            }
        }
    }

    /// Process the attempt queue.
    ///
    /// Returns the next ripe Waiting attempt, which the caller is expected to
    /// dispatch via [`Registration::start_request`]. Expired registrations are
    /// cleaned up and `None` is returned; the caller re-invokes on the next
    /// tick of [`Registration::next_update_time`].
    pub fn update(&mut self) -> Option<AttemptId> {
        let now = self.cfg.clock.now();
        let id = self.heap.peek()?;
        let att = self.arena.get(id);
        match att.state {
            RegState::Standby => panic!("standby attempt in registration heap"),
            RegState::Registered => {
                if now >= att.next_time {
                    // The ad has expired; free the slot.
                    let bi = att.bucket;
                    self.remove_attempt(id);
                    self.refill(bi);
                }
                None
            }
            RegState::Waiting => {
                if now >= att.next_time {
                    Some(id)
                } else {
                    None
                }
            }
        }
    }

    /// Mark an attempt as in flight. Must be called when the registration
    /// request for a ripe attempt is sent.
    pub fn start_request(&mut self, id: AttemptId) {
        let state = self.arena.get(id).state;
        if state != RegState::Waiting {
            panic!("start_request for attempt with state {state:?}");
        }
        self.heap.remove(&mut self.arena, id);
        self.arena.get_mut(id).slot = QueueSlot::InFlight;
    }

    /// The registrar responded with a ticket and a waiting time.
    ///
    /// The attempt stays Waiting and is rescheduled for `now + wait_time`.
    /// When the configured wait or retry cap is exceeded, the attempt is
    /// dropped instead, exactly as an error response would drop it.
    pub fn handle_ticket_response(&mut self, id: AttemptId, ticket: Vec<u8>, wait_time: Duration) {
        self.validate_in_flight(id);
        let now = self.cfg.clock.now();
        let max_wait = self.cfg.max_reg_wait_time;
        let max_retries = self.cfg.max_reg_retries;

        let att = self.arena.get_mut(id);
        att.retries += 1;
        att.total_wait_time = att.total_wait_time.saturating_add(wait_time);
        let over_cap = max_wait.is_some_and(|max| wait_time > max)
            || max_retries.is_some_and(|max| att.retries > max);
        if over_cap {
            debug!(
                id = %hex::encode(&att.node.id[..8]),
                wait = ?wait_time,
                retries = att.retries,
                "registration attempt dropped by wait/retry cap"
            );
            let bi = att.bucket;
            self.remove_attempt(id);
            self.refill(bi);
            return;
        }

        att.ticket = ticket;
        att.next_time = now + wait_time;
        self.heap.push(&mut self.arena, id);
    }

    /// The registrar confirmed the ad; it expires after `ttl`.
    pub fn handle_registered(&mut self, id: AttemptId, ttl: Duration) {
        self.validate_in_flight(id);
        trace!(
            id = %hex::encode(&self.arena.get(id).node.id[..8]),
            "topic registration successful"
        );
        self.set_state(id, RegState::Registered);
        let now = self.cfg.clock.now();
        let att = self.arena.get_mut(id);
        att.next_time = now + ttl;
        let bi = att.bucket;
        self.heap.push(&mut self.arena, id);

        // A Waiting slot freed up.
        self.refill(bi);
    }

    /// The registrar refused, or the request failed. The attempt is removed
    /// entirely and the bucket promotes a replacement.
    pub fn handle_error_response(&mut self, id: AttemptId, err: &anyhow::Error) {
        self.validate_in_flight(id);
        debug!(
            id = %hex::encode(&self.arena.get(id).node.id[..8]),
            %err,
            "topic registration failed"
        );
        let bi = self.arena.get(id).bucket;
        self.remove_attempt(id);
        self.refill(bi);
    }

    /// Look up the live attempt for a node, if any.
    pub fn attempt_for(&self, node: &NodeId) -> Option<&RegAttempt> {
        let bi = self.bucket_index(node);
        self.buckets[bi].att.get(node).map(|&id| self.arena.get(id))
    }

    /// Access an attempt by handle.
    pub fn attempt(&self, id: AttemptId) -> &RegAttempt {
        self.arena.get(id)
    }

    fn set_state(&mut self, id: AttemptId, state: RegState) {
        let att = self.arena.get_mut(id);
        let prev = att.state;
        att.state = state;
        let bi = att.bucket;
        trace!(
            id = %hex::encode(&att.node.id[..8]),
            state = ?state,
            prev = ?prev,
            "registration attempt state changed"
        );
        self.buckets[bi].count[prev as usize] -= 1;
        self.buckets[bi].count[state as usize] += 1;
    }

    /// Promote Standby attempts until the bucket has `reg_bucket_size`
    /// attempts Waiting. Must be called after every potential state change in
    /// the bucket.
    fn refill(&mut self, bi: usize) {
        while self.buckets[bi].count[RegState::Waiting as usize] < self.cfg.reg_bucket_size {
            let standby = self.buckets[bi]
                .att
                .values()
                .copied()
                .find(|&id| self.arena.get(id).state == RegState::Standby);
            let Some(id) = standby else {
                return;
            };
            self.set_state(id, RegState::Waiting);
            self.arena.get_mut(id).next_time = self.cfg.clock.now();
            self.heap.push(&mut self.arena, id);
        }
    }

    fn remove_attempt(&mut self, id: AttemptId) {
        let att = self.arena.get(id);
        let nid = att.node.id;
        let bi = att.bucket;
        if self.buckets[bi].att.get(&nid) != Some(&id) {
            panic!("removing attempt that is not in its bucket");
        }
        trace!(
            id = %hex::encode(&nid[..8]),
            state = ?att.state,
            "removing registration attempt"
        );
        if let QueueSlot::Queued(_) = att.slot {
            self.heap.remove(&mut self.arena, id);
        }
        let att = self.arena.remove(id);
        self.buckets[bi].att.remove(&nid);
        self.buckets[bi].count[att.state as usize] -= 1;
    }

    fn validate_in_flight(&self, id: AttemptId) {
        let att = self.arena.get(id);
        if att.slot != QueueSlot::InFlight {
            panic!(
                "attempt (node {} state {:?}) is not in flight: {:?}",
                hex::encode(&att.node.id[..8]),
                att.state,
                att.slot
            );
        }
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        let dist = log_dist(&self.topic, id);
        // Bucket 0 is the overflow bucket for everything closer than the
        // table's depth.
        dist.saturating_sub(256 - (REG_TABLE_DEPTH - 1))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Search
// ─────────────────────────────────────────────────────────────────────────────

struct SearchBucket {
    dist: usize,
    /// Candidates not yet queried.
    new: HashMap<NodeId, NodeRecord>,
    /// Nodes already queried.
    asked: HashSet<NodeId>,
    num_results: usize,
}

impl SearchBucket {
    fn contains(&self, id: &NodeId) -> bool {
        self.new.contains_key(id) || self.asked.contains(id)
    }

    fn count(&self) -> usize {
        self.new.len() + self.asked.len()
    }

    fn add(&mut self, n: &NodeRecord) {
        if self.asked.contains(&n.id) {
            return;
        }
        match self.new.get_mut(&n.id) {
            Some(existing) => {
                if existing.seq < n.seq {
                    *existing = n.clone();
                }
            }
            None => {
                self.new.insert(n.id, n.clone());
            }
        }
    }

    fn set_asked(&mut self, id: NodeId) {
        self.new.remove(&id);
        self.asked.insert(id);
    }
}

/// The state associated with searching a single topic.
///
/// Discovered nodes are partitioned into [`SEARCH_TABLE_DEPTH`] buckets by
/// log-distance to the topic, ordered far to close. Each bucket splits its
/// nodes into a `new` candidate set and an `asked` set; query results flow to
/// the consumer through a FIFO buffer and never back into the table.
pub struct Search {
    topic: TopicId,
    cfg: Config,
    /// Buckets ordered far to close; the last bucket is the overflow bucket.
    buckets: Vec<SearchBucket>,
    result_buffer: VecDeque<NodeRecord>,
    num_results: usize,
    queries_without_new_nodes: usize,
    last_lookup: Option<AbsTime>,
}

impl Search {
    /// Create the search state for a topic.
    pub fn new(topic: TopicId, cfg: Config) -> Self {
        let cfg = cfg.with_defaults();
        let mut buckets = Vec::with_capacity(SEARCH_TABLE_DEPTH);
        for i in 0..SEARCH_TABLE_DEPTH {
            buckets.push(SearchBucket {
                dist: 256 - i,
                new: HashMap::new(),
                asked: HashSet::new(),
                num_results: 0,
            });
        }
        Self {
            topic,
            cfg,
            buckets,
            result_buffer: VecDeque::new(),
            num_results: 0,
            queries_without_new_nodes: 0,
            last_lookup: None,
        }
    }

    /// The topic being searched.
    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// Whether the search table is saturated.
    ///
    /// True once the result buffer has drained, no unasked candidate remains,
    /// and the last two lookups produced no new nodes. A finished search
    /// should be abandoned; start a fresh instance to search again.
    pub fn is_done(&self) -> bool {
        if !self.result_buffer.is_empty() {
            return false;
        }
        if self.buckets.iter().any(|b| !b.new.is_empty()) {
            return false;
        }
        self.queries_without_new_nodes >= 2
    }

    /// Fold the results of an iterative lookup into the table.
    pub fn add_nodes(&mut self, src: Option<&NodeRecord>, nodes: &[NodeRecord]) {
        let mut any_new = false;
        for n in nodes {
            if n.id == self.cfg.self_id {
                continue;
            }
            let bi = self.bucket_index(&n.id);
            let b = &mut self.buckets[bi];
            if !b.contains(&n.id) {
                any_new = true;
            }
            if b.count() < self.cfg.search_bucket_size {
                b.add(n);
            }
        }

        trace!(
            topic = %hex::encode(&self.topic[..8]),
            src = ?src.map(|s| hex::encode(&s.id[..8])),
            count = nodes.len(),
            any_new,
            "lookup nodes folded into search table"
        );
        if any_new {
            self.queries_without_new_nodes = 0;
        } else {
            self.queries_without_new_nodes += 1;
        }
    }

    /// The earliest time the next iterative lookup may start.
    ///
    /// Enforces [`SEARCH_LOOKUP_MIN_DELAY`] between consecutive lookups.
    pub fn next_lookup_time(&self) -> AbsTime {
        match self.last_lookup {
            None => self.cfg.clock.now(),
            Some(t) => t + SEARCH_LOOKUP_MIN_DELAY,
        }
    }

    /// The identifier the next iterative lookup should be steered toward.
    /// Records the lookup start for pacing purposes.
    ///
    /// Picks a random identifier in the band of the first bucket that still
    /// has room for candidates, or the topic itself once every bucket is
    /// filled.
    pub fn lookup_target(&mut self) -> NodeId {
        self.last_lookup = Some(self.cfg.clock.now());
        for b in &self.buckets {
            if b.count() < self.cfg.search_bucket_size {
                return random_id_at(&self.topic, b.dist);
            }
        }
        self.topic
    }

    /// A node a topic query should be sent to, scanning buckets far to close.
    /// The node stays in the candidate set until the query is accounted for
    /// via [`Search::add_query_results`].
    pub fn query_target(&self) -> Option<NodeRecord> {
        for b in &self.buckets {
            if let Some(n) = b.new.values().next() {
                return Some(n.clone());
            }
        }
        None
    }

    /// Account for a topic query against `from`: the node is moved to its
    /// bucket's asked set and every result record is appended to the result
    /// buffer. Results do not re-enter the candidate table.
    pub fn add_query_results(&mut self, from: &NodeRecord, results: &[NodeRecord]) {
        let bi = self.bucket_index(&from.id);
        self.buckets[bi].set_asked(from.id);

        for n in results {
            if n.id == self.cfg.self_id {
                continue;
            }
            debug!(
                topic = %hex::encode(&self.topic[..8]),
                fromid = %hex::encode(&from.id[..8]),
                rid = %hex::encode(&n.id[..8]),
                "added topic search result"
            );
            self.buckets[bi].num_results += 1;
            self.num_results += 1;
            self.result_buffer.push_back(n.clone());
        }
    }

    /// The oldest unconsumed result, without removing it.
    pub fn peek_result(&self) -> Option<&NodeRecord> {
        self.result_buffer.front()
    }

    /// Remove the oldest unconsumed result. Panics if the buffer is empty.
    pub fn pop_result(&mut self) {
        if self.result_buffer.pop_front().is_none() {
            panic!("pop_result with empty result buffer");
        }
    }

    /// Total number of results received so far.
    pub fn num_results(&self) -> usize {
        self.num_results
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        let dist = 256 - log_dist(&self.topic, id);
        // Everything closer than the table's depth collapses into the last
        // bucket.
        dist.min(SEARCH_TABLE_DEPTH - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut id = [0u8; 32];
        id[0] = b;
        id
    }

    #[test]
    fn log_dist_of_equal_ids_is_zero() {
        let id = id_with_first_byte(0x42);
        assert_eq!(log_dist(&id, &id), 0);
    }

    #[test]
    fn log_dist_counts_from_most_significant_bit() {
        let zero = [0u8; 32];
        assert_eq!(log_dist(&zero, &id_with_first_byte(0x80)), 256);
        assert_eq!(log_dist(&zero, &id_with_first_byte(0x01)), 249);

        let mut low = [0u8; 32];
        low[31] = 0x01;
        assert_eq!(log_dist(&zero, &low), 1);
    }

    #[test]
    fn random_id_at_produces_exact_distance() {
        let center = topic_id(b"center");
        for dist in [1, 7, 8, 9, 64, 217, 250, 255, 256] {
            let id = random_id_at(&center, dist);
            assert_eq!(log_dist(&center, &id), dist, "distance {dist}");
        }
        assert_eq!(random_id_at(&center, 0), center);
    }

    #[test]
    fn topic_id_matches_blake3_reference() {
        let name = b"some-topic";
        assert_eq!(&topic_id(name), blake3::hash(name).as_bytes());
    }

    #[test]
    fn heap_orders_attempts_and_maintains_backpointers() {
        let mut arena = AttemptArena::new();
        let mut heap = AttemptHeap::new();

        let times = [50u64, 10, 40, 20, 30, 60, 5];
        let ids: Vec<AttemptId> = times
            .iter()
            .map(|&t| {
                arena.insert(RegAttempt {
                    node: NodeRecord::new([0u8; 32], 0, "n"),
                    state: RegState::Waiting,
                    next_time: AbsTime(t),
                    ticket: Vec::new(),
                    total_wait_time: Duration::ZERO,
                    retries: 0,
                    bucket: 0,
                    slot: QueueSlot::Idle,
                })
            })
            .collect();

        for &id in &ids {
            heap.push(&mut arena, id);
        }
        check_heap(&heap, &arena);

        // Remove an arbitrary middle element.
        heap.remove(&mut arena, ids[0]);
        assert_eq!(arena.get(ids[0]).slot, QueueSlot::Idle);
        check_heap(&heap, &arena);

        // The remaining attempts drain in next_time order.
        let mut drained = Vec::new();
        while let Some(id) = heap.peek() {
            drained.push(arena.get(id).next_time.0);
            heap.remove(&mut arena, id);
            check_heap(&heap, &arena);
        }
        assert_eq!(drained, vec![5, 10, 20, 30, 40, 60]);
    }

    fn check_heap(heap: &AttemptHeap, arena: &AttemptArena) {
        for (pos, &id) in heap.order.iter().enumerate() {
            assert_eq!(arena.get(id).slot, QueueSlot::Queued(pos));
            for child in [2 * pos + 1, 2 * pos + 2] {
                if child < heap.order.len() {
                    assert!(
                        arena.get(heap.order[pos]).next_time
                            <= arena.get(heap.order[child]).next_time
                    );
                }
            }
        }
    }

    fn manual_config(clock: Arc<ManualClock>) -> Config {
        Config {
            clock,
            reg_bucket_size: 2,
            ..Config::default()
        }
    }

    #[test]
    fn registration_bucket_index_clamps_close_nodes() {
        let topic = topic_id(b"t");
        let reg = Registration::new(topic, manual_config(Arc::new(ManualClock::new())));

        assert_eq!(reg.bucket_index(&random_id_at(&topic, 256)), 39);
        assert_eq!(reg.bucket_index(&random_id_at(&topic, 218)), 1);
        assert_eq!(reg.bucket_index(&random_id_at(&topic, 217)), 0);
        assert_eq!(reg.bucket_index(&random_id_at(&topic, 100)), 0);
    }

    #[test]
    fn search_bucket_index_clamps_close_nodes() {
        let topic = topic_id(b"t");
        let search = Search::new(topic, manual_config(Arc::new(ManualClock::new())));

        assert_eq!(search.bucket_index(&random_id_at(&topic, 256)), 0);
        assert_eq!(search.bucket_index(&random_id_at(&topic, 218)), 38);
        assert_eq!(search.bucket_index(&random_id_at(&topic, 217)), 39);
        assert_eq!(search.bucket_index(&random_id_at(&topic, 10)), 39);
    }

    #[test]
    fn registration_counts_match_attempt_states() {
        let clock = Arc::new(ManualClock::new());
        let topic = topic_id(b"count-check");
        let mut reg = Registration::new(topic, manual_config(clock.clone()));

        let nodes: Vec<NodeRecord> = (0..6)
            .map(|i| NodeRecord::new(random_id_at(&topic, 240), 1, format!("n{i}")))
            .collect();
        reg.add_nodes(&nodes);

        // Drive one attempt through registration, one through an error.
        let first = reg.update().expect("ripe attempt");
        reg.start_request(first);
        reg.handle_registered(first, Duration::from_secs(60));
        let second = reg.update().expect("ripe attempt");
        reg.start_request(second);
        reg.handle_error_response(second, &anyhow::anyhow!("timeout"));

        for b in &reg.buckets {
            let mut recount = [0usize; N_REG_STATES];
            for &id in b.att.values() {
                recount[reg.arena.get(id).state as usize] += 1;
            }
            assert_eq!(b.count, recount);
            assert!(b.count[RegState::Waiting as usize] <= reg.cfg.reg_bucket_size);
        }
    }

    #[test]
    fn manual_clock_advances_abs_time() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(
            clock.now().saturating_since(start),
            Duration::from_millis(1500)
        );
        assert!(clock.now() < AbsTime::NEVER);
        assert_eq!(AbsTime::NEVER + Duration::from_secs(1), AbsTime::NEVER);
    }
}
