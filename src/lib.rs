//! # Topic Discovery
//!
//! This crate implements topic-based peer discovery on top of a
//! Kademlia-style distributed hash table. Peers *advertise* that they serve a
//! named topic by placing time-bounded ads on registrar nodes near the topic
//! in the keyspace, and *find* other peers serving a topic by querying those
//! same registrars. Registrars rate-limit placement with waiting tickets; the
//! advertiser patiently re-presents its ticket until the ad is accepted.
//!
//! The crate is split into a handful of modules that can be reused
//! independently:
//!
//! - [`core`]: the pure, clock-driven state machines — [`Registration`] for
//!   the advertiser side and [`Search`] for the seeker side — along with the
//!   distance math and the [`Clock`] abstraction that makes them
//!   deterministic.
//! - [`driver`]: a tokio runtime that binds the state machines to a
//!   [`TopicTransport`], running a control loop, a lookup worker, and a
//!   request worker per active topic.
//! - [`protocol`]: the decoded wire values crossing the transport seam.
//!
//! ## Getting started
//!
//! Implement [`TopicTransport`] for your discovery transport, then drive a
//! [`TopicSystem`]:
//!
//! ```no_run
//! use anyhow::Result;
//! use async_trait::async_trait;
//! use topic_discovery::{
//!     topic_id, Config, NodeId, NodeRecord, RegConfirmation, TopicId, TopicSystem,
//!     TopicTransport,
//! };
//!
//! struct MyTransport;
//!
//! #[async_trait]
//! impl TopicTransport for MyTransport {
//!     async fn lookup(&self, target: NodeId) -> Result<Vec<NodeRecord>> {
//!         todo!("iterative Kademlia lookup")
//!     }
//!
//!     async fn topic_register(
//!         &self,
//!         node: &NodeRecord,
//!         topic: TopicId,
//!         ticket: &[u8],
//!     ) -> Result<RegConfirmation> {
//!         todo!("topic-register round-trip")
//!     }
//!
//!     async fn topic_query(&self, node: &NodeRecord, topic: TopicId) -> Result<Vec<NodeRecord>> {
//!         todo!("topic-query round-trip")
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let mut system = TopicSystem::new(MyTransport, Config::default());
//! let topic = topic_id(b"my-application/v1");
//! system.register(topic);
//!
//! let mut peers = system.search(topic);
//! while let Some(peer) = peers.recv().await {
//!     println!("found peer at {}", peer.addr);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The state machines are also usable standalone (without the driver) for
//! embedding in a custom runtime; see [`Registration`] and [`Search`].

pub mod core;
pub mod driver;
pub mod protocol;

pub use crate::core::{
    log_dist, random_id_at, topic_id, AbsTime, AttemptId, Clock, Config, ManualClock, NodeId,
    NodeRecord, RegAttempt, RegState, Registration, Search, SystemClock, TopicId,
    REG_BUCKET_MAX_REPLACEMENTS, REG_TABLE_DEPTH, SEARCH_LOOKUP_MIN_DELAY, SEARCH_TABLE_DEPTH,
};
pub use crate::driver::{TopicSystem, TopicTransport};
pub use crate::protocol::RegConfirmation;
