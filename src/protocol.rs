//! Typed values exchanged with the wire-codec collaborator.
//!
//! The wire layer (discv5 topic-register / topic-query packets) lives outside
//! this crate; what crosses the seam is the decoded response payload defined
//! here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Decoded response to a topic-register request.
///
/// A registrar answers every registration call with a waiting time and a
/// ticket. A non-empty ticket defers the advertiser: present the ticket again
/// after the wait. An empty ticket confirms the ad, and the waiting time is
/// its time-to-live.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct RegConfirmation {
    /// Waiting time (deferral) or time-to-live (confirmation), in seconds.
    pub wait_time_seconds: u32,
    /// Opaque ticket to present on the next attempt; empty on confirmation.
    pub ticket: Vec<u8>,
}

impl RegConfirmation {
    /// A confirmation carrying the ad's time-to-live.
    pub fn confirmed(ttl_seconds: u32) -> Self {
        Self {
            wait_time_seconds: ttl_seconds,
            ticket: Vec::new(),
        }
    }

    /// A deferral carrying a ticket and the time to wait before retrying.
    pub fn deferred(wait_seconds: u32, ticket: Vec<u8>) -> Self {
        Self {
            wait_time_seconds: wait_seconds,
            ticket,
        }
    }

    /// Whether this response confirms the ad (empty ticket).
    pub fn is_confirmation(&self) -> bool {
        self.ticket.is_empty()
    }

    /// The waiting time or time-to-live as a duration.
    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.wait_time_seconds))
    }
}
