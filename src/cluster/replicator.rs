//! State Replicator
//!
//! Holds the node's timer collection and turns it into `SYNC_STATE`
//! snapshots. On an owning node the snapshot is pushed to children after
//! every mutation; on a child node incoming snapshots replace the collection
//! wholesale.

use bytes::Bytes;
use tracing::warn;

use crate::protocol::{PeerMessage, ProtocolError};
use crate::remote::Channel;
use crate::timer::{Timer, TimerCollection, TimerError};

#[derive(Debug)]
pub struct StateReplicator {
    timers: TimerCollection,
}

impl StateReplicator {
    pub fn new(max_timers: usize) -> Self {
        Self {
            timers: TimerCollection::new(max_timers),
        }
    }

    pub fn timers(&self) -> &TimerCollection {
        &self.timers
    }

    pub fn timers_mut(&mut self) -> &mut TimerCollection {
        &mut self.timers
    }

    /// Encode the current collection as one `SYNC_STATE` body
    pub fn snapshot(&self) -> Result<Bytes, ProtocolError> {
        PeerMessage::sync_state(&self.timers).encode()
    }

    /// Send the current snapshot to every target. Returns how many sends
    /// were accepted.
    pub fn broadcast<'a, I>(&self, targets: I) -> usize
    where
        I: IntoIterator<Item = &'a dyn Channel>,
    {
        let body = match self.snapshot() {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode snapshot: {}", e);
                return 0;
            }
        };
        let mut sent = 0;
        for channel in targets {
            match channel.send(body.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(
                    "Snapshot to {} ({}) failed: {}",
                    channel.remote_id(),
                    channel.id(),
                    e
                ),
            }
        }
        sent
    }

    /// Send the current snapshot to a single channel
    pub fn send_snapshot(&self, channel: &dyn Channel) -> bool {
        self.broadcast(std::iter::once(channel)) == 1
    }

    /// Replace the collection with a snapshot received from the parent.
    /// Nothing changes if the snapshot is invalid.
    pub fn apply_snapshot(&mut self, timers: Vec<Timer>) -> Result<(), TimerError> {
        self.timers.replace(timers)
    }
}
