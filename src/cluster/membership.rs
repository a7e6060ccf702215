//! Cluster Membership
//!
//! Parent-side set of admitted children, keyed by remote node identifier and
//! bounded by the configured child cap.

use std::collections::HashMap;

use crate::remote::ChannelId;

/// Outcome of an admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// New member added
    Admitted,
    /// Remote was already a member; its entry now points at the new channel
    Replaced(ChannelId),
    /// Cap reached, nothing changed
    Rejected,
}

/// Admitted children of a parent node
#[derive(Debug, Clone)]
pub struct Membership {
    cap: usize,
    members: HashMap<String, ChannelId>,
}

impl Membership {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            members: HashMap::with_capacity(cap),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.cap
    }

    pub fn contains(&self, remote_id: &str) -> bool {
        self.members.contains_key(remote_id)
    }

    pub fn channel_of(&self, remote_id: &str) -> Option<ChannelId> {
        self.members.get(remote_id).copied()
    }

    /// Whether `channel` is the current channel of some member
    pub fn has_channel(&self, channel: ChannelId) -> bool {
        self.members.values().any(|c| *c == channel)
    }

    /// Admit `remote_id` on `channel`.
    ///
    /// Re-admitting a known remote never grows the set; it swaps the channel.
    pub fn admit(&mut self, remote_id: &str, channel: ChannelId) -> Admission {
        if let Some(current) = self.members.get_mut(remote_id) {
            if *current == channel {
                return Admission::Admitted;
            }
            let old = std::mem::replace(current, channel);
            return Admission::Replaced(old);
        }
        if self.is_full() {
            return Admission::Rejected;
        }
        self.members.insert(remote_id.to_string(), channel);
        Admission::Admitted
    }

    /// Remove the member bound to `channel`, returning its remote id.
    ///
    /// A channel that was already replaced by a newer one removes nothing.
    pub fn remove_channel(&mut self, channel: ChannelId) -> Option<String> {
        let remote_id = self
            .members
            .iter()
            .find(|(_, c)| **c == channel)
            .map(|(r, _)| r.clone())?;
        self.members.remove(&remote_id);
        Some(remote_id)
    }

    /// Channels of all members
    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.members.values().copied()
    }

    /// Remove and return every member
    pub fn drain(&mut self) -> Vec<(String, ChannelId)> {
        self.members.drain().collect()
    }
}
