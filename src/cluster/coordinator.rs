//! Cluster Coordinator
//!
//! Single owner of a node's cluster state. All inputs (directory and channel
//! notifications, fired scheduled tasks, presentation commands) arrive as
//! [`NodeEvent`]s and are applied one at a time, so ticks, edits and peer
//! traffic never interleave.
//!
//! Role transitions:
//!
//! ```text
//! STANDALONE --inbound admitted--> PARENT --last child gone--> STANDALONE
//! STANDALONE --outbound opened---> CHILD  --link lost, reconnect off--> STANDALONE
//!                                  CHILD  --link lost, reconnect on---> CHILD (retry)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::protocol::PeerMessage;
use crate::remote::{
    generate_short_id, Channel, ChannelEvent, ChannelId, Directory, DirectoryEvent,
    DirectoryFault, RegistrationState,
};
use crate::schedule::{ScheduledTask, TaskToken};
use crate::timer::{
    generate_timer_id, now_millis, TickOutcome, Timer, TimerCollection, TimerEngine, TimerError,
    TimerPatch,
};

use super::event::{Command, CommandError, NodeEvent, ScheduledKind};
use super::membership::{Admission, Membership};
use super::replicator::StateReplicator;
use super::state::{ConnectionStatus, NodeRole, NodeView};

/// Coordinator settings, usually derived from [`Config`]
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Identifier to request on first registration
    pub preferred_id: Option<String>,
    pub id_digits: u32,
    /// Identifier collisions tolerated before the fault is treated as fatal
    pub max_id_attempts: u32,
    pub directory_retry: Duration,
    pub max_children: usize,
    pub reconnect_interval: Duration,
    /// Delay between the ERROR sent to a rejected peer and closing it
    pub reject_grace: Duration,
    pub max_timers: usize,
    pub default_seconds: u64,
    pub name_prefix: String,
    pub tick_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            preferred_id: None,
            id_digits: 4,
            max_id_attempts: 8,
            directory_retry: Duration::from_secs(3),
            max_children: 4,
            reconnect_interval: Duration::from_secs(3),
            reject_grace: Duration::from_millis(500),
            max_timers: 12,
            default_seconds: 3600,
            name_prefix: "Exam Segment".to_string(),
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for CoordinatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            preferred_id: config.node.id.clone(),
            id_digits: config.node.id_digits,
            max_id_attempts: config.directory.max_id_attempts,
            directory_retry: config.directory.retry_interval,
            max_children: config.cluster.max_children,
            reconnect_interval: config.cluster.reconnect_interval,
            reject_grace: config.cluster.reject_grace,
            max_timers: config.timers.max_timers,
            default_seconds: config.timers.default_seconds,
            name_prefix: config.timers.name_prefix.clone(),
            tick_interval: config.timers.tick_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Remote dialed us, candidate child
    Inbound,
    /// We dialed the remote, parent link
    Outbound,
}

struct ChannelSlot {
    channel: Arc<dyn Channel>,
    direction: Direction,
    open: bool,
    rejected: bool,
}

/// Child-side reconnection policy
#[derive(Default)]
struct ReconnectPolicy {
    /// Cleared by user leave or DISCONNECT_NOTICE
    enabled: bool,
    /// Parent identifier of the most recent join
    target: Option<String>,
    task: Option<ScheduledTask>,
}

pub struct Coordinator {
    config: CoordinatorConfig,
    directory: Arc<dyn Directory>,
    mailbox: mpsc::Sender<NodeEvent>,
    view_tx: watch::Sender<NodeView>,

    local_id: Option<String>,
    registration: RegistrationState,
    id_attempts: u32,
    directory_retry: Option<ScheduledTask>,

    role: NodeRole,
    channels: HashMap<ChannelId, ChannelSlot>,
    membership: Membership,
    /// Outbound link to the parent, open or still connecting
    parent: Option<ChannelId>,
    reconnect: ReconnectPolicy,
    /// Join waiting for the directory registration to become live
    pending_join: Option<String>,
    pending_closes: HashMap<ChannelId, ScheduledTask>,

    replicator: StateReplicator,
    engine: TimerEngine,
    last_error: Option<String>,
    stopped: bool,
}

impl Coordinator {
    /// Create a coordinator. `mailbox` must feed the receiver later passed to
    /// [`Coordinator::run`]; scheduled tasks deliver into it.
    pub fn new(
        config: CoordinatorConfig,
        directory: Arc<dyn Directory>,
        mailbox: mpsc::Sender<NodeEvent>,
    ) -> Self {
        let (view_tx, _) = watch::channel(NodeView::new(config.max_children));
        Self {
            membership: Membership::new(config.max_children),
            replicator: StateReplicator::new(config.max_timers),
            engine: TimerEngine::new(config.tick_interval),
            config,
            directory,
            mailbox,
            view_tx,
            local_id: None,
            registration: RegistrationState::Idle,
            id_attempts: 0,
            directory_retry: None,
            role: NodeRole::Standalone,
            channels: HashMap::new(),
            parent: None,
            reconnect: ReconnectPolicy::default(),
            pending_join: None,
            pending_closes: HashMap::new(),
            last_error: None,
            stopped: false,
        }
    }

    /// Receive view updates
    pub fn subscribe_view(&self) -> watch::Receiver<NodeView> {
        self.view_tx.subscribe()
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn registration(&self) -> RegistrationState {
        self.registration
    }

    pub fn timers(&self) -> &TimerCollection {
        self.replicator.timers()
    }

    pub fn child_count(&self) -> usize {
        self.membership.len()
    }

    /// Whether the tick loop is active
    pub fn is_ticking(&self) -> bool {
        self.engine.is_running()
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.reconnect.enabled
    }

    /// Whether a reconnect attempt is scheduled
    pub fn reconnect_scheduled(&self) -> bool {
        self.reconnect.task.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Register with the directory and start the tick loop
    pub fn start(&mut self) {
        let preferred = self.config.preferred_id.clone();
        self.register(preferred);
        self.ensure_engine();
        self.publish_view();
    }

    /// Process events until shutdown
    pub async fn run(mut self, mut rx: mpsc::Receiver<NodeEvent>) {
        self.start();
        while let Some(event) = rx.recv().await {
            let shutdown = matches!(event, NodeEvent::Shutdown { .. });
            self.handle(event).await;
            if shutdown {
                break;
            }
        }
        if !self.stopped {
            self.shutdown().await;
        }
        debug!("Node '{}': coordinator stopped", self.label());
    }

    /// Apply one event and publish the resulting view
    pub async fn handle(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Directory(event) => self.on_directory(event),
            NodeEvent::Inbound { channel } => self.on_inbound(channel),
            NodeEvent::Channel { id, event } => self.on_channel(id, event),
            NodeEvent::Scheduled { token, kind } => self.on_scheduled(token, kind),
            NodeEvent::Command(command) => self.on_command(command),
            NodeEvent::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
            }
        }
        self.publish_view();
    }

    /// Build the current view
    pub fn view(&self) -> NodeView {
        NodeView {
            local_id: self.local_id.clone(),
            registration: self.registration,
            role: self.role,
            status: self.status(),
            timers: self.replicator.timers().to_vec(),
            child_count: self.membership.len(),
            child_cap: self.membership.cap(),
            target_id: self.target_id(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish_view(&self) {
        let view = self.view();
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                return false;
            }
            *current = view;
            true
        });
    }

    fn status(&self) -> ConnectionStatus {
        match self.role {
            NodeRole::Parent => ConnectionStatus::Connected,
            NodeRole::Child => {
                if self.parent_open() {
                    ConnectionStatus::Connected
                } else {
                    ConnectionStatus::Reconnecting
                }
            }
            NodeRole::Standalone => {
                if self.parent.is_some() || self.pending_join.is_some() {
                    ConnectionStatus::Connecting
                } else {
                    ConnectionStatus::Disconnected
                }
            }
        }
    }

    fn target_id(&self) -> Option<String> {
        if self.role == NodeRole::Child || self.parent.is_some() || self.pending_join.is_some() {
            self.reconnect.target.clone()
        } else {
            None
        }
    }

    fn parent_open(&self) -> bool {
        self.parent
            .and_then(|id| self.channels.get(&id))
            .is_some_and(|slot| slot.open)
    }

    fn label(&self) -> &str {
        self.local_id.as_deref().unwrap_or("-")
    }

    // ---- Directory ----

    fn register(&mut self, preferred: Option<String>) {
        if self.stopped {
            return;
        }
        self.directory_retry = None;
        let id = preferred.unwrap_or_else(|| generate_short_id(self.config.id_digits));
        debug!("Node '{}': registering as '{}'", self.label(), id);
        self.registration = RegistrationState::Pending;
        self.directory.register(Some(id));
    }

    /// Identifier to ask for when re-registering
    fn previous_id(&self) -> Option<String> {
        self.local_id
            .clone()
            .or_else(|| self.config.preferred_id.clone())
    }

    fn on_directory(&mut self, event: DirectoryEvent) {
        if self.stopped {
            return;
        }
        match event {
            DirectoryEvent::Registered(id) => {
                info!("Node '{}': registered with directory", id);
                self.local_id = Some(id);
                self.registration = RegistrationState::Live;
                self.id_attempts = 0;
                self.directory_retry = None;
                if let Some(target) = self.pending_join.take() {
                    self.open_parent_link(&target);
                }
            }
            DirectoryEvent::Lost => {
                warn!("Node '{}': directory registration lost", self.label());
                self.schedule_directory_retry();
            }
            DirectoryEvent::Failed(DirectoryFault::Transient(msg)) => {
                warn!(
                    "Node '{}': directory unavailable ({}), retrying in {:?}",
                    self.label(),
                    msg,
                    self.config.directory_retry
                );
                self.schedule_directory_retry();
            }
            DirectoryEvent::Failed(DirectoryFault::IdTaken(id)) => {
                self.id_attempts += 1;
                if self.id_attempts >= self.config.max_id_attempts {
                    self.directory_failed(format!(
                        "no free identifier after {} attempts",
                        self.id_attempts
                    ));
                    return;
                }
                debug!("Identifier '{}' taken, trying another", id);
                // Never ask for the colliding id again
                if self.local_id.as_deref() == Some(id.as_str()) {
                    self.local_id = None;
                }
                self.register(None);
            }
            DirectoryEvent::Failed(DirectoryFault::Fatal(msg)) => {
                self.directory_failed(msg);
            }
        }
    }

    fn schedule_directory_retry(&mut self) {
        self.registration = RegistrationState::Retrying;
        self.directory_retry = Some(ScheduledTask::after(
            self.config.directory_retry,
            self.mailbox.clone(),
            |token| NodeEvent::Scheduled {
                token,
                kind: ScheduledKind::DirectoryRetry,
            },
        ));
    }

    fn directory_failed(&mut self, msg: String) {
        warn!("Node '{}': directory registration failed: {}", self.label(), msg);
        self.registration = RegistrationState::Failed;
        self.directory_retry = None;
        self.id_attempts = 0;
        self.last_error = Some(format!("Directory error: {}", msg));
        if self.pending_join.take().is_some() {
            // The deferred join can never run
            self.disable_reconnect();
            if self.role == NodeRole::Child && self.parent.is_none() {
                self.set_role(NodeRole::Standalone);
            }
        }
    }

    // ---- Channels ----

    fn open_parent_link(&mut self, target: &str) {
        let id = ChannelId::next();
        info!("Node '{}': connecting to '{}' ({})", self.label(), target, id);
        let channel = self.directory.connect(target, id);
        self.channels.insert(
            id,
            ChannelSlot {
                channel,
                direction: Direction::Outbound,
                open: false,
                rejected: false,
            },
        );
        self.parent = Some(id);
    }

    fn on_inbound(&mut self, channel: Arc<dyn Channel>) {
        if self.stopped {
            channel.close();
            return;
        }
        debug!(
            "Node '{}': inbound connection from '{}' ({})",
            self.label(),
            channel.remote_id(),
            channel.id()
        );
        self.channels.insert(
            channel.id(),
            ChannelSlot {
                channel,
                direction: Direction::Inbound,
                open: false,
                rejected: false,
            },
        );
    }

    fn on_channel(&mut self, id: ChannelId, event: ChannelEvent) {
        let Some(slot) = self.channels.get_mut(&id) else {
            debug!("Node '{}': event for unknown channel {}", self.label(), id);
            return;
        };
        let direction = slot.direction;
        match event {
            ChannelEvent::Opened => {
                slot.open = true;
                match direction {
                    Direction::Inbound => self.on_inbound_opened(id),
                    Direction::Outbound => self.on_parent_opened(id),
                }
            }
            ChannelEvent::Data(data) => match direction {
                Direction::Outbound if self.parent == Some(id) => self.on_parent_data(data),
                _ => debug!(
                    "Node '{}': ignoring {} bytes from {} ({})",
                    self.local_id.as_deref().unwrap_or("-"),
                    data.len(),
                    slot.channel.remote_id(),
                    id
                ),
            },
            ChannelEvent::Closed => self.on_channel_gone(id, direction, "closed"),
            ChannelEvent::Errored(reason) => self.on_channel_gone(id, direction, &reason),
        }
    }

    fn on_channel_gone(&mut self, id: ChannelId, direction: Direction, reason: &str) {
        self.channels.remove(&id);
        self.pending_closes.remove(&id);
        match direction {
            Direction::Inbound => self.on_child_gone(id, reason),
            Direction::Outbound => self.on_parent_gone(id, reason),
        }
    }

    /// Close a channel and forget it. Later events for it are ignored.
    fn drop_channel(&mut self, id: ChannelId) {
        self.pending_closes.remove(&id);
        if let Some(slot) = self.channels.remove(&id) {
            slot.channel.close();
        }
    }

    fn send_to(&self, id: ChannelId, message: &PeerMessage) {
        let Some(slot) = self.channels.get(&id) else {
            return;
        };
        if !slot.open {
            return;
        }
        match message.encode() {
            Ok(body) => {
                if let Err(e) = slot.channel.send(body) {
                    warn!(
                        "Node '{}': {} to '{}' failed: {}",
                        self.label(),
                        message.type_name(),
                        slot.channel.remote_id(),
                        e
                    );
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", message.type_name(), e),
        }
    }

    // ---- Parent side ----

    fn on_inbound_opened(&mut self, id: ChannelId) {
        let Some(channel) = self.channels.get(&id).map(|slot| slot.channel.clone()) else {
            return;
        };
        let remote = channel.remote_id().to_string();

        if self.role == NodeRole::Child {
            let message = format!("Node {} is a child and cannot accept connections.", self.label());
            self.reject(id, message);
            return;
        }

        match self.membership.admit(&remote, id) {
            Admission::Rejected => {
                let message = format!("Parent node full (max {}).", self.membership.cap());
                self.reject(id, message);
                return;
            }
            Admission::Replaced(old) => {
                debug!(
                    "Node '{}': '{}' reconnected, dropping {}",
                    self.label(),
                    remote,
                    old
                );
                self.drop_channel(old);
            }
            Admission::Admitted => {}
        }

        info!(
            "Node '{}': admitted child '{}' ({}/{})",
            self.label(),
            remote,
            self.membership.len(),
            self.membership.cap()
        );
        self.set_role(NodeRole::Parent);
        self.replicator.send_snapshot(channel.as_ref());
    }

    fn reject(&mut self, id: ChannelId, message: String) {
        if let Some(slot) = self.channels.get_mut(&id) {
            warn!(
                "Node '{}': rejecting '{}': {}",
                self.local_id.as_deref().unwrap_or("-"),
                slot.channel.remote_id(),
                message
            );
            slot.rejected = true;
        }
        self.send_to(id, &PeerMessage::error(message));
        let task = ScheduledTask::after(self.config.reject_grace, self.mailbox.clone(), move |token| {
            NodeEvent::Scheduled {
                token,
                kind: ScheduledKind::CloseRejected(id),
            }
        });
        self.pending_closes.insert(id, task);
    }

    fn on_child_gone(&mut self, id: ChannelId, reason: &str) {
        let Some(remote) = self.membership.remove_channel(id) else {
            return;
        };
        info!(
            "Node '{}': child '{}' left ({}), {} remaining",
            self.label(),
            remote,
            reason,
            self.membership.len()
        );
        if self.membership.is_empty() && self.role == NodeRole::Parent {
            self.set_role(NodeRole::Standalone);
        }
    }

    fn broadcast_to_children(&self) -> usize {
        let targets: Vec<&dyn Channel> = self
            .membership
            .channels()
            .filter_map(|id| self.channels.get(&id))
            .filter(|slot| slot.open && !slot.rejected)
            .map(|slot| slot.channel.as_ref())
            .collect();
        self.replicator.broadcast(targets)
    }

    /// Send DISCONNECT_NOTICE to every child and close their channels
    fn dismiss_children(&mut self) {
        let notice = PeerMessage::disconnect_notice();
        for (remote, id) in self.membership.drain() {
            debug!("Node '{}': dismissing child '{}'", self.label(), remote);
            self.send_to(id, &notice);
            self.drop_channel(id);
        }
    }

    // ---- Child side ----

    fn on_parent_opened(&mut self, id: ChannelId) {
        if self.parent != Some(id) {
            debug!("Node '{}': closing stale link {}", self.label(), id);
            self.drop_channel(id);
            return;
        }
        let target = self.reconnect.target.clone().unwrap_or_default();
        if self.role == NodeRole::Parent {
            warn!(
                "Node '{}': link to '{}' opened while parent, abandoning join",
                self.label(),
                target
            );
            self.parent = None;
            self.drop_channel(id);
            self.disable_reconnect();
            return;
        }
        info!("Node '{}': joined '{}'", self.label(), target);
        self.reconnect.task = None;
        self.last_error = None;
        self.set_role(NodeRole::Child);
    }

    fn on_parent_data(&mut self, data: Bytes) {
        let message = match PeerMessage::decode_validated(&data, self.config.max_timers) {
            Ok(message) => message,
            Err(e) => {
                warn!("Node '{}': dropping message from parent: {}", self.label(), e);
                return;
            }
        };
        match message {
            PeerMessage::SyncState { timers } => {
                if self.role != NodeRole::Child {
                    debug!("Node '{}': ignoring SYNC_STATE while {}", self.label(), self.role);
                    return;
                }
                if let Err(e) = self.replicator.apply_snapshot(timers) {
                    warn!("Node '{}': rejected snapshot: {}", self.label(), e);
                }
            }
            PeerMessage::Error { message } => {
                warn!("Node '{}': parent reported error: {}", self.label(), message);
                self.last_error = Some(message);
                self.end_parent_link();
            }
            PeerMessage::DisconnectNotice {} => {
                info!("Node '{}': parent ended the session", self.label());
                self.end_parent_link();
            }
        }
    }

    /// Leave the parent for good: no reconnect, back to standalone
    fn end_parent_link(&mut self) {
        self.disable_reconnect();
        if let Some(id) = self.parent.take() {
            self.drop_channel(id);
        }
        if self.role == NodeRole::Child {
            self.set_role(NodeRole::Standalone);
        }
    }

    fn on_parent_gone(&mut self, id: ChannelId, reason: &str) {
        if self.parent != Some(id) {
            return;
        }
        self.parent = None;
        let target = self.reconnect.target.clone().unwrap_or_default();
        match self.role {
            NodeRole::Child if self.reconnect.enabled => {
                info!(
                    "Node '{}': link to '{}' lost ({}), reconnecting in {:?}",
                    self.label(),
                    target,
                    reason,
                    self.config.reconnect_interval
                );
                self.schedule_reconnect();
            }
            NodeRole::Child => {
                info!("Node '{}': link to '{}' closed", self.label(), target);
                self.set_role(NodeRole::Standalone);
            }
            _ => {
                if self.reconnect.enabled {
                    warn!(
                        "Node '{}': could not connect to '{}': {}",
                        self.label(),
                        target,
                        reason
                    );
                    self.last_error = Some(format!("Could not connect to {}: {}", target, reason));
                }
                self.disable_reconnect();
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.reconnect.task = Some(ScheduledTask::after(
            self.config.reconnect_interval,
            self.mailbox.clone(),
            |token| NodeEvent::Scheduled {
                token,
                kind: ScheduledKind::Reconnect,
            },
        ));
    }

    fn on_reconnect(&mut self) {
        if self.role != NodeRole::Child || !self.reconnect.enabled || self.parent.is_some() {
            return;
        }
        let Some(target) = self.reconnect.target.clone() else {
            return;
        };
        if self.registration.is_live() {
            self.open_parent_link(&target);
        } else {
            debug!("Node '{}': reconnect waits for directory", self.label());
            self.defer_join(target);
        }
    }

    /// Hold a join until the directory registration is live again
    fn defer_join(&mut self, target: String) {
        self.pending_join = Some(target);
        if self.registration != RegistrationState::Pending {
            let previous = self.previous_id();
            self.register(previous);
        }
    }

    fn disable_reconnect(&mut self) {
        self.reconnect.enabled = false;
        self.reconnect.task = None;
        self.pending_join = None;
    }

    // ---- Scheduled tasks ----

    fn on_scheduled(&mut self, token: TaskToken, kind: ScheduledKind) {
        if self.stopped {
            return;
        }
        match kind {
            ScheduledKind::Tick => {
                let now = now_millis();
                let outcome = self.engine.on_tick(token, self.replicator.timers_mut(), now);
                if outcome == TickOutcome::Changed && self.role == NodeRole::Parent {
                    self.broadcast_to_children();
                }
            }
            ScheduledKind::Reconnect => {
                if self.reconnect.task.as_ref().is_some_and(|t| t.owns(token)) {
                    self.reconnect.task = None;
                    self.on_reconnect();
                }
            }
            ScheduledKind::DirectoryRetry => {
                if self.directory_retry.as_ref().is_some_and(|t| t.owns(token)) {
                    self.directory_retry = None;
                    let previous = self.previous_id();
                    self.register(previous);
                }
            }
            ScheduledKind::CloseRejected(id) => {
                if self.pending_closes.get(&id).is_some_and(|t| t.owns(token)) {
                    self.pending_closes.remove(&id);
                    if let Some(slot) = self.channels.get(&id) {
                        debug!("Node '{}': closing rejected {}", self.label(), id);
                        slot.channel.close();
                    }
                }
            }
        }
    }

    // ---- Roles ----

    fn set_role(&mut self, role: NodeRole) {
        if self.role == role {
            return;
        }
        info!("Node '{}': role {} -> {}", self.label(), self.role, role);
        self.role = role;
        if role.owns_state() {
            self.ensure_engine();
        } else {
            self.engine.stop();
        }
    }

    fn ensure_engine(&mut self) {
        if self.stopped || !self.role.owns_state() {
            return;
        }
        self.engine.start(self.mailbox.clone(), |token| NodeEvent::Scheduled {
            token,
            kind: ScheduledKind::Tick,
        });
    }

    // ---- Commands ----

    fn on_command(&mut self, command: Command) {
        debug!("Node '{}': command {}", self.label(), command.name());
        match command {
            Command::AddTimer {
                name,
                seconds,
                reply,
            } => {
                let _ = reply.send(self.add_timer(name, seconds));
            }
            Command::DeleteTimer { id, reply } => {
                let _ = reply.send(self.delete_timer(&id));
            }
            Command::UpdateTimer { id, patch, reply } => {
                let _ = reply.send(self.update_timer(&id, patch));
            }
            Command::ToggleTimer { id, reply } => {
                let _ = reply.send(self.toggle_timer(&id));
            }
            Command::ResetTimer { id, reply } => {
                let _ = reply.send(self.reset_timer(&id));
            }
            Command::StartAll { reply } => {
                let _ = reply.send(self.start_all());
            }
            Command::PauseAll { reply } => {
                let _ = reply.send(self.pause_all());
            }
            Command::Join { target, reply } => {
                let _ = reply.send(self.join_cluster(target));
            }
            Command::Leave { reply } => {
                let _ = reply.send(self.leave_cluster());
            }
        }
    }

    /// Run a mutation on the canonical collection and replicate the result
    fn mutate<T, F>(&mut self, f: F) -> Result<T, CommandError>
    where
        F: FnOnce(&mut TimerCollection, u64) -> Result<T, TimerError>,
    {
        if !self.role.owns_state() {
            return Err(CommandError::ReadOnly);
        }
        let out = f(self.replicator.timers_mut(), now_millis())?;
        if self.role == NodeRole::Parent {
            self.broadcast_to_children();
        }
        Ok(out)
    }

    /// Append a timer, named "<prefix> <n>" and set to the default duration
    /// unless given. Returns the new timer's id.
    pub fn add_timer(
        &mut self,
        name: Option<String>,
        seconds: Option<u64>,
    ) -> Result<String, CommandError> {
        let prefix = self.config.name_prefix.clone();
        let seconds = seconds.unwrap_or(self.config.default_seconds);
        self.mutate(|timers, now| {
            let name = name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("{} {}", prefix, timers.len() + 1));
            let mut timer = Timer::new(generate_timer_id(), name, seconds);
            timer.last_updated = now;
            let id = timer.id.clone();
            timers.add(timer)?;
            Ok(id)
        })
    }

    pub fn delete_timer(&mut self, id: &str) -> Result<(), CommandError> {
        self.mutate(|timers, _| timers.remove(id).map(|_| ()))
    }

    pub fn update_timer(&mut self, id: &str, patch: TimerPatch) -> Result<(), CommandError> {
        self.mutate(|timers, now| timers.update(id, &patch, now))
    }

    pub fn toggle_timer(&mut self, id: &str) -> Result<(), CommandError> {
        self.mutate(|timers, now| {
            let running = timers
                .get(id)
                .map(|t| t.is_running)
                .ok_or_else(|| TimerError::NotFound(id.to_string()))?;
            timers.update(id, &TimerPatch::running(!running), now)
        })
    }

    /// Restore the full duration and stop the timer
    pub fn reset_timer(&mut self, id: &str) -> Result<(), CommandError> {
        self.mutate(|timers, now| {
            let initial = timers
                .get(id)
                .map(|t| t.initial_seconds)
                .ok_or_else(|| TimerError::NotFound(id.to_string()))?;
            let patch = TimerPatch {
                remaining_seconds: Some(initial),
                is_running: Some(false),
                ..Default::default()
            };
            timers.update(id, &patch, now)
        })
    }

    pub fn start_all(&mut self) -> Result<(), CommandError> {
        self.mutate(|timers, now| {
            timers.start_all(now);
            Ok(())
        })
    }

    pub fn pause_all(&mut self) -> Result<(), CommandError> {
        self.mutate(|timers, now| {
            timers.pause_all(now);
            Ok(())
        })
    }

    /// Become a child of `target`. The link is opened once the directory
    /// registration is live.
    pub fn join_cluster(&mut self, target: String) -> Result<(), CommandError> {
        match self.role {
            NodeRole::Child => return Err(CommandError::InvalidRole("child")),
            NodeRole::Parent => return Err(CommandError::InvalidRole("parent")),
            NodeRole::Standalone => {}
        }
        if self.parent.is_some() || self.pending_join.is_some() {
            return Err(CommandError::AlreadyConnecting);
        }
        let target = target.trim().to_string();
        if target.is_empty() || self.local_id.as_deref() == Some(target.as_str()) {
            return Err(CommandError::InvalidTarget(target));
        }

        self.last_error = None;
        self.reconnect.enabled = true;
        self.reconnect.target = Some(target.clone());
        self.reconnect.task = None;

        if self.registration.is_live() {
            self.open_parent_link(&target);
        } else {
            debug!("Node '{}': join of '{}' waits for directory", self.label(), target);
            self.defer_join(target);
        }
        Ok(())
    }

    /// Leave the cluster. A child disconnects without reconnecting; a parent
    /// dismisses all children.
    pub fn leave_cluster(&mut self) -> Result<(), CommandError> {
        self.disable_reconnect();
        if let Some(id) = self.parent.take() {
            self.drop_channel(id);
        }
        if self.role == NodeRole::Parent {
            self.dismiss_children();
        }
        self.set_role(NodeRole::Standalone);
        info!("Node '{}': left cluster", self.label());
        Ok(())
    }

    // ---- Shutdown ----

    /// Cancel scheduled tasks, close every channel, release the directory
    /// registration. Each step runs regardless of the others.
    pub async fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        info!("Node '{}': shutting down", self.label());
        self.stopped = true;

        self.engine.stop();
        self.disable_reconnect();
        self.directory_retry = None;
        self.pending_closes.clear();

        self.dismiss_children();
        self.parent = None;
        for (_, slot) in self.channels.drain() {
            slot.channel.close();
        }

        self.directory.release().await;
        self.registration = RegistrationState::Idle;
        self.role = NodeRole::Standalone;
    }
}
