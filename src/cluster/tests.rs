//! Coordinator tests
//!
//! Each test drives a coordinator by hand: events are fed through
//! `Coordinator::handle`, and scheduled tasks are pumped from the mailbox on
//! a paused clock so ticks and backoff are deterministic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use super::*;
use crate::protocol::PeerMessage;
use crate::remote::{
    Channel, ChannelEvent, ChannelId, Directory, DirectoryEvent, DirectoryFault,
    RegistrationState, RemoteError,
};
use crate::timer::{Timer, TimerPatch};

// ---- Test doubles ----

struct MockChannel {
    id: ChannelId,
    remote_id: String,
    sent: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
}

impl MockChannel {
    fn new(remote_id: &str) -> Arc<Self> {
        Self::with_id(ChannelId::next(), remote_id)
    }

    fn with_id(id: ChannelId, remote_id: &str) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_id: remote_id.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn messages(&self) -> Vec<PeerMessage> {
        self.sent
            .lock()
            .iter()
            .map(|body| PeerMessage::decode(body).unwrap())
            .collect()
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    fn last_message(&self) -> Option<PeerMessage> {
        self.messages().pop()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Channel for MockChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn send(&self, body: Bytes) -> Result<(), RemoteError> {
        if self.is_closed() {
            return Err(RemoteError::ChannelClosed);
        }
        self.sent.lock().push(body);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockDirectory {
    registrations: Mutex<Vec<Option<String>>>,
    connects: Mutex<Vec<Arc<MockChannel>>>,
    released: AtomicBool,
}

impl MockDirectory {
    fn registrations(&self) -> Vec<Option<String>> {
        self.registrations.lock().clone()
    }

    fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    fn last_connect(&self) -> Arc<MockChannel> {
        self.connects.lock().last().cloned().unwrap()
    }
}

#[async_trait]
impl Directory for MockDirectory {
    fn register(&self, preferred_id: Option<String>) {
        self.registrations.lock().push(preferred_id);
    }

    fn connect(&self, target_id: &str, channel_id: ChannelId) -> Arc<dyn Channel> {
        let channel = MockChannel::with_id(channel_id, target_id);
        self.connects.lock().push(channel.clone());
        channel
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

// ---- Harness ----

struct Harness {
    node: Coordinator,
    rx: mpsc::Receiver<NodeEvent>,
    directory: Arc<MockDirectory>,
}

impl Harness {
    fn new(config: CoordinatorConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let directory = Arc::new(MockDirectory::default());
        let mut node = Coordinator::new(config, directory.clone(), tx);
        node.start();
        Self {
            node,
            rx,
            directory,
        }
    }

    async fn registered(config: CoordinatorConfig, id: &str) -> Self {
        let mut h = Self::new(config);
        h.directory_event(DirectoryEvent::Registered(id.to_string()))
            .await;
        h
    }

    async fn directory_event(&mut self, event: DirectoryEvent) {
        self.node.handle(NodeEvent::Directory(event)).await;
    }

    async fn channel_event(&mut self, id: ChannelId, event: ChannelEvent) {
        self.node.handle(NodeEvent::Channel { id, event }).await;
    }

    /// Dial this node from `remote` and open the channel
    async fn inbound(&mut self, remote: &str) -> Arc<MockChannel> {
        let channel = MockChannel::new(remote);
        self.node
            .handle(NodeEvent::Inbound {
                channel: channel.clone(),
            })
            .await;
        self.channel_event(channel.id, ChannelEvent::Opened).await;
        channel
    }

    /// Join `target` and open the resulting link
    async fn join_and_open(&mut self, target: &str) -> Arc<MockChannel> {
        self.node.join_cluster(target.to_string()).unwrap();
        let link = self.directory.last_connect();
        self.channel_event(link.id, ChannelEvent::Opened).await;
        link
    }

    async fn deliver(&mut self, link: &MockChannel, message: &PeerMessage) {
        let body = message.encode().unwrap();
        self.channel_event(link.id, ChannelEvent::Data(body)).await;
    }

    /// Handle mailbox events until a scheduled event of the wanted kind was
    /// processed
    async fn pump_until(&mut self, want: impl Fn(&ScheduledKind) -> bool) {
        loop {
            let event = self.rx.recv().await.unwrap();
            let hit = matches!(&event, NodeEvent::Scheduled { kind, .. } if want(kind));
            self.node.handle(event).await;
            if hit {
                return;
            }
        }
    }

    async fn tick(&mut self) {
        self.pump_until(|k| *k == ScheduledKind::Tick).await;
    }
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig::default()
}

fn config_with_cap(max_children: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        max_children,
        ..CoordinatorConfig::default()
    }
}

fn sync_timers(message: &PeerMessage) -> Vec<Timer> {
    match message {
        PeerMessage::SyncState { timers } => timers.clone(),
        other => panic!("expected SYNC_STATE, got {}", other.type_name()),
    }
}

// ---- Startup and directory ----

#[tokio::test(start_paused = true)]
async fn test_starts_standalone_and_registers() {
    let h = Harness::new(config());
    assert_eq!(h.node.role(), NodeRole::Standalone);
    assert_eq!(h.node.registration(), RegistrationState::Pending);
    assert!(h.node.is_ticking());

    let registrations = h.directory.registrations();
    assert_eq!(registrations.len(), 1);
    let id = registrations[0].clone().unwrap();
    assert_eq!(id.len(), 4);
    assert!(id.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test(start_paused = true)]
async fn test_preferred_id_is_requested() {
    let h = Harness::new(CoordinatorConfig {
        preferred_id: Some("4242".to_string()),
        ..config()
    });
    assert_eq!(h.directory.registrations(), vec![Some("4242".to_string())]);
}

#[tokio::test(start_paused = true)]
async fn test_registered_is_live() {
    let h = Harness::registered(config(), "1234").await;
    assert_eq!(h.node.local_id(), Some("1234"));
    assert!(h.node.registration().is_live());
    assert!(h.node.view().is_server_connected());
}

#[tokio::test(start_paused = true)]
async fn test_transient_fault_retries_with_previous_id() {
    let mut h = Harness::registered(config(), "1234").await;
    h.directory_event(DirectoryEvent::Lost).await;
    assert_eq!(h.node.registration(), RegistrationState::Retrying);

    let started = tokio::time::Instant::now();
    h.pump_until(|k| *k == ScheduledKind::DirectoryRetry).await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(h.node.registration(), RegistrationState::Pending);
    assert_eq!(
        h.directory.registrations().last().cloned().flatten().as_deref(),
        Some("1234")
    );

    h.directory_event(DirectoryEvent::Failed(DirectoryFault::Transient(
        "connection refused".to_string(),
    )))
    .await;
    assert_eq!(h.node.registration(), RegistrationState::Retrying);
    h.pump_until(|k| *k == ScheduledKind::DirectoryRetry).await;
    assert_eq!(h.directory.registrations().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_id_collision_retries_immediately_until_limit() {
    let mut h = Harness::new(CoordinatorConfig {
        max_id_attempts: 3,
        ..config()
    });
    let first = h.directory.registrations()[0].clone().unwrap();

    h.directory_event(DirectoryEvent::Failed(DirectoryFault::IdTaken(first)))
        .await;
    assert_eq!(h.directory.registrations().len(), 2);
    assert_eq!(h.node.registration(), RegistrationState::Pending);

    h.directory_event(DirectoryEvent::Failed(DirectoryFault::IdTaken(
        "x".to_string(),
    )))
    .await;
    assert_eq!(h.directory.registrations().len(), 3);

    h.directory_event(DirectoryEvent::Failed(DirectoryFault::IdTaken(
        "y".to_string(),
    )))
    .await;
    assert_eq!(h.directory.registrations().len(), 3);
    assert_eq!(h.node.registration(), RegistrationState::Failed);
    assert!(h.node.last_error().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_fatal_fault_is_not_retried() {
    let mut h = Harness::new(config());
    h.directory_event(DirectoryEvent::Failed(DirectoryFault::Fatal(
        "invalid id".to_string(),
    )))
    .await;
    assert_eq!(h.node.registration(), RegistrationState::Failed);
    assert_eq!(h.node.view().status, ConnectionStatus::Disconnected);

    // Ten seconds of ticks, no re-registration
    for _ in 0..10 {
        h.tick().await;
    }
    assert_eq!(h.directory.registrations().len(), 1);
}

// ---- Admission ----

#[tokio::test(start_paused = true)]
async fn test_join_and_sync_between_two_nodes() {
    let mut a = Harness::registered(config(), "1000").await;
    let t1 = a.node.add_timer(Some("Segment".to_string()), Some(120)).unwrap();

    let inbound = a.inbound("2000").await;
    assert_eq!(a.node.role(), NodeRole::Parent);
    assert_eq!(a.node.child_count(), 1);

    let messages = inbound.messages();
    assert_eq!(messages.len(), 1);
    let snapshot = sync_timers(&messages[0]);
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, t1);
    assert_eq!(snapshot[0].remaining_seconds, 120);
    assert!(!snapshot[0].is_running);

    let mut b = Harness::registered(config(), "2000").await;
    let link = b.join_and_open("1000").await;
    assert_eq!(link.remote_id, "1000");
    assert_eq!(b.node.role(), NodeRole::Child);
    assert!(!b.node.is_ticking());

    b.deliver(&link, &messages[0]).await;
    assert_eq!(b.node.timers().as_slice(), a.node.timers().as_slice());
    assert_eq!(b.node.view().status, ConnectionStatus::Connected);
    assert_eq!(b.node.view().target_id.as_deref(), Some("1000"));
}

#[tokio::test(start_paused = true)]
async fn test_capacity_rejection() {
    let mut h = Harness::registered(config_with_cap(1), "1000").await;
    let first = h.inbound("2000").await;
    let second = h.inbound("3000").await;

    assert_eq!(h.node.child_count(), 1);
    assert_eq!(
        second.messages(),
        vec![PeerMessage::error("Parent node full (max 1).")]
    );
    assert!(!second.is_closed());

    h.pump_until(|k| matches!(k, ScheduledKind::CloseRejected(_)))
        .await;
    assert!(second.is_closed());
    assert!(!first.is_closed());

    h.channel_event(second.id, ChannelEvent::Closed).await;
    assert_eq!(h.node.child_count(), 1);
    assert_eq!(h.node.role(), NodeRole::Parent);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_channel_gets_no_snapshots() {
    let mut h = Harness::registered(config_with_cap(1), "1000").await;
    h.inbound("2000").await;
    let rejected = h.inbound("3000").await;
    h.node.add_timer(None, None).unwrap();
    assert_eq!(rejected.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_readmission_replaces_channel() {
    let mut h = Harness::registered(config_with_cap(1), "1000").await;
    let old = h.inbound("2000").await;
    let new = h.inbound("2000").await;

    assert_eq!(h.node.child_count(), 1);
    assert!(old.is_closed());
    assert_eq!(new.sent_count(), 1);

    // The stale channel closing does not remove the member
    h.channel_event(old.id, ChannelEvent::Closed).await;
    assert_eq!(h.node.child_count(), 1);
    assert_eq!(h.node.role(), NodeRole::Parent);
}

#[tokio::test(start_paused = true)]
async fn test_role_returns_to_standalone_when_last_child_leaves() {
    let mut h = Harness::registered(config(), "1000").await;
    let a = h.inbound("2000").await;
    let b = h.inbound("3000").await;
    assert_eq!(h.node.child_count(), 2);

    h.channel_event(a.id, ChannelEvent::Errored("reset".to_string()))
        .await;
    assert_eq!(h.node.role(), NodeRole::Parent);

    h.channel_event(b.id, ChannelEvent::Closed).await;
    assert_eq!(h.node.role(), NodeRole::Standalone);
    assert_eq!(h.node.child_count(), 0);
    assert!(h.node.is_ticking());
}

#[tokio::test(start_paused = true)]
async fn test_child_rejects_inbound() {
    let mut h = Harness::registered(config(), "2000").await;
    h.join_and_open("1000").await;
    let inbound = h.inbound("3000").await;

    assert_eq!(h.node.role(), NodeRole::Child);
    assert!(matches!(
        inbound.messages().as_slice(),
        [PeerMessage::Error { .. }]
    ));
    h.pump_until(|k| matches!(k, ScheduledKind::CloseRejected(_)))
        .await;
    assert!(inbound.is_closed());
}

// ---- Replication and ticking ----

#[tokio::test(start_paused = true)]
async fn test_tick_and_broadcast() {
    let mut h = Harness::registered(config(), "1000").await;
    let child = h.inbound("2000").await;
    let id = h.node.add_timer(None, Some(120)).unwrap();
    h.node.start_all().unwrap();
    let before = child.sent_count();

    h.tick().await;
    assert_eq!(h.node.timers().get(&id).unwrap().remaining_seconds, 119);
    let last = sync_timers(&child.last_message().unwrap());
    assert_eq!(last[0].remaining_seconds, 119);
    assert!(last[0].is_running);

    for _ in 0..130 {
        h.tick().await;
    }
    let timer = h.node.timers().get(&id).unwrap().clone();
    assert_eq!(timer.remaining_seconds, 0);
    assert!(!timer.is_running);

    // 120 decrementing ticks plus the one that stopped the timer
    assert_eq!(child.sent_count() - before, 121);
    let last = sync_timers(&child.last_message().unwrap());
    assert_eq!(last, vec![timer]);
}

#[tokio::test(start_paused = true)]
async fn test_every_mutation_is_broadcast() {
    let mut h = Harness::registered(config(), "1000").await;
    let child = h.inbound("2000").await;

    let id = h.node.add_timer(Some("A".to_string()), Some(60)).unwrap();
    h.node
        .update_timer(&id, TimerPatch::rename("Renamed"))
        .unwrap();
    h.node.toggle_timer(&id).unwrap();
    h.node.reset_timer(&id).unwrap();
    h.node.delete_timer(&id).unwrap();

    let messages = child.messages();
    assert_eq!(messages.len(), 6);
    assert_eq!(sync_timers(&messages[2])[0].name, "Renamed");
    assert!(sync_timers(&messages[3])[0].is_running);
    assert!(!sync_timers(&messages[4])[0].is_running);
    assert!(sync_timers(&messages[5]).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_standalone_mutations_are_local() {
    let mut h = Harness::registered(config(), "1000").await;
    let first = h.node.add_timer(None, None).unwrap();
    let second = h.node.add_timer(None, None).unwrap();

    let timers = h.node.timers();
    assert_eq!(timers.get(&first).unwrap().name, "Exam Segment 1");
    assert_eq!(timers.get(&second).unwrap().name, "Exam Segment 2");
    assert_eq!(timers.get(&first).unwrap().initial_seconds, 3600);

    h.node
        .update_timer(
            &first,
            TimerPatch {
                remaining_seconds: Some(9999),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(h.node.timers().get(&first).unwrap().remaining_seconds, 3600);

    assert_eq!(
        h.node.delete_timer("missing"),
        Err(CommandError::NotFound("missing".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_timer_cap() {
    let mut h = Harness::registered(
        CoordinatorConfig {
            max_timers: 2,
            ..config()
        },
        "1000",
    )
    .await;
    h.node.add_timer(None, None).unwrap();
    h.node.add_timer(None, None).unwrap();
    assert_eq!(
        h.node.add_timer(None, None),
        Err(CommandError::CapacityReached(2))
    );
}

#[tokio::test(start_paused = true)]
async fn test_child_is_read_only() {
    let mut h = Harness::registered(config(), "2000").await;
    h.join_and_open("1000").await;

    assert_eq!(h.node.add_timer(None, None), Err(CommandError::ReadOnly));
    assert_eq!(h.node.start_all(), Err(CommandError::ReadOnly));
    assert_eq!(h.node.pause_all(), Err(CommandError::ReadOnly));
    assert_eq!(h.node.delete_timer("x"), Err(CommandError::ReadOnly));
    assert!(h.node.view().is_read_only());
    assert!(h.node.leave_cluster().is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_replaces_child_state() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;

    let mut running = Timer::new("t1", "One", 120);
    running.is_running = true;
    running.remaining_seconds = 100;
    let snapshot = vec![running, Timer::new("t2", "Two", 30)];

    h.deliver(&link, &PeerMessage::SyncState {
        timers: snapshot.clone(),
    })
    .await;
    assert_eq!(h.node.timers().to_vec(), snapshot);

    h.deliver(&link, &PeerMessage::SyncState { timers: vec![] })
        .await;
    assert!(h.node.timers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_malformed_messages_are_dropped() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;
    let good = vec![Timer::new("t1", "One", 120)];
    h.deliver(&link, &PeerMessage::SyncState {
        timers: good.clone(),
    })
    .await;

    h.channel_event(link.id, ChannelEvent::Data(Bytes::from_static(b"not json")))
        .await;
    h.channel_event(
        link.id,
        ChannelEvent::Data(Bytes::from_static(br#"{"type":"UNKNOWN","payload":{}}"#)),
    )
    .await;

    let mut broken = Timer::new("t9", "Broken", 10);
    broken.remaining_seconds = 50;
    h.deliver(&link, &PeerMessage::SyncState {
        timers: vec![broken],
    })
    .await;

    assert_eq!(h.node.timers().to_vec(), good);
    assert_eq!(h.node.role(), NodeRole::Child);
}

#[tokio::test(start_paused = true)]
async fn test_tick_loop_follows_ownership() {
    let mut h = Harness::registered(config(), "2000").await;
    assert!(h.node.is_ticking());

    let link = h.join_and_open("1000").await;
    assert!(!h.node.is_ticking());

    h.channel_event(link.id, ChannelEvent::Closed).await;
    assert_eq!(h.node.role(), NodeRole::Child);
    assert!(!h.node.is_ticking());

    h.node.leave_cluster().unwrap();
    assert_eq!(h.node.role(), NodeRole::Standalone);
    assert!(h.node.is_ticking());
}

#[tokio::test(start_paused = true)]
async fn test_stale_ticks_do_not_touch_child_state() {
    let mut h = Harness::registered(config(), "2000").await;
    let id = h.node.add_timer(None, Some(10)).unwrap();
    h.node.start_all().unwrap();

    // Let a tick get queued, then become a child before it is handled
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let link = h.join_and_open("1000").await;
    let mut snapshot = h.node.timers().to_vec();
    snapshot[0].remaining_seconds = 10;
    h.deliver(&link, &PeerMessage::SyncState {
        timers: snapshot.clone(),
    })
    .await;

    while let Ok(event) = h.rx.try_recv() {
        h.node.handle(event).await;
    }
    assert_eq!(h.node.timers().get(&id).unwrap().remaining_seconds, 10);
}

// ---- Reconnection ----

#[tokio::test(start_paused = true)]
async fn test_child_reconnects_to_same_target() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;

    h.channel_event(link.id, ChannelEvent::Errored("reset by peer".to_string()))
        .await;
    assert_eq!(h.node.role(), NodeRole::Child);
    assert!(h.node.reconnect_scheduled());
    assert_eq!(h.node.view().status, ConnectionStatus::Reconnecting);

    let started = tokio::time::Instant::now();
    h.pump_until(|k| *k == ScheduledKind::Reconnect).await;
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert_eq!(h.directory.connect_count(), 2);
    let retry = h.directory.last_connect();
    assert_eq!(retry.remote_id, "1000");

    // A failed attempt schedules another one at the same interval
    h.channel_event(retry.id, ChannelEvent::Errored("refused".to_string()))
        .await;
    h.pump_until(|k| *k == ScheduledKind::Reconnect).await;
    assert_eq!(h.directory.connect_count(), 3);

    let link = h.directory.last_connect();
    h.channel_event(link.id, ChannelEvent::Opened).await;
    assert_eq!(h.node.view().status, ConnectionStatus::Connected);
    assert!(!h.node.reconnect_scheduled());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_for_directory() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;

    h.directory_event(DirectoryEvent::Lost).await;
    h.channel_event(link.id, ChannelEvent::Closed).await;
    h.pump_until(|k| *k == ScheduledKind::Reconnect).await;

    // Registration was re-requested instead of dialing
    assert_eq!(h.directory.connect_count(), 1);
    assert_eq!(h.directory.registrations().len(), 2);

    h.directory_event(DirectoryEvent::Registered("2000".to_string()))
        .await;
    assert_eq!(h.directory.connect_count(), 2);
    assert_eq!(h.directory.last_connect().remote_id, "1000");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_notice_suppresses_reconnect() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;

    h.deliver(&link, &PeerMessage::disconnect_notice()).await;
    assert_eq!(h.node.role(), NodeRole::Standalone);
    assert!(!h.node.reconnect_enabled());
    assert!(link.is_closed());
    assert!(h.node.last_error().is_none());

    h.channel_event(link.id, ChannelEvent::Closed).await;
    for _ in 0..10 {
        h.tick().await;
    }
    assert_eq!(h.directory.connect_count(), 1);
    assert_eq!(h.node.view().status, ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_user_leave_suppresses_reconnect() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;

    h.node.leave_cluster().unwrap();
    assert!(link.is_closed());
    assert_eq!(h.node.role(), NodeRole::Standalone);

    h.channel_event(link.id, ChannelEvent::Errored("reset".to_string()))
        .await;
    for _ in 0..10 {
        h.tick().await;
    }
    assert_eq!(h.directory.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_leave_while_reconnecting_cancels_retry() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;
    h.channel_event(link.id, ChannelEvent::Closed).await;
    assert!(h.node.reconnect_scheduled());

    h.node.leave_cluster().unwrap();
    assert!(!h.node.reconnect_scheduled());
    for _ in 0..10 {
        h.tick().await;
    }
    assert_eq!(h.directory.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_error_from_parent_tears_down() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;

    h.deliver(&link, &PeerMessage::error("Parent node full (max 4)."))
        .await;
    assert_eq!(h.node.role(), NodeRole::Standalone);
    assert_eq!(h.node.last_error(), Some("Parent node full (max 4)."));
    assert!(!h.node.reconnect_enabled());
    assert!(link.is_closed());
    assert!(h.node.is_ticking());
}

// ---- Join edge cases ----

#[tokio::test(start_paused = true)]
async fn test_join_is_deferred_until_registered() {
    let mut h = Harness::new(config());
    h.node.join_cluster("1000".to_string()).unwrap();
    assert_eq!(h.directory.connect_count(), 0);
    assert_eq!(h.node.view().status, ConnectionStatus::Connecting);

    h.directory_event(DirectoryEvent::Registered("2000".to_string()))
        .await;
    assert_eq!(h.directory.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_join_validation() {
    let mut h = Harness::registered(config(), "2000").await;
    assert_eq!(
        h.node.join_cluster("  ".to_string()),
        Err(CommandError::InvalidTarget(String::new()))
    );
    assert_eq!(
        h.node.join_cluster("2000".to_string()),
        Err(CommandError::InvalidTarget("2000".to_string()))
    );

    h.node.join_cluster("1000".to_string()).unwrap();
    assert_eq!(
        h.node.join_cluster("1000".to_string()),
        Err(CommandError::AlreadyConnecting)
    );

    let mut parent = Harness::registered(config(), "1000").await;
    parent.inbound("3000").await;
    assert_eq!(
        parent.node.join_cluster("4000".to_string()),
        Err(CommandError::InvalidRole("parent"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_first_join_does_not_retry() {
    let mut h = Harness::registered(config(), "2000").await;
    h.node.join_cluster("1000".to_string()).unwrap();
    let link = h.directory.last_connect();

    h.channel_event(link.id, ChannelEvent::Errored("peer unavailable".to_string()))
        .await;
    assert_eq!(h.node.role(), NodeRole::Standalone);
    assert_eq!(h.node.view().status, ConnectionStatus::Disconnected);
    assert!(h.node.last_error().unwrap().contains("peer unavailable"));
    assert!(!h.node.reconnect_scheduled());
}

#[tokio::test(start_paused = true)]
async fn test_link_opened_while_parent_is_abandoned() {
    let mut h = Harness::registered(config(), "2000").await;
    h.node.join_cluster("1000".to_string()).unwrap();
    let link = h.directory.last_connect();

    h.inbound("3000").await;
    assert_eq!(h.node.role(), NodeRole::Parent);

    h.channel_event(link.id, ChannelEvent::Opened).await;
    assert_eq!(h.node.role(), NodeRole::Parent);
    assert!(link.is_closed());
    assert!(!h.node.reconnect_enabled());
}

// ---- Leave and shutdown ----

#[tokio::test(start_paused = true)]
async fn test_parent_leave_notifies_children() {
    let mut h = Harness::registered(config(), "1000").await;
    let a = h.inbound("2000").await;
    let b = h.inbound("3000").await;

    h.node.leave_cluster().unwrap();
    assert_eq!(h.node.role(), NodeRole::Standalone);
    assert_eq!(h.node.child_count(), 0);
    for child in [&a, &b] {
        assert_eq!(child.last_message(), Some(PeerMessage::disconnect_notice()));
        assert!(child.is_closed());
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_tears_everything_down() {
    let mut h = Harness::registered(config(), "1000").await;
    let child = h.inbound("2000").await;
    let (done, done_rx) = tokio::sync::oneshot::channel();

    h.node.handle(NodeEvent::Shutdown { done }).await;
    done_rx.await.unwrap();

    assert!(!h.node.is_ticking());
    assert!(child.is_closed());
    assert_eq!(child.last_message(), Some(PeerMessage::disconnect_notice()));
    assert!(h.directory.released.load(Ordering::SeqCst));
    assert_eq!(h.node.registration(), RegistrationState::Idle);

    // Nothing scheduled survives
    let pending = tokio::time::timeout(Duration::from_secs(10), h.rx.recv()).await;
    assert!(pending.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_of_reconnecting_child() {
    let mut h = Harness::registered(config(), "2000").await;
    let link = h.join_and_open("1000").await;
    h.channel_event(link.id, ChannelEvent::Closed).await;
    assert!(h.node.reconnect_scheduled());

    h.node.shutdown().await;
    assert!(!h.node.reconnect_scheduled());
    let pending = tokio::time::timeout(Duration::from_secs(10), h.rx.recv()).await;
    assert!(pending.is_err());
    assert_eq!(h.directory.connect_count(), 1);
}

// ---- View and handle ----

#[tokio::test(start_paused = true)]
async fn test_view_is_published() {
    let mut h = Harness::registered(config_with_cap(3), "1000").await;
    let mut view = h.node.subscribe_view();
    h.inbound("2000").await;

    assert!(view.has_changed().unwrap());
    let current = view.borrow_and_update().clone();
    assert_eq!(current.role, NodeRole::Parent);
    assert_eq!(current.status, ConnectionStatus::Connected);
    assert_eq!(current.child_count, 1);
    assert_eq!(current.child_cap, 3);
    assert_eq!(current.local_id.as_deref(), Some("1000"));
}

#[tokio::test(start_paused = true)]
async fn test_node_handle_round_trip() {
    let (tx, rx) = mpsc::channel(64);
    let directory = Arc::new(MockDirectory::default());
    let coordinator = Coordinator::new(config(), directory.clone(), tx.clone());
    let (handle, task) = NodeHandle::spawn(coordinator, tx.clone(), rx);

    tx.send(NodeEvent::Directory(DirectoryEvent::Registered(
        "1000".to_string(),
    )))
    .await
    .unwrap();

    let id = handle.add_timer(Some("Talk".to_string()), Some(30)).await.unwrap();
    handle.toggle_timer(&id).await.unwrap();

    let mut watch = handle.watch();
    watch
        .wait_for(|view| view.timers.first().is_some_and(|t| t.remaining_seconds < 30))
        .await
        .unwrap();
    let view = handle.view();
    assert_eq!(view.local_id.as_deref(), Some("1000"));
    assert_eq!(view.timers[0].name, "Talk");

    assert_eq!(
        handle.delete_timer("nope").await,
        Err(CommandError::NotFound("nope".to_string()))
    );

    handle.shutdown().await;
    task.await.unwrap();
    assert!(directory.released.load(Ordering::SeqCst));
    assert_eq!(handle.start_all().await, Err(CommandError::Stopped));
}
