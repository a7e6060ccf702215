//! Node Handle
//!
//! Cloneable front end to a running coordinator. Reads go through the
//! published [`NodeView`]; commands are sent through the mailbox and awaited.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::timer::TimerPatch;

use super::coordinator::Coordinator;
use super::event::{Command, CommandError, NodeEvent};
use super::state::NodeView;

#[derive(Debug, Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeEvent>,
    view: watch::Receiver<NodeView>,
}

impl NodeHandle {
    /// Spawn the coordinator's event loop and return a handle to it
    pub fn spawn(
        coordinator: Coordinator,
        tx: mpsc::Sender<NodeEvent>,
        rx: mpsc::Receiver<NodeEvent>,
    ) -> (Self, JoinHandle<()>) {
        let view = coordinator.subscribe_view();
        let task = tokio::spawn(coordinator.run(rx));
        (Self { tx, view }, task)
    }

    /// Latest published view
    pub fn view(&self) -> NodeView {
        self.view.borrow().clone()
    }

    /// Receiver that wakes on every view change
    pub fn watch(&self) -> watch::Receiver<NodeView> {
        self.view.clone()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T, CommandError>>) -> Command,
    ) -> Result<T, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(NodeEvent::Command(make(reply)))
            .await
            .map_err(|_| CommandError::Stopped)?;
        rx.await.map_err(|_| CommandError::Stopped)?
    }

    /// Add a timer, returning its id
    pub async fn add_timer(
        &self,
        name: Option<String>,
        seconds: Option<u64>,
    ) -> Result<String, CommandError> {
        self.request(|reply| Command::AddTimer {
            name,
            seconds,
            reply,
        })
        .await
    }

    pub async fn delete_timer(&self, id: impl Into<String>) -> Result<(), CommandError> {
        let id = id.into();
        self.request(|reply| Command::DeleteTimer { id, reply }).await
    }

    pub async fn update_timer(
        &self,
        id: impl Into<String>,
        patch: TimerPatch,
    ) -> Result<(), CommandError> {
        let id = id.into();
        self.request(|reply| Command::UpdateTimer { id, patch, reply })
            .await
    }

    pub async fn toggle_timer(&self, id: impl Into<String>) -> Result<(), CommandError> {
        let id = id.into();
        self.request(|reply| Command::ToggleTimer { id, reply }).await
    }

    pub async fn reset_timer(&self, id: impl Into<String>) -> Result<(), CommandError> {
        let id = id.into();
        self.request(|reply| Command::ResetTimer { id, reply }).await
    }

    pub async fn start_all(&self) -> Result<(), CommandError> {
        self.request(|reply| Command::StartAll { reply }).await
    }

    pub async fn pause_all(&self) -> Result<(), CommandError> {
        self.request(|reply| Command::PauseAll { reply }).await
    }

    pub async fn join_cluster(&self, target: impl Into<String>) -> Result<(), CommandError> {
        let target = target.into();
        self.request(|reply| Command::Join { target, reply }).await
    }

    pub async fn leave_cluster(&self) -> Result<(), CommandError> {
        self.request(|reply| Command::Leave { reply }).await
    }

    /// Stop the coordinator and wait until teardown finished
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(NodeEvent::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
