//! Session observer bridge
//!
//! The engine publishes a snapshot on every visible change. Subscribers read
//! the most recent snapshot through a `watch` channel, so intermediate
//! streaming snapshots may be coalesced. Terminal snapshots are additionally
//! queued per subscriber and are never lost.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};

use crate::{
    session::TurnState,
    store::{Failure, Message, MessageStatus, Role},
};

/// Presentation view of the message a snapshot is about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub status: MessageStatus,
    pub failure: Option<Failure>,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            role: message.role,
            content: message.content.clone(),
            status: message.status,
            failure: message.failure.clone(),
        }
    }
}

/// Immutable view of a session at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Strictly increasing per observer
    pub seq: u64,
    pub conversation_id: String,
    pub state: TurnState,
    pub message: Option<MessageView>,
    /// Set for the snapshot that finalizes a message
    pub terminal: bool,
}

impl SessionSnapshot {
    pub fn failure(&self) -> Option<&Failure> {
        self.message.as_ref().and_then(|message| message.failure.as_ref())
    }
}

struct Publisher {
    next_seq: u64,
    terminals: Vec<mpsc::UnboundedSender<SessionSnapshot>>,
}

/// Publisher side, owned by the session engine
pub struct SessionObserver {
    conversation_id: String,
    latest: watch::Sender<SessionSnapshot>,
    publisher: Mutex<Publisher>,
}

impl SessionObserver {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        let (latest, _) = watch::channel(SessionSnapshot {
            seq: 0,
            conversation_id: conversation_id.clone(),
            state: TurnState::Idle,
            message: None,
            terminal: false,
        });
        Self {
            conversation_id,
            latest,
            publisher: Mutex::new(Publisher {
                next_seq: 1,
                terminals: Vec::new(),
            }),
        }
    }

    /// Publish an intermediate snapshot
    pub fn publish(&self, state: TurnState, message: Option<MessageView>) -> u64 {
        self.emit(state, message, false)
    }

    /// Publish a snapshot that every subscriber is guaranteed to receive
    pub fn publish_terminal(&self, state: TurnState, message: MessageView) -> u64 {
        self.emit(state, Some(message), true)
    }

    /// Latest published snapshot, without waiting
    pub fn current(&self) -> SessionSnapshot {
        self.latest.borrow().clone()
    }

    /// Subscribe to snapshots published from now on
    pub fn subscribe(&self) -> Subscription {
        let mut publisher = self.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        publisher.terminals.push(tx);

        let latest = self.latest.subscribe();
        let last_seq = latest.borrow().seq;
        Subscription {
            latest,
            terminals: rx,
            last_seq,
            stash: None,
        }
    }

    fn emit(&self, state: TurnState, message: Option<MessageView>, terminal: bool) -> u64 {
        // Sequence numbers, queue order and the watch value stay consistent
        // because all three are updated under the same lock
        let mut publisher = self.lock();
        let seq = publisher.next_seq;
        publisher.next_seq += 1;

        let snapshot = SessionSnapshot {
            seq,
            conversation_id: self.conversation_id.clone(),
            state,
            message,
            terminal,
        };

        if terminal {
            publisher
                .terminals
                .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
        }
        self.latest.send_replace(snapshot);
        seq
    }

    fn lock(&self) -> MutexGuard<'_, Publisher> {
        self.publisher.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Consumer side of a [`SessionObserver`]
pub struct Subscription {
    latest: watch::Receiver<SessionSnapshot>,
    terminals: mpsc::UnboundedReceiver<SessionSnapshot>,
    last_seq: u64,
    stash: Option<SessionSnapshot>,
}

impl Subscription {
    /// Wait for the next snapshot.
    ///
    /// Snapshots arrive in increasing `seq` order. Terminal snapshots are
    /// always delivered; intermediate ones may be skipped in favour of newer
    /// ones. Returns `None` once the observer is gone and everything queued
    /// has been delivered.
    pub async fn next(&mut self) -> Option<SessionSnapshot> {
        loop {
            // Read the watch first: any terminal published before that value
            // is already in the queue
            if self.latest.has_changed().unwrap_or(false) {
                let snapshot = self.latest.borrow_and_update().clone();
                self.stash_if_newer(snapshot);
            }

            if let Some(snapshot) = self.pop_terminal() {
                return Some(snapshot);
            }

            if let Some(snapshot) = self.stash.take() {
                if snapshot.seq > self.last_seq {
                    self.last_seq = snapshot.seq;
                    return Some(snapshot);
                }
            }

            tokio::select! {
                changed = self.latest.changed() => {
                    if changed.is_err() {
                        return self.drain_closed();
                    }
                }
                terminal = self.terminals.recv() => match terminal {
                    Some(snapshot) if snapshot.seq > self.last_seq => {
                        self.last_seq = snapshot.seq;
                        return Some(snapshot);
                    }
                    Some(_) => {}
                    None => return self.drain_closed(),
                },
            }
        }
    }

    fn stash_if_newer(&mut self, snapshot: SessionSnapshot) {
        let newer_than_stash = self.stash.as_ref().map_or(true, |stash| snapshot.seq > stash.seq);
        if snapshot.seq > self.last_seq && newer_than_stash {
            self.stash = Some(snapshot);
        }
    }

    fn pop_terminal(&mut self) -> Option<SessionSnapshot> {
        while let Ok(snapshot) = self.terminals.try_recv() {
            if snapshot.seq <= self.last_seq {
                continue;
            }
            if self.stash.as_ref().is_some_and(|stash| stash.seq <= snapshot.seq) {
                self.stash = None;
            }
            self.last_seq = snapshot.seq;
            return Some(snapshot);
        }
        None
    }

    fn drain_closed(&mut self) -> Option<SessionSnapshot> {
        if let Some(snapshot) = self.pop_terminal() {
            return Some(snapshot);
        }
        let snapshot = self.latest.borrow().clone();
        if snapshot.seq > self.last_seq {
            self.last_seq = snapshot.seq;
            return Some(snapshot);
        }
        None
    }
}
