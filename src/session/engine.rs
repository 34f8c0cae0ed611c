//! Session engine
//!
//! One engine drives the turns of one conversation. A turn persists the user
//! message and an assistant draft, streams the reply from the gateway, and
//! finalizes the draft as complete or failed. Progress is published through the
//! [`SessionObserver`].

use chrono::Utc;
use futures::StreamExt;
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    checkpoint::{CheckpointClock, CheckpointPolicy},
    errors::{SessionError, SessionResult},
    history::build_history,
    locks::MessageLocks,
    retry::RetryPolicy,
    state::{
        wait_for_outcome, ActiveTurn, OutcomeReceiver, OutcomeSender, SessionState, TurnHandle,
        TurnOutcome, TurnState,
    },
};
use crate::{
    llm::{ChatTurn, DeltaStream, ModelGateway, StreamDelta},
    observer::{MessageView, SessionObserver, SessionSnapshot, Subscription},
    store::{
        derive_title, Database, Failure, FailureKind, Message, MessageStatus, NewMessage, Role,
        DEFAULT_TITLE,
    },
};

/// Deltas buffered between the I/O task and the turn task
const DELTA_CHANNEL_CAPACITY: usize = 64;

/// Default upper bound on history characters sent with a request
pub const DEFAULT_MAX_HISTORY_CHARS: usize = 24_000;

/// Attempts at writing the final state of a reply
const FINAL_WRITE_ATTEMPTS: u32 = 2;
const FINAL_WRITE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Tunables for a session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Prepended to every request when set
    pub system_message: Option<String>,
    pub checkpoint: CheckpointPolicy,
    pub retry: RetryPolicy,
    pub max_history_chars: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            system_message: None,
            checkpoint: CheckpointPolicy::default(),
            retry: RetryPolicy::default(),
            max_history_chars: DEFAULT_MAX_HISTORY_CHARS,
        }
    }
}

/// Drives the turns of one conversation.
///
/// Cloning is cheap; clones share the same session.
#[derive(Clone)]
pub struct SessionEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    conversation_id: String,
    store: Database,
    gateway: Arc<dyn ModelGateway>,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    observer: SessionObserver,
    locks: MessageLocks,
}

/// A turn slot claimed while the session was idle.
///
/// Dropping it without reporting an outcome hands the slot back and reports
/// [`TurnOutcome::Aborted`].
struct Reservation {
    inner: Arc<EngineInner>,
    cancel: CancellationToken,
    done: Option<OutcomeSender>,
    outcome: OutcomeReceiver,
}

impl Reservation {
    fn finish(mut self, outcome: TurnOutcome) {
        if let Some(done) = self.done.take() {
            let _ = done.send(Some(outcome));
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            debug!("Released unused turn slot in conversation {}", self.inner.conversation_id);
            self.inner.set_idle();
            let _ = done.send(Some(TurnOutcome::Aborted));
        }
    }
}

/// Everything a spawned turn needs
struct TurnContext {
    draft: Message,
    history: Vec<ChatTurn>,
    slot: Reservation,
}

/// How the streaming phase of a turn ended
enum StreamEnd {
    Finished,
    Failed(Failure),
}

impl SessionEngine {
    /// Open a session for an existing conversation.
    ///
    /// Messages left pending or streaming by an earlier process are marked as
    /// failed before the session accepts any turn.
    pub async fn open(
        store: Database,
        gateway: Arc<dyn ModelGateway>,
        settings: SessionSettings,
        conversation_id: &str,
    ) -> SessionResult<Self> {
        if store.get_conversation(conversation_id).await?.is_none() {
            return Err(SessionError::ConversationNotFound(conversation_id.to_string()));
        }

        let recovered = store.recover_interrupted(conversation_id).await?;
        if !recovered.is_empty() {
            warn!(
                "Recovered {} interrupted message(s) in conversation {}",
                recovered.len(),
                conversation_id
            );
        }

        info!(
            "Opened session for conversation {} using {}/{}",
            conversation_id,
            gateway.name(),
            gateway.model()
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                conversation_id: conversation_id.to_string(),
                store,
                gateway,
                settings,
                state: Mutex::new(SessionState::new()),
                observer: SessionObserver::new(conversation_id),
                locks: MessageLocks::new(),
            }),
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    /// Current turn state
    pub fn state(&self) -> TurnState {
        self.inner.lock_state().turn
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.observer.current()
    }

    /// Subscribe to snapshots published from now on
    pub fn subscribe(&self) -> Subscription {
        self.inner.observer.subscribe()
    }

    /// All persisted messages of the conversation, in order
    pub async fn messages(&self) -> SessionResult<Vec<Message>> {
        Ok(self.inner.store.list_messages(&self.inner.conversation_id).await?)
    }

    /// The trailing message when it is a failed assistant reply
    pub async fn last_failed(&self) -> SessionResult<Option<Message>> {
        let messages = self.messages().await?;
        Ok(messages
            .into_iter()
            .last()
            .filter(|message| message.role == Role::Assistant && message.status == MessageStatus::Failed))
    }

    /// Send a user message and start streaming the reply.
    ///
    /// Returns once the user message and the assistant draft are persisted.
    pub async fn submit_user_message(&self, text: &str) -> SessionResult<TurnHandle> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let reservation = EngineInner::reserve(&self.inner)?;
        let engine = self.clone();
        let text = text.to_string();
        launch(async move {
            let (user_id, draft, history) = engine.prepare_submit(&text).await?;
            Ok(engine.start_turn(reservation, user_id, draft, history))
        })
        .await
    }

    /// Re-run the turn of a failed trailing assistant message.
    ///
    /// The same user message is answered again in a fresh draft; the failed
    /// message stays in the conversation but is left out of the history.
    pub async fn retry(&self, message_id: &str) -> SessionResult<TurnHandle> {
        let reservation = EngineInner::reserve(&self.inner)?;
        let engine = self.clone();
        let message_id = message_id.to_string();
        launch(async move {
            let (user_id, draft, history) = engine.prepare_retry(&message_id).await?;
            Ok(engine.start_turn(reservation, user_id, draft, history))
        })
        .await
    }

    /// Stop the active turn and wait until the session is idle.
    ///
    /// Calling this with no active turn does nothing.
    pub async fn cancel(&self) {
        let (turn, active) = {
            let state = self.inner.lock_state();
            (state.turn, state.active.clone())
        };

        let Some(mut active) = active else {
            return;
        };

        // Finalizing runs to the end on its own
        if turn.is_cancellable() {
            debug!("Cancelling active turn in conversation {}", self.inner.conversation_id);
            active.cancel.cancel();
        }
        wait_for_outcome(&mut active.done).await;
    }

    /// Tear the session down, stopping any active turn
    pub async fn close(&self) {
        self.cancel().await;
        debug!("Closed session for conversation {}", self.inner.conversation_id);
    }

    async fn prepare_submit(&self, text: &str) -> SessionResult<(String, Message, Vec<ChatTurn>)> {
        let store = &self.inner.store;
        let conversation_id = &self.inner.conversation_id;

        self.inner.fail_stray_drafts().await?;
        let user = store.append_message(NewMessage::user(conversation_id.as_str(), text)).await?;

        match store.get_conversation(conversation_id).await {
            Ok(Some(conversation)) if conversation.title == DEFAULT_TITLE => {
                let title = derive_title(text);
                if let Err(e) = store.rename_conversation(conversation_id, &title).await {
                    warn!("Failed to set title for conversation {}: {}", conversation_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load conversation {}: {}", conversation_id, e),
        }

        let history = self.inner.history(&store.list_messages(conversation_id).await?);
        let draft = store
            .append_message(NewMessage::draft(conversation_id.as_str(), user.id.as_str()))
            .await?;
        Ok((user.id, draft, history))
    }

    async fn prepare_retry(&self, message_id: &str) -> SessionResult<(String, Message, Vec<ChatTurn>)> {
        let not_retryable = |reason: &str| SessionError::NotRetryable {
            id: message_id.to_string(),
            reason: reason.to_string(),
        };

        let messages = self.messages().await?;
        let Some(last) = messages.last() else {
            return Err(not_retryable("conversation has no messages"));
        };
        if last.id != message_id {
            return Err(not_retryable("only the last message can be retried"));
        }
        if last.role != Role::Assistant || last.status != MessageStatus::Failed {
            return Err(not_retryable("message is not a failed assistant reply"));
        }
        let Some(user_id) = last.reply_to.clone() else {
            return Err(not_retryable("message does not answer a user message"));
        };

        self.inner.fail_stray_drafts().await?;
        let history = self.inner.history(&messages);
        let draft = self
            .inner
            .store
            .append_message(NewMessage::draft(self.inner.conversation_id.as_str(), user_id.as_str()))
            .await?;
        Ok((user_id, draft, history))
    }

    fn start_turn(
        &self,
        reservation: Reservation,
        user_message_id: String,
        draft: Message,
        history: Vec<ChatTurn>,
    ) -> TurnHandle {
        let inner = &self.inner;

        inner.observer.publish(TurnState::AwaitingFirstToken, Some(MessageView::from(&draft)));

        let handle = TurnHandle {
            user_message_id,
            draft_message_id: draft.id.clone(),
            done: reservation.outcome.clone(),
        };

        let context = TurnContext {
            draft,
            history,
            slot: reservation,
        };
        tokio::spawn(inner.clone().run_turn(context));

        handle
    }
}

/// Run turn preparation on its own task.
///
/// The store writes and the hand-off to the turn task finish even when the
/// caller stops polling, so the session never stays reserved by a dropped
/// future.
async fn launch<F>(prepare: F) -> SessionResult<TurnHandle>
where
    F: Future<Output = SessionResult<TurnHandle>> + Send + 'static,
{
    tokio::spawn(prepare).await?
}

impl EngineInner {
    fn history(&self, messages: &[Message]) -> Vec<ChatTurn> {
        build_history(
            self.settings.system_message.as_deref(),
            messages,
            self.settings.max_history_chars,
        )
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the session for a new turn
    fn reserve(this: &Arc<Self>) -> SessionResult<Reservation> {
        let mut state = this.lock_state();
        if state.turn != TurnState::Idle {
            return Err(SessionError::InvalidState {
                expected: TurnState::Idle,
                actual: state.turn,
            });
        }

        let cancel = CancellationToken::new();
        let (done, done_rx) = watch::channel(None);
        state.turn = TurnState::AwaitingFirstToken;
        state.active = Some(ActiveTurn {
            cancel: cancel.clone(),
            done: done_rx.clone(),
        });
        Ok(Reservation {
            inner: Arc::clone(this),
            cancel,
            done: Some(done),
            outcome: done_rx,
        })
    }

    /// Fail drafts an earlier turn could not finalize
    async fn fail_stray_drafts(&self) -> SessionResult<()> {
        let stray = self.store.recover_interrupted(&self.conversation_id).await?;
        if !stray.is_empty() {
            warn!(
                "Marked {} unfinished draft(s) as failed in conversation {}",
                stray.len(),
                self.conversation_id
            );
        }
        Ok(())
    }

    fn set_turn(&self, turn: TurnState) {
        self.lock_state().turn = turn;
    }

    fn set_idle(&self) {
        let mut state = self.lock_state();
        state.turn = TurnState::Idle;
        state.active = None;
    }

    async fn run_turn(self: Arc<Self>, context: TurnContext) {
        let TurnContext {
            mut draft,
            history,
            slot,
        } = context;
        let cancel = slot.cancel.clone();

        debug!(
            "Starting turn for draft {} with {} history turn(s)",
            draft.id,
            history.len()
        );

        let mut content = String::new();
        let mut started = false;
        let mut retries = 0u32;
        let mut checkpoint: Option<JoinHandle<()>> = None;

        let end = loop {
            let end = self
                .stream_attempt(&mut draft, &history, &cancel, &mut content, &mut started, &mut checkpoint)
                .await;

            let failure = match end {
                StreamEnd::Failed(failure) => failure,
                finished => break finished,
            };

            if started || cancel.is_cancelled() || !self.settings.retry.allows(failure.kind, retries) {
                break StreamEnd::Failed(failure);
            }

            retries += 1;
            let delay = self.settings.retry.delay_for(retries);
            warn!(
                "Request for draft {} failed with {}, retry {}/{} in {:?}",
                draft.id, failure.kind, retries, self.settings.retry.max_auto_retries, delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Failed(Failure::cancelled()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        if let Some(pending) = checkpoint.take() {
            let _ = pending.await;
        }

        let outcome = match end {
            StreamEnd::Finished => self.finish_complete(draft, content).await,
            StreamEnd::Failed(failure) => self.finish_failed(draft, content, failure).await,
        };

        slot.finish(outcome);
    }

    /// Run one gateway request until it ends
    async fn stream_attempt(
        &self,
        draft: &mut Message,
        history: &[ChatTurn],
        cancel: &CancellationToken,
        content: &mut String,
        started: &mut bool,
        checkpoint: &mut Option<JoinHandle<()>>,
    ) -> StreamEnd {
        let stream = self.gateway.stream_completion(history.to_vec(), cancel.clone());
        let (tx, mut rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump_deltas(stream, tx));

        let mut clock = CheckpointClock::new(self.settings.checkpoint);

        let end = loop {
            let delta = tokio::select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Failed(Failure::cancelled()),
                delta = rx.recv() => delta,
            };

            match delta {
                Some(StreamDelta::Token { text }) => {
                    content.push_str(&text);

                    if !*started {
                        *started = true;
                        self.set_turn(TurnState::Streaming);
                        draft.status = MessageStatus::Streaming;
                        let _guard = self.locks.lock(&draft.id).await;
                        if let Err(e) = self
                            .store
                            .update_message(&draft.id, content, MessageStatus::Streaming, None)
                            .await
                        {
                            warn!("Failed to mark draft {} as streaming: {}", draft.id, e);
                        }
                        clock.mark_written(Instant::now());
                    } else {
                        clock.record_delta();
                    }

                    draft.content.clone_from(content);
                    self.observer
                        .publish(TurnState::Streaming, Some(MessageView::from(&*draft)));

                    let now = Instant::now();
                    let idle = checkpoint.as_ref().map_or(true, |handle| handle.is_finished());
                    if idle && clock.is_due(now) {
                        *checkpoint = Some(self.spawn_checkpoint(&draft.id, content.clone()));
                        clock.mark_written(now);
                    }
                }
                Some(StreamDelta::Finished { finish_reason, usage }) => {
                    debug!(
                        "Stream for draft {} finished: reason={:?} usage={:?}",
                        draft.id, finish_reason, usage
                    );
                    break StreamEnd::Finished;
                }
                Some(StreamDelta::Failed { kind, detail }) => {
                    break StreamEnd::Failed(if kind == FailureKind::Cancelled {
                        Failure::cancelled()
                    } else {
                        Failure::new(kind, detail)
                    });
                }
                None => {
                    break StreamEnd::Failed(Failure::new(
                        FailureKind::Transport,
                        "stream ended without a completion marker",
                    ));
                }
            }
        };

        pump.abort();
        end
    }

    fn spawn_checkpoint(&self, message_id: &str, content: String) -> JoinHandle<()> {
        let store = self.store.clone();
        let locks = self.locks.clone();
        let message_id = message_id.to_string();
        tokio::spawn(async move {
            let _guard = locks.lock(&message_id).await;
            match store.checkpoint_message(&message_id, &content).await {
                Ok(true) => debug!("Checkpointed draft {} ({} bytes)", message_id, content.len()),
                Ok(false) => debug!("Skipped checkpoint for finalized message {}", message_id),
                Err(e) => warn!("Checkpoint for draft {} failed: {}", message_id, e),
            }
        })
    }

    async fn finish_complete(&self, mut draft: Message, content: String) -> TurnOutcome {
        self.set_turn(TurnState::Finalizing);
        self.observer
            .publish(TurnState::Finalizing, Some(MessageView::from(&draft)));

        draft.content = content;
        draft.status = MessageStatus::Complete;
        draft.failure = None;
        draft.updated_at = Utc::now();
        if !self.persist_final(&draft).await {
            return self.finish_unsaved(draft);
        }

        info!("Completed reply {} ({} chars)", draft.id, draft.content.chars().count());

        self.set_idle();
        self.observer
            .publish_terminal(TurnState::Idle, MessageView::from(&draft));
        TurnOutcome::Completed(draft)
    }

    async fn finish_failed(&self, mut draft: Message, content: String, failure: Failure) -> TurnOutcome {
        self.set_turn(TurnState::Failed);

        draft.content = content;
        draft.status = MessageStatus::Failed;
        draft.failure = Some(failure.clone());
        draft.updated_at = Utc::now();
        if !self.persist_final(&draft).await {
            return self.finish_unsaved(draft);
        }

        if failure.kind == FailureKind::Cancelled {
            info!("Reply {} cancelled after {} chars", draft.id, draft.content.chars().count());
        } else {
            warn!(
                "Reply {} failed ({}): {}",
                draft.id,
                failure.kind,
                failure.detail.as_deref().unwrap_or("")
            );
        }

        self.observer
            .publish_terminal(TurnState::Failed, MessageView::from(&draft));
        self.set_idle();
        self.observer.publish(TurnState::Idle, None);
        TurnOutcome::Failed(draft)
    }

    /// The reply ended but the store still holds it as in progress. The row is
    /// failed before the next turn starts or when the conversation is reopened.
    fn finish_unsaved(&self, draft: Message) -> TurnOutcome {
        error!("Reply {} ended as {} but could not be saved", draft.id, draft.status);

        self.observer
            .publish_terminal(TurnState::Failed, MessageView::from(&draft));
        self.set_idle();
        self.observer.publish(TurnState::Idle, None);
        TurnOutcome::Unsaved(draft)
    }

    /// Write the final state of a draft. Returns whether it reached the store.
    async fn persist_final(&self, draft: &Message) -> bool {
        let guard = self.locks.lock(&draft.id).await;

        let mut saved = false;
        for attempt in 1..=FINAL_WRITE_ATTEMPTS {
            match self
                .store
                .update_message(&draft.id, &draft.content, draft.status, draft.failure.clone())
                .await
            {
                Ok(()) => {
                    saved = true;
                    break;
                }
                Err(e) => warn!(
                    "Failed to persist final state of message {} (attempt {}/{}): {}",
                    draft.id, attempt, FINAL_WRITE_ATTEMPTS, e
                ),
            }
            if attempt < FINAL_WRITE_ATTEMPTS {
                tokio::time::sleep(FINAL_WRITE_RETRY_DELAY).await;
            }
        }

        drop(guard);
        self.locks.forget(&draft.id);
        saved
    }
}

/// Drive the gateway stream on its own task and hand deltas to the turn
async fn pump_deltas(mut stream: DeltaStream, tx: mpsc::Sender<StreamDelta>) {
    while let Some(delta) = stream.next().await {
        let terminal = delta.is_terminal();
        if tx.send(delta).await.is_err() || terminal {
            break;
        }
    }
}
