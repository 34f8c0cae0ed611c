//! Scripted gateway for tests and offline runs
//!
//! Each call to `stream_completion` consumes the next queued script. Scripts
//! can pause between deltas or hang until cancelled, which lets tests drive
//! every session state deterministically.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    llm::{
        gateway::{either_cancelled, ModelGateway},
        types::{ChatTurn, DeltaStream, StreamDelta},
    },
    store::FailureKind,
};

/// One step of a scripted response
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Delta(StreamDelta),
    Pause(Duration),
    /// Block until the request is cancelled
    Hang,
}

#[derive(Default)]
struct ScriptState {
    scripts: VecDeque<Vec<ScriptStep>>,
    requests: Vec<Vec<ChatTurn>>,
}

/// Gateway that replays queued scripts
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    state: Arc<Mutex<ScriptState>>,
    lifecycle: CancellationToken,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the script for the next request
    pub fn push_script(&self, steps: Vec<ScriptStep>) -> &Self {
        self.lock().scripts.push_back(steps);
        self
    }

    /// Queue a response that streams `parts` and then finishes
    pub fn push_reply(&self, parts: &[&str]) -> &Self {
        let mut steps = tokens(parts);
        steps.push(ScriptStep::Delta(StreamDelta::finished()));
        self.push_script(steps)
    }

    /// Queue a response that fails before any token
    pub fn push_failure(&self, kind: FailureKind, detail: &str) -> &Self {
        self.push_script(vec![ScriptStep::Delta(StreamDelta::failed(kind, detail))])
    }

    /// Histories received so far, oldest first
    pub fn requests(&self) -> Vec<Vec<ChatTurn>> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    pub fn remaining_scripts(&self) -> usize {
        self.lock().scripts.len()
    }

    // Poisoning is ignored; the queue stays usable after a panicking test
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Token steps for each part, in order
pub fn tokens(parts: &[&str]) -> Vec<ScriptStep> {
    parts
        .iter()
        .map(|part| ScriptStep::Delta(StreamDelta::token(*part)))
        .collect()
}

impl ModelGateway for ScriptedGateway {
    fn stream_completion(&self, history: Vec<ChatTurn>, cancel: CancellationToken) -> DeltaStream {
        let steps = {
            let mut state = self.lock();
            state.requests.push(history);
            state.scripts.pop_front()
        };

        let steps: VecDeque<ScriptStep> = match steps {
            Some(steps) => steps.into(),
            None => VecDeque::from(vec![ScriptStep::Delta(StreamDelta::failed(
                FailureKind::Transport,
                "no scripted response left",
            ))]),
        };

        let replay = Replay {
            steps,
            cancel,
            lifecycle: self.lifecycle.clone(),
            done: false,
        };

        Box::pin(futures::stream::unfold(replay, |mut replay| async move {
            replay.next_delta().await.map(|delta| (delta, replay))
        }))
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    fn shutdown(&self) {
        self.lifecycle.cancel();
    }
}

struct Replay {
    steps: VecDeque<ScriptStep>,
    cancel: CancellationToken,
    lifecycle: CancellationToken,
    done: bool,
}

impl Replay {
    async fn next_delta(&mut self) -> Option<StreamDelta> {
        if self.done {
            return None;
        }

        loop {
            if self.cancel.is_cancelled() || self.lifecycle.is_cancelled() {
                self.done = true;
                return Some(StreamDelta::cancelled());
            }

            let Some(step) = self.steps.pop_front() else {
                // Scripts without a terminal step behave like a dropped connection
                self.done = true;
                return Some(StreamDelta::failed(
                    FailureKind::Transport,
                    "connection closed before the completion marker",
                ));
            };

            match step {
                ScriptStep::Delta(delta) => {
                    self.done = delta.is_terminal();
                    return Some(delta);
                }
                ScriptStep::Pause(duration) => {
                    tokio::select! {
                        _ = either_cancelled(&self.cancel, &self.lifecycle) => {}
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                ScriptStep::Hang => {
                    either_cancelled(&self.cancel, &self.lifecycle).await;
                }
            }
        }
    }
}
