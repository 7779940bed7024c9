//! Asynchronous assistant replies. One invocation per user message: signal
//! typing, gather recent history, ask the generation provider once, store
//! the answer (or an apology), push it to the user, clear typing.
//!
//! Nothing here fails the request that triggered it. Every error is logged
//! and turned into an apology inside the conversation.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use ideaspark_gateway::Notifier;
use ideaspark_types::events::TypingState;
use ideaspark_types::models::{Message, Sender};

use crate::AppError;
use crate::generation::{ChatTurn, GenerationError, GenerationProvider, GenerationRequest, Role};
use crate::service::ConversationService;

pub const TYPING_NOTE: &str = "Thinking...";
pub const HISTORY_LIMIT: u32 = 10;
pub const EMPTY_REPLY_APOLOGY: &str =
    "Sorry, I could not generate a response at this moment. Please try again.";
pub const ERROR_APOLOGY: &str =
    "Sorry, an error occurred while I was thinking. Please try rephrasing your message.";

/// One message to answer.
#[derive(Debug, Clone)]
pub struct ReplyJob {
    pub conversation_id: Uuid,
    /// Who sent the message, and who gets notified.
    pub owner: Uuid,
    pub trigger_message_id: Uuid,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    Started,
    TypingNotified,
    ContextFetched,
    GenerationRequested,
    Succeeded,
    Failed,
    TypingCleared,
}

#[derive(Debug)]
pub enum ReplyOutcome {
    Replied(Message),
    Apologized(Message),
    /// Nothing could be stored, usually because the conversation is gone.
    Abandoned,
}

#[derive(Clone)]
pub struct ReplyPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    provider: Arc<dyn GenerationProvider>,
    notifier: Arc<dyn Notifier>,
    timeout: Duration,
    /// Per-conversation turn locks. Tokio mutexes queue waiters in FIFO
    /// order, so replies land in the order their messages were sent.
    turns: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReplyPipeline {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        notifier: Arc<dyn Notifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                provider,
                notifier,
                timeout,
                turns: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Run the reply on its own task. The caller never awaits it.
    pub fn spawn(&self, store: ConversationService, job: ReplyJob) -> JoinHandle<ReplyOutcome> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(&store, job).await })
    }

    /// Answer `job`, waiting behind any earlier reply for the same
    /// conversation.
    pub async fn run(&self, store: &ConversationService, job: ReplyJob) -> ReplyOutcome {
        let turn = self.turn_lock(job.conversation_id);
        let outcome = {
            let _guard = turn.lock().await;
            self.reply(store, &job).await
        };
        self.release_turn(job.conversation_id, turn);
        outcome
    }

    fn turn_lock(&self, conversation_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut turns = self.inner.turns.lock().unwrap_or_else(|e| e.into_inner());
        turns.entry(conversation_id).or_default().clone()
    }

    fn release_turn(&self, conversation_id: Uuid, turn: Arc<tokio::sync::Mutex<()>>) {
        let mut turns = self.inner.turns.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this handle left: no one is waiting.
        if Arc::strong_count(&turn) == 2 {
            turns.remove(&conversation_id);
        }
    }

    async fn reply(&self, store: &ConversationService, job: &ReplyJob) -> ReplyOutcome {
        self.step(job, ReplyState::Started);

        let started = TypingState::started(job.conversation_id, TYPING_NOTE);
        if !self.inner.notifier.notify_typing(job.owner, started).await {
            debug!("Typing start for {} not delivered", job.conversation_id);
        }
        self.step(job, ReplyState::TypingNotified);

        let outcome = match AssertUnwindSafe(self.answer(store, job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("Reply for {} panicked, apologizing", job.conversation_id);
                self.step(job, ReplyState::Failed);
                self.deliver(store, job, ERROR_APOLOGY, false).await
            }
        };

        let stopped = TypingState::stopped(job.conversation_id);
        if !self.inner.notifier.notify_typing(job.owner, stopped).await {
            debug!("Typing stop for {} not delivered", job.conversation_id);
        }
        self.step(job, ReplyState::TypingCleared);
        outcome
    }

    async fn answer(&self, store: &ConversationService, job: &ReplyJob) -> ReplyOutcome {
        let history = match store
            .recent_history(
                job.conversation_id,
                job.owner,
                job.trigger_message_id,
                HISTORY_LIMIT,
            )
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(
                    "History for {} unavailable, replying without it: {}",
                    job.conversation_id, e
                );
                Vec::new()
            }
        };
        self.step(job, ReplyState::ContextFetched);

        let mut turns: Vec<ChatTurn> = history
            .into_iter()
            .map(|m| ChatTurn {
                role: match m.sender {
                    Sender::User => Role::User,
                    Sender::System => Role::Model,
                },
                text: m.content,
            })
            .collect();
        turns.push(ChatTurn {
            role: Role::User,
            text: job.content.clone(),
        });

        let request = GenerationRequest::new(turns);
        self.step(job, ReplyState::GenerationRequested);
        let generated =
            tokio::time::timeout(self.inner.timeout, self.inner.provider.generate(&request))
                .await
                .unwrap_or(Err(GenerationError::Timeout));

        match generated {
            Ok(text) => {
                self.step(job, ReplyState::Succeeded);
                self.deliver(store, job, &text, true).await
            }
            Err(e) => {
                warn!(
                    "Generation for {} with {} failed: {}",
                    job.conversation_id,
                    self.inner.provider.model_name(),
                    e
                );
                self.step(job, ReplyState::Failed);
                let apology = match e {
                    GenerationError::Empty | GenerationError::Malformed(_) => EMPTY_REPLY_APOLOGY,
                    _ => ERROR_APOLOGY,
                };
                self.deliver(store, job, apology, false).await
            }
        }
    }

    /// Stores the reply as a system message and pushes it to the owner.
    async fn deliver(
        &self,
        store: &ConversationService,
        job: &ReplyJob,
        text: &str,
        succeeded: bool,
    ) -> ReplyOutcome {
        let message = match store.append_system_message(job.conversation_id, text).await {
            Ok(message) => message,
            Err(AppError::NotFound(_)) => {
                warn!(
                    "Conversation {} vanished before its reply was stored",
                    job.conversation_id
                );
                return ReplyOutcome::Abandoned;
            }
            Err(e) => {
                error!("Failed to store reply for {}: {}", job.conversation_id, e);
                return ReplyOutcome::Abandoned;
            }
        };

        if !self.inner.notifier.notify_message(job.owner, &message).await {
            debug!("Reply {} not delivered, user offline", message.id);
        }

        if succeeded {
            ReplyOutcome::Replied(message)
        } else {
            ReplyOutcome::Apologized(message)
        }
    }

    fn step(&self, job: &ReplyJob, state: ReplyState) {
        debug!("Reply for {}: {:?}", job.conversation_id, state);
    }
}
