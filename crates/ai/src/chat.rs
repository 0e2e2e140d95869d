//! Stateful streaming chat sessions.
//!
//! A session processes at most one `send_message` at a time; the busy latch
//! rejects concurrent sends with `Busy` instead of interleaving two streams
//! into one history. The user message is appended synchronously before any
//! upstream work, so it survives every failure mode. The assistant message
//! is appended only on clean completion, as one atomic append of the fully
//! assembled text: a cancelled or failed stream leaves no partial assistant
//! text behind.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use advisor_core::domain::budget::TokenUsage;
use advisor_core::domain::chat::{ChatMessage, ChatRole, ChatSession, SessionId};
use advisor_core::domain::UserId;
use advisor_core::errors::AiError;
use advisor_core::prompt::PromptCompiler;

use crate::gateway::{GatewayStream, ModelGateway, StreamEvent};
use crate::ledger::{estimate_request_tokens, BudgetLedger, BudgetReservation, ReserveOutcome};

/// Per-message delivery: zero or more deltas, then exactly one terminal
/// event, either `Completed` with the full text and usage, or `Failed`.
#[derive(Debug)]
pub enum ChatEvent {
    Delta(String),
    Completed { text: String, usage: TokenUsage },
    Failed(AiError),
}

/// Caller's end of one message delivery. Dropping it cancels: the manager
/// stops consuming the upstream stream and discards partial assistant text.
#[derive(Debug)]
pub struct ChatStream {
    rx: mpsc::Receiver<ChatEvent>,
}

impl ChatStream {
    pub async fn next(&mut self) -> Option<ChatEvent> {
        self.rx.recv().await
    }
}

struct SessionSlot {
    session: ChatSession,
    busy: bool,
}

type SessionMap = Arc<Mutex<HashMap<String, SessionSlot>>>;

pub struct ChatSessionManager {
    sessions: SessionMap,
    ledger: Arc<BudgetLedger>,
    gateway: Arc<ModelGateway>,
    compiler: Arc<PromptCompiler>,
    context_window: usize,
    max_output_tokens: u32,
}

impl ChatSessionManager {
    pub fn new(
        ledger: Arc<BudgetLedger>,
        gateway: Arc<ModelGateway>,
        compiler: Arc<PromptCompiler>,
        context_window: usize,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            ledger,
            gateway,
            compiler,
            context_window,
            max_output_tokens,
        }
    }

    pub async fn start_session(&self, user: &UserId, context: &str) -> SessionId {
        let id = SessionId(Uuid::new_v4().to_string());
        let session = ChatSession::new(id.clone(), user.clone(), context);
        let mut sessions = self.sessions.lock().await;
        sessions.insert(id.0.clone(), SessionSlot { session, busy: false });
        id
    }

    pub async fn send_message(
        &self,
        session_id: &SessionId,
        user: &UserId,
        text: &str,
        page_context: &str,
    ) -> Result<ChatStream, AiError> {
        // Phase 1, under the session lock: ownership and busy checks, then
        // the synchronous user-message append and a snapshot of the model
        // context window.
        let (session_context, window) = {
            let mut sessions = self.sessions.lock().await;
            let slot = sessions
                .get_mut(&session_id.0)
                .ok_or_else(|| AiError::not_found("chat session", &session_id.0))?;
            if slot.session.user_id != *user {
                return Err(AiError::Forbidden);
            }
            if slot.busy {
                return Err(AiError::Busy);
            }
            slot.busy = true;
            slot.session.append(ChatMessage::now(ChatRole::User, text));
            (
                slot.session.context.clone(),
                slot.session.recent_context(self.context_window).to_vec(),
            )
        };

        // Phase 2, off the lock: reserve, then open the stream. Any failure
        // here must clear the busy latch before surfacing.
        let result = self.open_message_stream(user, &session_context, page_context, &window).await;
        let (stream, reservation) = match result {
            Ok(opened) => opened,
            Err(error) => {
                release_slot(&self.sessions, session_id).await;
                return Err(error);
            }
        };

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(forward_stream(
            Arc::clone(&self.sessions),
            Arc::clone(&self.ledger),
            session_id.clone(),
            stream,
            reservation,
            tx,
        ));
        Ok(ChatStream { rx })
    }

    /// Full retained history, owner-checked. Unaffected by the context
    /// window truncation applied to upstream calls.
    pub async fn history(
        &self,
        session_id: &SessionId,
        user: &UserId,
    ) -> Result<Vec<ChatMessage>, AiError> {
        let sessions = self.sessions.lock().await;
        let slot = sessions
            .get(&session_id.0)
            .ok_or_else(|| AiError::not_found("chat session", &session_id.0))?;
        if slot.session.user_id != *user {
            return Err(AiError::Forbidden);
        }
        Ok(slot.session.messages.clone())
    }

    /// Terminal and destructive: the session and its history are gone.
    pub async fn clear_session(
        &self,
        session_id: &SessionId,
        user: &UserId,
    ) -> Result<(), AiError> {
        let mut sessions = self.sessions.lock().await;
        let slot = sessions
            .get(&session_id.0)
            .ok_or_else(|| AiError::not_found("chat session", &session_id.0))?;
        if slot.session.user_id != *user {
            return Err(AiError::Forbidden);
        }
        sessions.remove(&session_id.0);
        Ok(())
    }

    async fn open_message_stream(
        &self,
        user: &UserId,
        session_context: &str,
        page_context: &str,
        window: &[ChatMessage],
    ) -> Result<(GatewayStream, BudgetReservation), AiError> {
        let prompt = self
            .compiler
            .chat(page_context, session_context, window)
            .map_err(AiError::internal)?;

        let estimate = estimate_request_tokens(&prompt, self.max_output_tokens);
        let reservation = match self.ledger.reserve(user, estimate).await {
            ReserveOutcome::Allowed(reservation) => reservation,
            // Denied before any upstream call: no stream is ever opened.
            ReserveOutcome::Denied { remaining } => {
                return Err(AiError::BudgetExceeded { remaining })
            }
        };

        match self.gateway.open_stream(&prompt, self.max_output_tokens).await {
            Ok(stream) => Ok((stream, reservation)),
            Err(error) => {
                // Unrecoverable before the first delta: the estimate stays
                // charged per the anti-abuse policy.
                self.ledger.commit_failure(reservation).await;
                Err(error)
            }
        }
    }
}

async fn release_slot(sessions: &SessionMap, session_id: &SessionId) {
    let mut sessions = sessions.lock().await;
    if let Some(slot) = sessions.get_mut(&session_id.0) {
        slot.busy = false;
    }
}

/// Worker: forwards provider deltas to the caller and settles the session on
/// the terminal event. A failed send means the caller disconnected; partial
/// assistant text is discarded and the reserved estimate stays charged.
async fn forward_stream(
    sessions: SessionMap,
    ledger: Arc<BudgetLedger>,
    session_id: SessionId,
    mut stream: GatewayStream,
    reservation: BudgetReservation,
    tx: mpsc::Sender<ChatEvent>,
) {
    let mut assembled = String::new();
    loop {
        match stream.next_event().await {
            Ok(Some(StreamEvent::Delta(delta))) => {
                assembled.push_str(&delta);
                if tx.send(ChatEvent::Delta(delta)).await.is_err() {
                    ledger.commit_failure(reservation).await;
                    release_slot(&sessions, &session_id).await;
                    return;
                }
            }
            Ok(Some(StreamEvent::Done(usage))) => {
                {
                    let mut sessions = sessions.lock().await;
                    // The session may have been cleared mid-stream; clearing
                    // wins and the assistant text is dropped with it.
                    if let Some(slot) = sessions.get_mut(&session_id.0) {
                        slot.session
                            .append(ChatMessage::now(ChatRole::Assistant, assembled.clone()));
                        slot.busy = false;
                    }
                }
                ledger.commit(reservation, usage.total()).await;
                let _ = tx.send(ChatEvent::Completed { text: assembled, usage }).await;
                return;
            }
            Ok(None) => {
                ledger.commit_failure(reservation).await;
                release_slot(&sessions, &session_id).await;
                let _ = tx
                    .send(ChatEvent::Failed(AiError::UpstreamUnavailable(
                        "stream closed without a usage report".to_owned(),
                    )))
                    .await;
                return;
            }
            Err(error) => {
                ledger.commit_failure(reservation).await;
                release_slot(&sessions, &session_id).await;
                let _ = tx.send(ChatEvent::Failed(error)).await;
                return;
            }
        }
    }
}
