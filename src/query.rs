//! Conversation log for one document.
//!
//! Questions are strictly serialized: `ask` appends the user message and
//! raises `pending` in one critical section, and the spawned dispatch
//! appends the reply and clears `pending` in another.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::models::Message;
use crate::services::{QueryReply, QueryService, ServiceError};
use crate::transfer::lock;

pub const NO_ANSWER: &str = "No answer received.";
pub const QUERY_FAILED: &str = "Something went wrong. Please try again later.";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("Question is empty")]
    EmptyQuestion,
    #[error("A question is already awaiting an answer")]
    SessionBusy,
    #[error("No async runtime to dispatch the question on")]
    NoRuntime,
}

impl Serialize for QueryError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AskOutcome {
    Answered,
    AnsweredWithSources,
    NoAnswer,
    Failed,
}

fn greeting(document_context: Option<&str>) -> String {
    match document_context {
        Some(title) => format!(
            "Hello! I'm your patent assistant. I'm here to answer questions about \"{}\". What would you like to know?",
            title
        ),
        None => "Hello! I'm your patent assistant. Please upload a patent document first, or ask me general questions about patents and intellectual property.".to_string(),
    }
}

/// Turn a service result into the assistant messages to append.
fn resolve(result: Result<QueryReply, ServiceError>) -> (AskOutcome, Vec<Message>) {
    let reply = match result {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "query failed");
            return (AskOutcome::Failed, vec![Message::assistant(QUERY_FAILED)]);
        }
    };

    match reply.answer.filter(|a| !a.is_empty()) {
        None => (AskOutcome::NoAnswer, vec![Message::assistant(NO_ANSWER)]),
        Some(answer) => {
            let mut messages = vec![Message::assistant(answer)];
            match reply.sources.filter(|s| !s.is_empty()) {
                Some(sources) => {
                    messages.push(Message::sources(sources));
                    (AskOutcome::AnsweredWithSources, messages)
                }
                None => (AskOutcome::Answered, messages),
            }
        }
    }
}

#[derive(Debug)]
struct QueryState {
    messages: Vec<Message>,
    pending: bool,
}

/// An accepted question whose answer is still on its way. Dropping it does
/// not abandon the question; the log is updated either way.
#[derive(Debug)]
pub struct PendingAnswer {
    question: Message,
    task: JoinHandle<AskOutcome>,
}

impl PendingAnswer {
    /// The user message that was appended for this question.
    pub fn question(&self) -> &Message {
        &self.question
    }

    pub async fn outcome(self) -> AskOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(question = %self.question.id, error = %e, "query task did not finish");
                AskOutcome::Failed
            }
        }
    }
}

#[derive(Clone)]
pub struct QuerySession {
    service: Arc<dyn QueryService>,
    document_context: Option<String>,
    state: Arc<Mutex<QueryState>>,
}

impl QuerySession {
    /// Start a session, seeding the log with the assistant greeting.
    pub fn initialize(service: Arc<dyn QueryService>, document_context: Option<String>) -> Self {
        let document_context = document_context.filter(|c| !c.trim().is_empty());
        let seed = Message::assistant(greeting(document_context.as_deref()));
        info!(context = ?document_context, "query session initialized");
        Self {
            service,
            document_context,
            state: Arc::new(Mutex::new(QueryState {
                messages: vec![seed],
                pending: false,
            })),
        }
    }

    pub fn document_context(&self) -> Option<&str> {
        self.document_context.as_deref()
    }

    pub fn history(&self) -> Vec<Message> {
        lock(&self.state).messages.clone()
    }

    /// Never zero: the greeting is always the first entry.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        lock(&self.state).messages.len()
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending
    }

    /// Append the question and dispatch it. The user message is in the log
    /// by the time this returns. Fails with `NoRuntime`, leaving the log
    /// alone, when called outside a tokio runtime.
    pub fn ask(&self, question: &str) -> Result<PendingAnswer, QueryError> {
        if question.trim().is_empty() {
            return Err(QueryError::EmptyQuestion);
        }
        let runtime = Handle::try_current().map_err(|_| QueryError::NoRuntime)?;

        let user = {
            let mut state = lock(&self.state);
            if state.pending {
                return Err(QueryError::SessionBusy);
            }
            let user = Message::user(question);
            state.messages.push(user.clone());
            state.pending = true;
            user
        };
        debug!(id = %user.id, "question dispatched");

        let session = self.clone();
        let text = question.to_string();
        let task = runtime.spawn(async move {
            // A panicking service still resolves to the failure message.
            let service = session.service.clone();
            let result = match tokio::spawn(async move { service.query(&text).await }).await {
                Ok(result) => result,
                Err(e) => Err(ServiceError::from(e)),
            };
            let (outcome, replies) = resolve(result);

            let mut state = lock(&session.state);
            state.messages.extend(replies);
            state.pending = false;
            info!(?outcome, messages = state.messages.len(), "question resolved");
            outcome
        });

        Ok(PendingAnswer {
            question: user,
            task,
        })
    }
}
