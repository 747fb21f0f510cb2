//! Conversational assistant.
//!
//! Small talk gets canned replies, questions about the user's own records go
//! to [`records`], and everything else is answered by the completion model
//! over passages retrieved from the [`knowledge`] base.

pub mod knowledge;
pub mod llm;
pub mod records;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use rusqlite::Connection;
use serde::Serialize;

use crate::config::AssistantConfig;
use crate::embedding::EmbeddingProvider;
use knowledge::{KnowledgeHit, RetrievalParams};
use llm::CompletionModel;

pub const GREETING_REPLY: &str = "Hello! I'm MediMimes, I specialize in medication information and health guidance. How can I help you today?";
pub const THANKS_REPLY: &str =
    "You're welcome! Is there anything else about medications you'd like to know?";
pub const IDENTITY_REPLY: &str = "I'm MediMimes, your AI medical assistant! I can help with medication questions, side effects, missed doses, and drug interactions.";

const SYSTEM_PROMPT: &str = "You are MediMimes, a careful medication assistant. \
Answer using the provided context. If the context does not contain the answer, \
say you don't know and suggest consulting a pharmacist or doctor. Keep answers short.";

const GREETINGS: [&str; 5] = ["hi", "hello", "hey", "hi there", "hello there"];
const PERSONAL_WORDS: [&str; 5] = ["my", "i", "me", "am", "mine"];
const RECORD_WORDS: [&str; 13] = [
    "dose", "doses", "medication", "medications", "medicine", "medicines", "pills",
    "prescription", "schedule", "missed", "history", "log", "taking",
];
/// Phrasings that ask for advice, even when they mention "I".
const ADVICE_PHRASES: [&str; 6] = [
    "what should",
    "what happens",
    "what to do",
    "should i",
    "can i",
    "is it safe",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Greeting,
    Thanks,
    Identity,
    Records,
    Knowledge,
}

/// Decide which responder handles `message`.
pub fn route(message: &str) -> Route {
    let lower = message.trim().to_lowercase();
    let bare = lower.trim_end_matches(['!', '.', '?', ' ']);

    if GREETINGS.contains(&bare) {
        return Route::Greeting;
    }
    if lower.contains("thank") {
        return Route::Thanks;
    }
    if lower.contains("who are you") || lower.contains("what are you") {
        return Route::Identity;
    }
    if ADVICE_PHRASES.iter().any(|p| lower.contains(p)) {
        return Route::Knowledge;
    }

    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let personal = words.iter().any(|w| PERSONAL_WORDS.contains(w));
    let about_records = words.iter().any(|w| RECORD_WORDS.contains(w))
        || lower.contains("last dose")
        || lower.contains("when was");
    if personal && about_records {
        Route::Records
    } else {
        Route::Knowledge
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub response: String,
    pub route: Route,
    /// Knowledge sources the answer drew on.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

impl ChatReply {
    fn plain(route: Route, response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            route,
            sources: Vec::new(),
        }
    }
}

pub struct Assistant {
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn CompletionModel>,
    retrieval: RetrievalParams,
}

impl Assistant {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn CompletionModel>,
        config: &AssistantConfig,
    ) -> Self {
        Self {
            embedder,
            model,
            retrieval: RetrievalParams::from(config),
        }
    }

    /// Answer `message` for `user_id`. Failures become the reply text.
    pub async fn reply(
        &self,
        db: &Arc<Mutex<Connection>>,
        user_id: i64,
        message: &str,
        now: NaiveDateTime,
    ) -> ChatReply {
        let route = route(message);
        let outcome = match route {
            Route::Greeting => return ChatReply::plain(route, GREETING_REPLY),
            Route::Thanks => return ChatReply::plain(route, THANKS_REPLY),
            Route::Identity => return ChatReply::plain(route, IDENTITY_REPLY),
            Route::Records => self.answer_from_records(db, user_id, message, now).await,
            Route::Knowledge => self.answer_from_knowledge(db, message).await,
        };

        match outcome {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, ?route, user_id, "assistant failed");
                ChatReply::plain(route, format!("Oops! Something went wrong: {e}"))
            }
        }
    }

    async fn answer_from_records(
        &self,
        db: &Arc<Mutex<Connection>>,
        user_id: i64,
        message: &str,
        now: NaiveDateTime,
    ) -> Result<ChatReply> {
        let db = Arc::clone(db);
        let question = message.to_string();
        let text = tokio::task::spawn_blocking(move || -> Result<String> {
            let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            Ok(records::answer(&conn, user_id, &question, now)?)
        })
        .await??;
        Ok(ChatReply::plain(Route::Records, text))
    }

    /// Passages for `question`, embedding and searching off the async runtime.
    pub async fn retrieve(
        &self,
        db: &Arc<Mutex<Connection>>,
        question: &str,
    ) -> Result<Vec<KnowledgeHit>> {
        let db = Arc::clone(db);
        let embedder = Arc::clone(&self.embedder);
        let params = self.retrieval;
        let question = question.to_string();
        tokio::task::spawn_blocking(move || -> Result<Vec<KnowledgeHit>> {
            let query_vec = embedder.embed(&question)?;
            let conn = db.lock().map_err(|e| anyhow!("db lock poisoned: {e}"))?;
            knowledge::search(&conn, &query_vec, &question, &params)
        })
        .await?
    }

    async fn answer_from_knowledge(
        &self,
        db: &Arc<Mutex<Connection>>,
        message: &str,
    ) -> Result<ChatReply> {
        let hits = self.retrieve(db, message).await?;
        let prompt = build_prompt(&hits, message);
        let answer = self.model.complete(SYSTEM_PROMPT, &prompt).await?;

        let mut sources: Vec<String> = hits.into_iter().map(|h| h.source).collect();
        sources.dedup();
        Ok(ChatReply {
            response: answer,
            route: Route::Knowledge,
            sources,
        })
    }
}

/// Stuff the retrieved passages ahead of the question.
pub fn build_prompt(hits: &[KnowledgeHit], question: &str) -> String {
    let context = if hits.is_empty() {
        "(no matching reference material)".to_string()
    } else {
        hits.iter()
            .map(|h| h.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    format!("Context:\n{context}\n\nQuestion: {}\nAnswer:", question.trim())
}
