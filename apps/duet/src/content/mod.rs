//! Challenge text: the static deck plus optional generated questions and
//! reactions. Generation never blocks the game; every failure falls back.

use std::sync::Arc;

use async_trait::async_trait;
use duet_proto::{ChallengeKind, Intensity};
use thiserror::Error;
use tracing::warn;

mod chat;
mod deck;
mod gemini;

pub use chat::ChatGenerator;
pub use deck::QuestionDeck;
pub use gemini::GeminiGenerator;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    Status(reqwest::StatusCode),
    #[error("generator returned no text")]
    Empty,
    #[error("generator not configured: {0}")]
    NotConfigured(String),
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        kind: ChallengeKind,
        intensity: Intensity,
        keywords: Option<&str>,
    ) -> Result<String, GenerationError>;

    async fn react(
        &self,
        question: &str,
        answer: &str,
        kind: ChallengeKind,
    ) -> Result<String, GenerationError>;
}

#[derive(Clone, Default)]
pub struct QuestionSource {
    generator: Option<Arc<dyn TextGenerator>>,
}

impl QuestionSource {
    pub fn new(generator: Option<Arc<dyn TextGenerator>>) -> Self {
        Self { generator }
    }

    pub fn is_generative(&self) -> bool {
        self.generator.is_some()
    }

    /// A generated question when possible, a random deck entry otherwise.
    pub async fn suggest(
        &self,
        kind: ChallengeKind,
        intensity: Intensity,
        keywords: Option<&str>,
    ) -> String {
        if let Some(generator) = &self.generator {
            match generator.generate(kind, intensity, keywords).await {
                Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
                Ok(_) => warn!(target = "duet::content", "generator returned empty question"),
                Err(err) => warn!(target = "duet::content", error = %err, "question generation failed"),
            }
        }
        QuestionDeck::random(intensity, kind, &mut rand::thread_rng()).to_string()
    }

    pub async fn react(&self, question: &str, answer: &str, kind: ChallengeKind) -> Option<String> {
        let generator = self.generator.as_ref()?;
        match generator.react(question, answer, kind).await {
            Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            Ok(_) => None,
            Err(err) => {
                warn!(target = "duet::content", error = %err, "reaction generation failed");
                None
            }
        }
    }
}
