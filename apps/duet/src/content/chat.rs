use std::time::Duration;

use async_trait::async_trait;
use duet_proto::{ChallengeKind, Intensity};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::gemini::{question_prompt, reaction_prompt};
use super::{GenerationError, TextGenerator};

/// Question and reaction generation through any chat-completions endpoint
/// (`POST {base}/chat/completions`), for hosted or self-run models.
pub struct ChatGenerator {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    model: String,
}

impl ChatGenerator {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, GenerationError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| GenerationError::NotConfigured(format!("invalid chat url: {err}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
            model: model.into(),
        })
    }

    fn endpoint(&self) -> Result<Url, GenerationError> {
        self.base_url
            .join("chat/completions")
            .map_err(|err| GenerationError::NotConfigured(format!("invalid chat url: {err}")))
    }

    async fn complete(&self, prompt: String) -> Result<String, GenerationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user".into(),
                content: prompt,
            }],
        };
        let mut builder = self.client.post(self.endpoint()?).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(GenerationError::Status(response.status()));
        }
        let payload = response.json::<ChatResponse>().await?;
        let text = payload.first_text().ok_or(GenerationError::Empty)?;
        debug!(target = "duet::content", model = %self.model, chars = text.len(), "generated text");
        Ok(text)
    }
}

#[async_trait]
impl TextGenerator for ChatGenerator {
    async fn generate(
        &self,
        kind: ChallengeKind,
        intensity: Intensity,
        keywords: Option<&str>,
    ) -> Result<String, GenerationError> {
        self.complete(question_prompt(kind, intensity, keywords)).await
    }

    async fn react(
        &self,
        question: &str,
        answer: &str,
        kind: ChallengeKind,
    ) -> Result<String, GenerationError> {
        self.complete(reaction_prompt(question, answer, kind)).await
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ChatMessage>,
}

impl ChatResponse {
    fn first_text(&self) -> Option<String> {
        self.choices
            .iter()
            .filter_map(|choice| choice.message.as_ref())
            .map(|message| message.content.trim().trim_matches('"').trim())
            .find(|text| !text.is_empty())
            .map(str::to_string)
    }
}
