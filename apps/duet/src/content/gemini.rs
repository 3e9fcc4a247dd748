use std::time::Duration;

use async_trait::async_trait;
use duet_proto::{ChallengeKind, Intensity};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{GenerationError, TextGenerator};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models/";

/// Question and reaction generation backed by the Gemini REST API.
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiGenerator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    fn endpoint(&self) -> Result<Url, GenerationError> {
        let mut url = Url::parse(API_BASE)
            .and_then(|base| base.join(&format!("./{}:generateContent", self.model)))
            .map_err(|err| GenerationError::NotConfigured(format!("invalid model endpoint: {err}")))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    async fn complete(&self, prompt: String) -> Result<String, GenerationError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: prompt }],
            }],
        };
        let response = self.client.post(self.endpoint()?).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(GenerationError::Status(response.status()));
        }
        let payload = response.json::<GenerateResponse>().await?;
        let text = payload.first_text().ok_or(GenerationError::Empty)?;
        debug!(target = "duet::content", model = %self.model, chars = text.len(), "generated text");
        Ok(text)
    }
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
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

pub(crate) fn question_prompt(kind: ChallengeKind, intensity: Intensity, keywords: Option<&str>) -> String {
    let themes = keywords
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| format!(" Work in these themes: \"{k}\". If they are not in English, answer in their language."))
        .unwrap_or_default();
    format!(
        "Write one original {kind} prompt for two partners playing a truth-or-dare game. \
         Intensity: {label}.{themes}\n\
         Levels: Friendly is light and playful; Romantic is heartfelt and about shared dreams; \
         Hot is flirty and teasing; Very Hot is bold and intimate.\n\
         Reply with the prompt only, no quotes, at most 25 words.",
        label = intensity.label(),
    )
}

pub(crate) fn reaction_prompt(question: &str, answer: &str, kind: ChallengeKind) -> String {
    format!(
        "Two partners are playing truth or dare. The {kind} was: \"{question}\". \
         The reply was: \"{answer}\". As a light-hearted game host, react in at most 12 words. \
         Be warm, a little cheeky when the mood is romantic or spicy."
    )
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GenerateResponse {
    fn first_text(&self) -> Option<String> {
        self.candidates
            .iter()
            .filter_map(|candidate| candidate.content.as_ref())
            .flat_map(|content| content.parts.iter())
            .map(|part| part.text.trim().trim_matches('"').trim())
            .find(|text| !text.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_non_empty_candidate_text() {
        let payload: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"  "}]}},{"content":{"parts":[{"text":"\"Tell me a secret.\"\n"}]}}]}"#,
        )
        .expect("decode");
        assert_eq!(payload.first_text().as_deref(), Some("Tell me a secret."));
    }

    #[test]
    fn empty_response_has_no_text() {
        let payload: GenerateResponse = serde_json::from_str(r#"{"candidates":[]}"#).expect("decode");
        assert!(payload.first_text().is_none());
        let payload: GenerateResponse = serde_json::from_str("{}").expect("decode");
        assert!(payload.first_text().is_none());
    }

    #[test]
    fn prompts_carry_kind_level_and_keywords() {
        let prompt = question_prompt(ChallengeKind::Dare, Intensity::VeryHot, Some(" picnic "));
        assert!(prompt.contains("dare"));
        assert!(prompt.contains("Intensity: Very Hot"));
        assert!(prompt.contains("\"picnic\""));
        assert!(!question_prompt(ChallengeKind::Truth, Intensity::Friendly, Some("")).contains("themes"));

        let reaction = reaction_prompt("Sing a song", "La la la", ChallengeKind::Dare);
        assert!(reaction.contains("Sing a song") && reaction.contains("La la la"));
    }

    #[test]
    fn endpoint_includes_model_and_key() {
        let generator = GeminiGenerator::new("secret", "gemini-2.0-flash").expect("client");
        let url = generator.endpoint().expect("url");
        assert!(url.path().ends_with("/models/gemini-2.0-flash:generateContent"));
        assert_eq!(url.query(), Some("key=secret"));
    }
}
