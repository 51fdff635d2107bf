use super::ScoreResult;
use crate::config::Config;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const MAX_SCORE: f64 = 10.0;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("JSON parsing failed: {0}")]
    JsonParsing(#[from] serde_json::Error),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Rate limited")]
    RateLimited,
    #[error("Classifier credentials are not configured")]
    MissingCredentials,
}

/// Scores attraction names against a user's interests.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// False when calling `classify` would be pointless, e.g. no credentials.
    fn is_configured(&self) -> bool;

    async fn classify(
        &self,
        names: &[String],
        interests: &[String],
    ) -> Result<Vec<ScoreResult>, ClassifierError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct OpenRouterClassifier {
    client: Client,
    config: Config,
}

impl OpenRouterClassifier {
    pub fn new(config: Config) -> Result<Self, ClassifierError> {
        let client = Client::builder()
            .user_agent("AttractionDiscovery/1.0")
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self { client, config })
    }

    async fn chat_completion(&self, api_key: &str, prompt: &str) -> Result<String, ClassifierError> {
        let request = ChatRequest {
            model: self.config.or_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "You rate how interesting places are for a traveller. Answer with JSON only.".to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: 1500,
            temperature: 0.2,
            stream: false,
        };

        let response = self
            .client
            .post(&self.config.openrouter_base_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::OK => {
                let chat_response: ChatResponse = response.json().await?;
                chat_response
                    .choices
                    .into_iter()
                    .next()
                    .map(|choice| choice.message.content)
                    .ok_or_else(|| ClassifierError::ApiError("No response choices".to_string()))
            }
            reqwest::StatusCode::TOO_MANY_REQUESTS => Err(ClassifierError::RateLimited),
            status => {
                let error_text = response.text().await.unwrap_or_default();
                Err(ClassifierError::ApiError(format!("HTTP {}: {}", status, error_text)))
            }
        }
    }
}

#[async_trait]
impl Classifier for OpenRouterClassifier {
    fn is_configured(&self) -> bool {
        self.config.openrouter_api_key.is_some()
    }

    async fn classify(
        &self,
        names: &[String],
        interests: &[String],
    ) -> Result<Vec<ScoreResult>, ClassifierError> {
        let api_key = self
            .config
            .openrouter_api_key
            .as_deref()
            .ok_or(ClassifierError::MissingCredentials)?;

        let prompt = build_classification_prompt(names, interests);
        let response = self.chat_completion(api_key, &prompt).await?;
        parse_scores(&response)
    }
}

pub fn build_classification_prompt(names: &[String], interests: &[String]) -> String {
    let mut prompt = format!(
        "The user is interested in: {}.\n\nRate each of these places from 0 to 10 for how well it matches those interests:\n",
        interests.join(", ")
    );

    for name in names {
        prompt.push_str(&format!("- {}\n", name));
    }

    prompt.push_str(
        "\nRespond with a JSON array only, one object per place, using the place name exactly as written:\n\
         [{\"name\": \"<place>\", \"score\": <0-10>, \"reason\": \"<one short sentence>\"}]",
    );

    prompt
}

/// Pulls the JSON array out of a chat reply, tolerating prose or code fences
/// around it. Scores are clamped to 0..=10.
pub fn parse_scores(response: &str) -> Result<Vec<ScoreResult>, ClassifierError> {
    let start = response.find('[');
    let end = response.rfind(']');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &response[start..=end],
        _ => {
            return Err(ClassifierError::ApiError(
                "Classifier reply contained no JSON array".to_string(),
            ))
        }
    };

    let mut scores: Vec<ScoreResult> = serde_json::from_str(body)?;
    for score in scores.iter_mut() {
        score.score = if score.score.is_nan() {
            0.0
        } else {
            score.score.clamp(0.0, MAX_SCORE)
        };
    }
    Ok(scores)
}
