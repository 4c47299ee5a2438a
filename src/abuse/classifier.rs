//! External content classifier returning a binary SAFE/BLOCK verdict.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const MODERATION_PROMPT: &str = "You are a strict content moderator for an anonymous chat app. Your job is to keep conversations safe and respectful.

ANALYZE THE MESSAGE BELOW AND RESPOND WITH EXACTLY ONE WORD:

- SAFE - Normal, friendly conversation, appropriate language, casual chat
- BLOCK - ANY of the following:
  - Profanity, vulgar language, curse words
  - Sexual content, explicit language, inappropriate references
  - Harassment, threats, aggressive language
  - Hate speech, discriminatory language
  - Spam, nonsensical text, excessive repetition
  - Personal information requests (phone, address, etc.)
  - Inappropriate meeting suggestions

BE STRICT: When in doubt, choose BLOCK to keep users safe.
Respond with ONLY the word SAFE or BLOCK.

Message: ";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("classifier returned no text")]
    EmptyResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierVerdict {
    Safe,
    Block,
    /// Output was neither word. Callers treat this as a block.
    Unrecognized,
}

impl ClassifierVerdict {
    pub fn parse(response: &str) -> Self {
        let word = response.trim();
        if word.eq_ignore_ascii_case("SAFE") {
            ClassifierVerdict::Safe
        } else if word.eq_ignore_ascii_case("BLOCK") {
            ClassifierVerdict::Block
        } else {
            ClassifierVerdict::Unrecognized
        }
    }
}

#[async_trait]
pub trait ContentClassifier: Send + Sync {
    async fn classify(&self, message: &str) -> Result<ClassifierVerdict, ClassifierError>;
}

/// Gemini `generateContent` client.
pub struct GeminiClassifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .filter_map(|c| c.content)
            .flat_map(|c| c.parts)
            .find_map(|p| p.text)
    }
}

impl GeminiClassifier {
    pub fn new(api_key: String, model: &str) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(GeminiClassifier {
            client,
            endpoint: format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{model}:generateContent"
            ),
            api_key,
        })
    }
}

#[async_trait]
impl ContentClassifier for GeminiClassifier {
    async fn classify(&self, message: &str) -> Result<ClassifierVerdict, ClassifierError> {
        let body = json!({
            "contents": [{
                "parts": [{ "text": format!("{MODERATION_PROMPT}\"{message}\"") }]
            }]
        });

        let response: GenerateResponse = self
            .client
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = response.text().ok_or(ClassifierError::EmptyResponse)?;
        Ok(ClassifierVerdict::parse(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_words() {
        assert_eq!(ClassifierVerdict::parse("SAFE"), ClassifierVerdict::Safe);
        assert_eq!(ClassifierVerdict::parse(" safe\n"), ClassifierVerdict::Safe);
        assert_eq!(ClassifierVerdict::parse("BLOCK"), ClassifierVerdict::Block);
    }

    #[test]
    fn anything_else_is_unrecognized() {
        assert_eq!(ClassifierVerdict::parse("SAFE."), ClassifierVerdict::Unrecognized);
        assert_eq!(
            ClassifierVerdict::parse("I think it is fine"),
            ClassifierVerdict::Unrecognized
        );
        assert_eq!(ClassifierVerdict::parse(""), ClassifierVerdict::Unrecognized);
    }

    #[test]
    fn extracts_first_text_part() {
        let raw = r#"{"candidates":[{"content":{"parts":[{"text":"BLOCK"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.text().as_deref(), Some("BLOCK"));

        let empty: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.text(), None);
    }
}
