//! Text generation behind a trait, with a Gemini implementation over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

pub const SYSTEM_INSTRUCTION: &str = r#"You are "IdeaSpark", an advanced AI assistant embedded in a chat application. Your primary purpose is to help users brainstorm, develop, and flesh out their project ideas. Engage in a detailed, natural conversation.

Based on the ongoing conversation and the user's messages, your goal is to:
1.  Understand the user's core problem, interest, or nascent idea.
2.  Ask clarifying questions to help them elaborate on key aspects.
3.  Guide them to think about:
    *   The problem they are trying to solve.
    *   The target audience for their idea.
    *   Potential core features and their benefits.
    *   Possible challenges they might face.
    *   Actionable next steps to move the idea forward.
4.  If the user mentions technologies they know or want to use (e.g., "I just finished learning Python, what project can I build?"), incorporate that into your suggestions.
5.  Once you have a good understanding and enough details have been discussed, provide a comprehensive textual summary of the idea. This summary should be detailed and cover the aspects discussed (problem, audience, features, etc.). It should be presented as a coherent narrative or a structured text block.

Remember:
- Use the provided conversation history to maintain context and avoid repetition.
- Your tone should be supportive, encouraging, and inquisitive.
- Do not explicitly ask "What is the problem solved?" or "Who is the target audience?". Instead, weave these explorations into the natural flow of conversation. For example, if a user says "I want to build an app for students", you might ask "That's interesting! What specific challenges do students face that this app could help with?"
- Conclude your response with the detailed idea summary when appropriate."#;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const ERROR_BODY_CHARS: usize = 500;

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation timed out")]
    Timeout,
    #[error("provider returned no text")]
    Empty,
    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("malformed provider response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_instruction: String,
    pub turns: Vec<ChatTurn>,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl GenerationRequest {
    /// A request with the assistant's instruction and sampling settings.
    pub fn new(turns: Vec<ChatTurn>) -> Self {
        Self {
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            turns,
            temperature: 0.7,
            top_k: 1,
            top_p: 1.0,
            max_output_tokens: 2048,
        }
    }
}

#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;

    fn model_name(&self) -> &str;
}

pub struct GeminiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Result<Self, GenerationError> {
        Ok(Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()?,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            model: model.into(),
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl GenerationProvider for GeminiClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| GenerationError::Provider("GEMINI_API_KEY is not configured".into()))?;

        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", api_key)
            .json(&request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(provider_failure(status, &body));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GenerationError::Malformed(e.to_string()))?;
        extract_text(&body)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn request_body(request: &GenerationRequest) -> Value {
    let contents: Vec<Value> = request
        .turns
        .iter()
        .map(|t| json!({ "role": t.role, "parts": [{ "text": t.text }] }))
        .collect();
    let safety: Vec<Value> = SAFETY_CATEGORIES
        .iter()
        .map(|c| json!({ "category": c, "threshold": "BLOCK_MEDIUM_AND_ABOVE" }))
        .collect();

    json!({
        "systemInstruction": { "parts": [{ "text": request.system_instruction }] },
        "contents": contents,
        "generationConfig": {
            "temperature": request.temperature,
            "topK": request.top_k,
            "topP": request.top_p,
            "maxOutputTokens": request.max_output_tokens,
        },
        "safetySettings": safety,
    })
}

/// Non-2xx answer, keeping at most the first 500 characters of the body.
fn provider_failure(status: reqwest::StatusCode, body: &str) -> GenerationError {
    let excerpt: String = body.chars().take(ERROR_BODY_CHARS).collect();
    GenerationError::Provider(format!("{}: {}", status, excerpt))
}

/// Text of the first part of the first candidate, trimmed.
fn extract_text(body: &Value) -> Result<String, GenerationError> {
    if let Some(error) = body.get("error") {
        return Err(GenerationError::Provider(error.to_string()));
    }
    let candidates = body
        .get("candidates")
        .and_then(Value::as_array)
        .ok_or_else(|| GenerationError::Malformed("no candidates".into()))?;
    let Some(first) = candidates.first() else {
        return Err(GenerationError::Empty);
    };
    let text = first["content"]["parts"][0]["text"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(GenerationError::Empty);
    }
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_instruction_turns_and_settings() {
        let request = GenerationRequest::new(vec![
            ChatTurn {
                role: Role::User,
                text: "hi".into(),
            },
            ChatTurn {
                role: Role::Model,
                text: "hello".into(),
            },
        ]);
        let body = request_body(&request);
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(body["generationConfig"]["topK"], 1);
        assert_eq!(body["safetySettings"].as_array().unwrap().len(), 4);
        assert!(
            body["systemInstruction"]["parts"][0]["text"]
                .as_str()
                .unwrap()
                .contains("IdeaSpark")
        );
    }

    #[test]
    fn extracts_first_candidate_text() {
        let body = json!({
            "candidates": [{ "content": { "parts": [{ "text": "  Here's an idea...  " }] } }]
        });
        assert_eq!(extract_text(&body).unwrap(), "Here's an idea...");
    }

    #[test]
    fn blank_and_blocked_responses_are_empty() {
        let blank = json!({ "candidates": [{ "content": { "parts": [{ "text": "   " }] } }] });
        assert!(matches!(extract_text(&blank), Err(GenerationError::Empty)));

        let blocked = json!({ "candidates": [{ "finishReason": "SAFETY" }] });
        assert!(matches!(extract_text(&blocked), Err(GenerationError::Empty)));

        let none = json!({ "candidates": [] });
        assert!(matches!(extract_text(&none), Err(GenerationError::Empty)));
    }

    #[test]
    fn unexpected_shapes_are_malformed_or_provider_errors() {
        assert!(matches!(
            extract_text(&json!({ "promptFeedback": {} })),
            Err(GenerationError::Malformed(_))
        ));
        assert!(matches!(
            extract_text(&json!({ "error": { "code": 400 } })),
            Err(GenerationError::Provider(_))
        ));
    }

    #[test]
    fn error_bodies_are_cut_on_char_boundaries() {
        let body = "\u{20ac}".repeat(400);
        let err = provider_failure(reqwest::StatusCode::SERVICE_UNAVAILABLE, &body);
        let GenerationError::Provider(detail) = err else {
            panic!("expected a provider error");
        };
        assert!(detail.starts_with("503 Service Unavailable: "));
        assert_eq!(detail.chars().filter(|c| *c == '\u{20ac}').count(), 400);

        let long = "\u{20ac}".repeat(600);
        let GenerationError::Provider(detail) =
            provider_failure(reqwest::StatusCode::BAD_GATEWAY, &long)
        else {
            panic!("expected a provider error");
        };
        assert_eq!(detail.chars().filter(|c| *c == '\u{20ac}').count(), 500);
    }

    #[tokio::test]
    async fn multibyte_error_response_is_a_provider_error() {
        use axum::{Router, http::StatusCode, routing::post};

        let app = Router::new().route(
            "/models/{model}",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "\u{20ac}".repeat(400)) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = GeminiClient::new(Some("key".into()), "gemini-1.5-flash")
            .unwrap()
            .with_base_url(format!("http://{}", addr));
        let err = client
            .generate(&GenerationRequest::new(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Provider(ref d) if d.starts_with("503")));
    }

    #[tokio::test]
    async fn missing_key_is_a_provider_error() {
        let client = GeminiClient::new(None, "gemini-1.5-flash").unwrap();
        let err = client
            .generate(&GenerationRequest::new(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Provider(_)));
    }
}
