//! Client for OpenAI-compatible chat endpoints, used both as the content
//! classifier and as the image describer.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::LlmEndpoint;
use crate::models::BoundingBox;
use crate::pipeline::classify::{
    build_classification_prompt, sanitize_response, ClassificationError, ClassificationRequest,
    ClassifierBackend,
};
use crate::pipeline::extraction::{ExtractionError, VisionDescriber, VisionDescription};

const CLASSIFICATION_MAX_TOKENS: u32 = 1024;
const VISION_MAX_TOKENS: u32 = 8190;

const VISION_PROMPT: &str = r#"Analyze this image and reply with JSON only:
{
  "has_medical_image": true/false,
  "content": "description of the image",
  "image_bbox": {"x": 0.0-1.0, "y": 0.0-1.0, "width": 0.0-1.0, "height": 0.0-1.0}
}

Rules:
1. has_medical_image is true only when the picture contains actual medical imaging
   (CT, MRI, X-ray, ultrasound, pathology slide, endoscopy). Screenshots of text
   reports or lab sheets are false.
2. content transcribes medical material only, as markdown. Include visible text,
   dates and findings; leave out clinician names. Leave it empty for unrelated images.
3. image_bbox is only given when has_medical_image is true. x and y are the center
   of the imaging region, width and height its share of the whole picture, all
   normalized to 0..1. Use {"x": 0.5, "y": 0.5, "width": 1.0, "height": 1.0} when the
   whole picture is the scan."#;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Cannot reach {0}")]
    Connection(String),

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Response contained no message content")]
    EmptyChoice,

    #[error("Response parsing error: {0}")]
    Parse(String),

    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<LlmError> for ClassificationError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Timeout { secs } => ClassificationError::Timeout { secs },
            LlmError::EmptyChoice => ClassificationError::EmptyResponse,
            other => ClassificationError::Transport(other.to_string()),
        }
    }
}

impl From<LlmError> for ExtractionError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Timeout { secs } => ExtractionError::VisionTimeout { secs },
            other => ExtractionError::Vision(other.to_string()),
        }
    }
}

/// Request body for `/chat/completions`
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a MessageContent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Response body from `/chat/completions`
#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// JSON mode is only requested from model families known to accept it.
fn supports_json_mode(model: &str) -> bool {
    model.contains("Qwen") || model.to_lowercase().contains("gpt-")
}

/// HTTP client for one OpenAI-compatible endpoint.
pub struct OpenAiCompatClient {
    endpoint: LlmEndpoint,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl OpenAiCompatClient {
    pub fn new(endpoint: LlmEndpoint, timeout: Duration) -> Result<Self, LlmError> {
        if endpoint.models.is_empty() {
            return Err(LlmError::Config(format!(
                "no models configured for {}",
                endpoint.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            endpoint,
            client,
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Try every key (shuffled) with every model (in order) until one answers.
    async fn chat(&self, content: MessageContent, max_tokens: u32) -> Result<String, LlmError> {
        let keys = {
            let mut keys = self.endpoint.api_keys.clone();
            keys.shuffle(&mut rand::thread_rng());
            keys
        };

        let mut last_error = LlmError::Config("no API keys configured".into());
        for (key_index, key) in keys.iter().enumerate() {
            for model in &self.endpoint.models {
                match self.send(key, model, &content, max_tokens).await {
                    Ok(text) => {
                        tracing::debug!(model = %model, key_index, "Chat completion succeeded");
                        return Ok(text);
                    }
                    Err(e) => {
                        tracing::warn!(model = %model, key_index, error = %e, "Chat completion failed");
                        last_error = e;
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn send(
        &self,
        api_key: &str,
        model: &str,
        content: &MessageContent,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.endpoint.base_url);
        let body = build_request(model, content, max_tokens);

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    LlmError::Connection(self.endpoint.base_url.clone())
                } else if e.is_timeout() {
                    LlmError::Timeout {
                        secs: self.timeout_secs,
                    }
                } else {
                    LlmError::Connection(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        first_content(parsed)
    }
}

fn build_request<'a>(model: &'a str, content: &'a MessageContent, max_tokens: u32) -> ChatRequest<'a> {
    ChatRequest {
        model,
        messages: vec![ChatMessage {
            role: "user",
            content,
        }],
        temperature: 0.1,
        max_tokens,
        response_format: supports_json_mode(model).then_some(ResponseFormat {
            kind: "json_object",
        }),
    }
}

fn first_content(response: ChatResponse) -> Result<String, LlmError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or(LlmError::EmptyChoice)
}

#[async_trait]
impl ClassifierBackend for OpenAiCompatClient {
    async fn classify(&self, request: &ClassificationRequest) -> Result<String, ClassificationError> {
        let prompt = build_classification_prompt(request);
        Ok(self
            .chat(MessageContent::Text(prompt), CLASSIFICATION_MAX_TOKENS)
            .await?)
    }
}

#[async_trait]
impl VisionDescriber for OpenAiCompatClient {
    async fn describe(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<VisionDescription, ExtractionError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image);
        let content = MessageContent::Parts(vec![
            ContentPart::Text {
                text: VISION_PROMPT.to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime_type};base64,{encoded}"),
                },
            },
        ]);
        let raw = self.chat(content, VISION_MAX_TOKENS).await?;
        Ok(parse_vision_response(&raw))
    }
}

#[derive(Deserialize)]
struct VisionReply {
    #[serde(default)]
    has_medical_image: bool,
    #[serde(default)]
    content: String,
    image_bbox: Option<BoundingBox>,
}

/// Interpret a vision reply. Replies that are not the requested JSON are
/// kept as a plain description without a region.
pub fn parse_vision_response(raw: &str) -> VisionDescription {
    let cleaned = sanitize_response(raw);
    match serde_json::from_str::<VisionReply>(&cleaned) {
        Ok(reply) => VisionDescription {
            has_notable_content: reply.has_medical_image,
            description: sanitize_response(&reply.content),
            bounding_box: reply.image_bbox.filter(|_| reply.has_medical_image),
        },
        Err(e) => {
            tracing::debug!(error = %e, "Vision reply is not JSON, keeping raw text");
            VisionDescription {
                has_notable_content: false,
                description: cleaned,
                bounding_box: None,
            }
        }
    }
}
