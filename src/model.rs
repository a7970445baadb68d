use std::collections::VecDeque;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::utils::{GeminiConfig, ImageInput, SafetySetting};

const COLLABORATOR: &str = "generative model";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Returns the model's raw text reply.
    async fn generate(&self, prompt: &str, images: &[ImageInput]) -> Result<String>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    safety_settings: Vec<&'a SafetySetting>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Tool {
    GoogleSearch {},
}

#[derive(Serialize)]
struct RequestContent<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum RequestPart<'a> {
    Text(&'a str),
    InlineData(InlineData),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    top_p: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Result<String> {
        if let Some(reason) = self.prompt_feedback.and_then(|feedback| feedback.block_reason) {
            return Err(AppError::upstream(
                COLLABORATOR,
                format!("prompt blocked: {}", reason),
            ));
        }

        let text: String = self
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(AppError::upstream(COLLABORATOR, "empty response"));
        }
        Ok(text)
    }
}

/// Gemini `generateContent` with the prompt followed by inline image parts.
pub struct GeminiModel {
    http: Client,
    config: GeminiConfig,
}

impl GeminiModel {
    pub fn new(http: Client, config: GeminiConfig) -> Self {
        Self { http, config }
    }

    fn request<'a>(&'a self, prompt: &'a str, images: &[ImageInput]) -> GenerateRequest<'a> {
        let mut parts = vec![RequestPart::Text(prompt)];
        parts.extend(images.iter().map(|image| {
            RequestPart::InlineData(InlineData {
                mime_type: image.content_type.to_string(),
                data: general_purpose::STANDARD.encode(&image.bytes),
            })
        }));

        let mut tools = Vec::new();
        if self.config.google_search {
            tools.push(Tool::GoogleSearch {});
        }

        GenerateRequest {
            system_instruction: self.config.system_instruction.as_deref().map(|text| {
                SystemInstruction {
                    parts: vec![RequestPart::Text(text)],
                }
            }),
            contents: vec![RequestContent {
                role: "user",
                parts,
            }],
            generation_config: GenerationConfig {
                max_output_tokens: self.config.max_output_tokens,
                top_p: self.config.top_p,
            },
            safety_settings: self.config.safety_settings.iter().collect(),
            tools,
        }
    }
}

#[async_trait]
impl GenerativeModel for GeminiModel {
    async fn generate(&self, prompt: &str, images: &[ImageInput]) -> Result<String> {
        let url = format!(
            "{}/models/{}:generateContent",
            GEMINI_BASE_URL, self.config.model
        );

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&self.request(prompt, images))
            .send()
            .await
            .map_err(|err| AppError::upstream(COLLABORATOR, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::upstream(
                COLLABORATOR,
                format!("generateContent returned {}: {}", status, body),
            ));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| AppError::upstream(COLLABORATOR, err))?;
        body.into_text()
    }
}

/// Replays queued replies in order and records every prompt it receives.
#[derive(Default)]
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().push_back(reply.into());
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl GenerativeModel for ScriptedModel {
    async fn generate(&self, prompt: &str, _images: &[ImageInput]) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| AppError::upstream(COLLABORATOR, "no scripted reply left"))
    }
}
