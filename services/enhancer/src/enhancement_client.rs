//! Client for the remote AI image enhancement API.
//!
//! One call sends one image together with a fixed instruction to a Gemini
//! `generateContent` endpoint and returns the first image part of the reply.
//! Calls are never retried here; every retry is a fresh, explicit call.

use crate::config::EnhancementConfig;
use crate::status::EnhancedImage;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Environment variables consulted when no key is configured, in order
const CREDENTIAL_ENV_VARS: &[&str] = &["API_KEY", "GEMINI_API_KEY"];
const USER_AGENT: &str = concat!("enhancer-service/", env!("CARGO_PKG_VERSION"));

/// Enhancement errors. Every variant reads as an "enhancement failed" message.
#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("Enhancement failed: API key is not configured (set ENHANCER__ENHANCEMENT__API_KEY or API_KEY)")]
    MissingCredential,

    #[error("Enhancement failed: could not build HTTP client: {0}")]
    Client(String),

    #[error("Enhancement failed: network error: {0}")]
    Network(String),

    #[error("Enhancement failed: service returned {0}: {1}")]
    Api(u16, String),

    #[error("Enhancement failed: unreadable response: {0}")]
    Parse(String),

    #[error("Enhancement failed: no image data in response ({0})")]
    NoImage(String),

    #[error("Enhancement failed: invalid image data: {0}")]
    Decode(String),
}

impl EnhanceError {
    /// Configuration problems are detected before any request is made
    pub fn is_configuration(&self) -> bool {
        matches!(self, EnhanceError::MissingCredential | EnhanceError::Client(_))
    }
}

/// Something that can turn one image into an enhanced one
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageEnhancer: Send + Sync {
    /// Check preconditions without contacting the service.
    fn check_ready(&self) -> Result<(), EnhanceError>;

    /// Enhance a single image.
    async fn enhance(&self, image: &[u8], media_type: &str) -> Result<EnhancedImage, EnhanceError>;
}

// Wire types for generateContent

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: Vec<RequestContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent<'a> {
    parts: Vec<RequestPart<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Image {
        #[serde(rename = "inlineData")]
        inline_data: RequestInlineData<'a>,
    },
    Text {
        text: &'a str,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestInlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(rename = "inlineData", alias = "inline_data")]
    inline_data: Option<ResponseInlineData>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseInlineData {
    #[serde(rename = "mimeType", alias = "mime_type")]
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Gemini-backed enhancer
pub struct GeminiEnhancer {
    http_client: reqwest::Client,
    endpoint: String,
    instruction: String,
    api_key: Option<String>,
    env_fallback: bool,
}

impl GeminiEnhancer {
    pub fn new(config: &EnhancementConfig) -> Result<Self, EnhanceError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| EnhanceError::Client(e.to_string()))?;

        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent",
            config.base_url.trim_end_matches('/'),
            config.model
        );

        info!(endpoint = %endpoint, "Enhancement client initialized");

        Ok(Self {
            http_client,
            endpoint,
            instruction: config.instruction.clone(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            env_fallback: true,
        })
    }

    /// Only use the configured key, ignoring process environment variables
    pub fn without_env_fallback(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    /// Resolve the credential at call time
    fn credential(&self) -> Result<String, EnhanceError> {
        if let Some(key) = &self.api_key {
            return Ok(key.clone());
        }

        if self.env_fallback {
            for var in CREDENTIAL_ENV_VARS {
                if let Ok(key) = std::env::var(var) {
                    if !key.trim().is_empty() {
                        return Ok(key);
                    }
                }
            }
        }

        Err(EnhanceError::MissingCredential)
    }
}

#[async_trait]
impl ImageEnhancer for GeminiEnhancer {
    fn check_ready(&self) -> Result<(), EnhanceError> {
        self.credential().map(|_| ())
    }

    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn enhance(&self, image: &[u8], media_type: &str) -> Result<EnhancedImage, EnhanceError> {
        let api_key = self.credential()?;

        let request = GenerateContentRequest {
            contents: vec![RequestContent {
                parts: vec![
                    RequestPart::Image {
                        inline_data: RequestInlineData {
                            mime_type: media_type,
                            data: STANDARD.encode(image),
                        },
                    },
                    RequestPart::Text {
                        text: &self.instruction,
                    },
                ],
            }],
            generation_config: GenerationConfig {
                response_modalities: vec!["IMAGE"],
            },
        };

        debug!("Sending image to enhancement service");

        let response = self
            .http_client
            .post(&self.endpoint)
            .header("x-goog-api-key", api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| EnhanceError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map(|b| b.error.message)
                .unwrap_or(body);
            warn!(status = status.as_u16(), message = %message, "Enhancement service error");
            return Err(EnhanceError::Api(status.as_u16(), message));
        }

        let body: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| EnhanceError::Parse(e.to_string()))?;

        let enhanced = extract_image(body, media_type)?;

        info!(
            size_bytes = enhanced.data.len(),
            media_type = %enhanced.media_type,
            "Image enhanced"
        );

        Ok(enhanced)
    }
}

/// Pick the first inline image across the response parts, in order.
fn extract_image(
    response: GenerateContentResponse,
    fallback_media_type: &str,
) -> Result<EnhancedImage, EnhanceError> {
    let mut finish_reason = None;
    let mut model_text = None;

    for candidate in response.candidates {
        if finish_reason.is_none() {
            finish_reason = candidate.finish_reason;
        }
        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();

        for part in parts {
            if let Some(inline) = part.inline_data {
                let data = STANDARD
                    .decode(inline.data.as_bytes())
                    .map_err(|e| EnhanceError::Decode(e.to_string()))?;
                if data.is_empty() {
                    return Err(EnhanceError::Decode("empty image payload".to_string()));
                }

                return Ok(EnhancedImage {
                    data: Bytes::from(data),
                    media_type: inline
                        .mime_type
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| fallback_media_type.to_string()),
                });
            }
            if model_text.is_none() {
                model_text = part.text;
            }
        }
    }

    let block_reason = response.prompt_feedback.and_then(|f| f.block_reason);
    let detail = match (block_reason, finish_reason, model_text) {
        (Some(reason), _, _) => format!("prompt blocked: {}", reason),
        (None, _, Some(text)) => format!("model replied: {}", text.trim()),
        (None, Some(reason), None) => format!("finish reason: {}", reason),
        (None, None, None) => "empty response".to_string(),
    };

    Err(EnhanceError::NoImage(detail))
}
