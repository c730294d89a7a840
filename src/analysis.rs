//! Analysis client: sends an image to Gemini with a fixed instruction and a
//! response schema, and deserializes the structured answer.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::AnalysisError;

pub const DEFAULT_MODEL: &str = "gemini-3-flash-preview";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub const ANALYSIS_INSTRUCTION: &str = "\
Analyze this image carefully. Understand its subject, mood, lighting, and artistic style.
Then, create a highly detailed cinematic video generation prompt that would bring this specific image to life.

Technical Details to Identify:
- lensType: Identify what kind of lens was likely used or should be used for this shot (e.g., \"Wide Angle 24mm\", \"Cinematic Anamorphic\", \"Telephoto 85mm\", \"Macro Lens\", \"Fish-eye\").
- cinematographicStyle: The physical camera setup (e.g., \"Handheld Shaky-cam\", \"Smooth Steadicam\", \"Static Tripod\", \"Drone Overhead\", \"GoPro POV\").
- concept: A brief summary.
- videoPrompt: The full motion prompt.
- styleKeywords: 5 keywords.
- suggestedMotion: Recommended movement type (e.g., Dolly Zoom, Orbit, Pan).

Return the result in JSON format.";

const REQUIRED_FIELDS: [&str; 6] = [
    "concept",
    "videoPrompt",
    "styleKeywords",
    "suggestedMotion",
    "lensType",
    "cinematographicStyle",
];

/// Structured answer produced by the analysis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub concept: String,
    pub video_prompt: String,
    pub style_keywords: Vec<String>,
    pub suggested_motion: String,
    pub lens_type: String,
    pub cinematographic_style: String,
}

/// Schema the service is asked to constrain its JSON answer to.
pub fn response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "concept": { "type": "STRING" },
            "videoPrompt": { "type": "STRING" },
            "styleKeywords": {
                "type": "ARRAY",
                "items": { "type": "STRING" }
            },
            "suggestedMotion": { "type": "STRING" },
            "lensType": { "type": "STRING" },
            "cinematographicStyle": { "type": "STRING" }
        },
        "required": REQUIRED_FIELDS,
    })
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<AnalysisResult, AnalysisError>;
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AnalysisError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/{}:generateContent", self.base_url, self.model)
    }
}

#[async_trait]
impl Analyzer for GeminiClient {
    async fn analyze(
        &self,
        image_bytes: &[u8],
        mime_type: &str,
    ) -> Result<AnalysisResult, AnalysisError> {
        let body = build_request(image_bytes, mime_type);

        info!(
            model = %self.model,
            mime_type,
            bytes = image_bytes.len(),
            "sending image to analysis service"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let response_text = response.text().await?;
        debug!(%status, body = %truncate(&response_text, 500), "analysis service responded");

        if !status.is_success() {
            return Err(AnalysisError::Service {
                status: status.as_u16(),
                message: service_error_message(&response_text),
            });
        }

        let envelope: GenerateContentResponse = serde_json::from_str(&response_text)?;
        let text = extract_text(envelope).ok_or(AnalysisError::EmptyResponse)?;
        parse_result(&text)
    }
}

/// Builds the `generateContent` body: inline image, instruction, and the
/// JSON response schema.
pub fn build_request(image_bytes: &[u8], mime_type: &str) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            role: "user".to_string(),
            parts: vec![
                Part::InlineData {
                    inline_data: InlineData {
                        mime_type: mime_type.to_string(),
                        data: general_purpose::STANDARD.encode(image_bytes),
                    },
                },
                Part::Text {
                    text: ANALYSIS_INSTRUCTION.to_string(),
                },
            ],
        }],
        generation_config: GenerationConfig {
            response_mime_type: "application/json".to_string(),
            response_schema: response_schema(),
        },
    }
}

/// Parses the model's text payload. A payload missing any required field
/// fails here as malformed.
pub fn parse_result(text: &str) -> Result<AnalysisResult, AnalysisError> {
    if text.trim().is_empty() {
        return Err(AnalysisError::EmptyResponse);
    }
    Ok(serde_json::from_str(text)?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
    Text {
        text: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
    response_schema: Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
    status: Option<String>,
}

fn extract_text(response: GenerateContentResponse) -> Option<String> {
    response
        .candidates?
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|part| part.text)
        .find(|text| !text.trim().is_empty())
}

fn service_error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let message = envelope.error.message.unwrap_or_default();
            match envelope.error.status {
                Some(status) if !status.is_empty() => format!("{status}: {message}"),
                _ => message,
            }
        }
        Err(_) => truncate(body, 200).to_string(),
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
