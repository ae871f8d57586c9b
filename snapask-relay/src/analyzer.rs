use base64::{Engine, engine::general_purpose::STANDARD};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("analysis failed: {0}")]
pub struct AnalysisFault(pub String);

/// A vision-capable text generation service.
pub trait VisionAnalyzer: Send + Sync {
    fn analyze<'a>(
        &'a self,
        image_png: &'a [u8],
        question: &'a str,
    ) -> BoxFuture<'a, Result<String, AnalysisFault>>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: &'static str,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeminiAnalyzer {
    client: Client,
    api_key: Option<String>,
    model: String,
}

impl GeminiAnalyzer {
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            model: model.into(),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    async fn generate(&self, image_png: &[u8], question: &str) -> Result<String, AnalysisFault> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AnalysisFault("Gemini API key not configured".to_owned()))?;

        let request = build_request(image_png, question);
        let url = format!("{GEMINI_ENDPOINT}/{}:generateContent", self.model);
        debug!(model = %self.model, image_bytes = image_png.len(), "sending gemini request");

        let response = self
            .client
            .post(url)
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(|e| AnalysisFault(format!("Gemini request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalysisFault(format!("Gemini API error ({status}): {body}")));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalysisFault(format!("failed to parse Gemini response: {e}")))?;
        extract_answer(body)
    }
}

impl VisionAnalyzer for GeminiAnalyzer {
    fn analyze<'a>(
        &'a self,
        image_png: &'a [u8],
        question: &'a str,
    ) -> BoxFuture<'a, Result<String, AnalysisFault>> {
        Box::pin(self.generate(image_png, question))
    }
}

fn build_request(image_png: &[u8], question: &str) -> GenerateRequest {
    GenerateRequest {
        contents: vec![Content {
            parts: vec![
                Part::Text {
                    text: format!("Please analyze this screenshot and answer: {question}"),
                },
                Part::InlineData {
                    inline_data: InlineData {
                        mime_type: "image/png",
                        data: STANDARD.encode(image_png),
                    },
                },
            ],
        }],
    }
}

fn extract_answer(body: GenerateResponse) -> Result<String, AnalysisFault> {
    let text = body
        .candidates
        .into_iter()
        .filter_map(|candidate| candidate.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| part.text)
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(AnalysisFault("Gemini returned no text".to_owned()));
    }
    Ok(text)
}
