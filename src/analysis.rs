use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use crate::capture::CapturedImage;
use crate::config::AnalysisConfig;
use crate::errors::{Result, MonitorError};

/// Sentinel the model is asked to answer with when the frame is safe
pub const NO_DANGER_SENTINEL: &str = "no danger detected";

pub const HAZARD_PROMPT: &str = "You are a construction site safety inspector reviewing a live camera frame. \
Look for hazards such as fire, smoke, explosions, weapons, violence, people without hard hats or high-visibility vests, \
unsecured loads, workers at height without fall protection, blocked exits, and heavy machinery near people. \
If nothing dangerous is visible, reply exactly: \"No danger detected.\" \
Otherwise describe the hazard in one or two sentences and say whether it is a minor issue or an emergency.";

/// External vision-language model. The canonical response is the model's plain-text description.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, image: &CapturedImage, prompt: &str) -> Result<String>;
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

/// Client for a Gemini-style `generateContent` endpoint
#[derive(Clone)]
pub struct GeminiAnalyzer {
    endpoint: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiAnalyzer {
    pub fn new(config: &AnalysisConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout()?)
            .build()?;
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            client,
        })
    }

    fn request_url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }

    fn request_body(image: &CapturedImage, prompt: &str) -> serde_json::Value {
        json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": image.mime_type, "data": image.to_base64() } }
                ]
            }]
        })
    }

    fn extract_text(body: &str) -> Result<String> {
        let response: GenerateContentResponse = serde_json::from_str(body)
            .map_err(|e| MonitorError::analysis(format!("Malformed analysis response: {}", e)))?;

        let text = response.candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| {
                content.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| MonitorError::analysis("Analysis response contained no text"))?;

        Ok(text)
    }
}

#[async_trait]
impl Analyzer for GeminiAnalyzer {
    async fn analyze(&self, image: &CapturedImage, prompt: &str) -> Result<String> {
        // The key travels in a header so it never shows up in logged URLs
        debug!(target: "analysis", model = %self.model, image_bytes = image.data.len(), "Submitting frame for analysis");
        let res = self.client.post(self.request_url())
            .header("x-goog-api-key", &self.api_key)
            .json(&Self::request_body(image, prompt))
            .send()
            .await
            .map_err(|e| MonitorError::analysis(format!("Analysis request failed: {}", e)))?;

        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        trace!(target: "analysis", status = %status, response = %text, "Analysis response body");
        if !status.is_success() {
            return Err(MonitorError::analysis(format!("Analysis API bad status {}: {}", status, text)));
        }

        Self::extract_text(&text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Exchange {
    pub question: String,
    pub answer: String,
}

/// Conversation context for follow-up questions about one analyzed frame.
/// Owned by whoever drives the conversation; nothing here is global.
#[derive(Debug, Clone)]
pub struct AnalysisSession {
    pub camera_id: String,
    pub camera_name: String,
    pub image: CapturedImage,
    pub description: String,
    transcript: Vec<Exchange>,
}

impl AnalysisSession {
    pub fn new(camera_id: String, camera_name: String, image: CapturedImage, description: String) -> Self {
        Self {
            camera_id,
            camera_name,
            image,
            description,
            transcript: Vec::new(),
        }
    }

    pub fn transcript(&self) -> &[Exchange] {
        &self.transcript
    }

    fn follow_up_prompt(&self, question: &str) -> String {
        let mut prompt = format!(
            "You previously analyzed this frame from camera '{}' and reported: \"{}\"\n",
            self.camera_name, self.description
        );
        for exchange in &self.transcript {
            prompt.push_str(&format!("Q: {}\nA: {}\n", exchange.question, exchange.answer));
        }
        prompt.push_str(&format!("Answer the follow-up question about the same frame.\nQ: {}", question));
        prompt
    }

    pub async fn ask(&mut self, analyzer: &dyn Analyzer, question: &str, timeout: Duration) -> Result<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(MonitorError::analysis("Question must not be empty"));
        }

        let prompt = self.follow_up_prompt(question);
        let answer = tokio::time::timeout(timeout, analyzer.analyze(&self.image, &prompt))
            .await
            .map_err(|_| MonitorError::analysis(format!("Follow-up timed out after {:?}", timeout)))??;

        self.transcript.push(Exchange {
            question: question.to_string(),
            answer: answer.clone(),
        });
        Ok(answer)
    }
}
