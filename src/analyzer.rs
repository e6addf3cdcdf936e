use crate::{
    api::{AnalysisResult, BoundingBox, CongestionLevel},
    capture::EncodedFrame,
    error::AnalyzeError,
};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{future::Future, time::Duration};
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const API_KEY_VARS: [&str; 2] = ["API_KEY", "GEMINI_API_KEY"];

const ANALYSIS_PROMPT: &str = "You are a traffic monitoring system. Analyze this road camera frame. \
Count every vehicle that is visible (cars, trucks, buses, motorcycles, bicycles). \
Rate the congestion as Low, Medium or High. \
Give a one sentence description of the traffic situation. \
For every vehicle return a bounding box with ymin, xmin, ymax, xmax normalized to the range 0 to 1 \
and a short label such as car, truck, bus or motorcycle.";

/// Anything that can turn an encoded frame into an analysis result.
pub trait Analyze: Send + Sync + 'static {
    fn analyze(
        &self,
        frame: EncodedFrame,
    ) -> impl Future<Output = Result<AnalysisResult, AnalyzeError>> + Send;
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub api_base: String,
    pub model: String,
    pub timeout: Duration,
    /// Environment variables consulted, in order, for the API key.
    pub key_vars: Vec<String>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            key_vars: API_KEY_VARS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Clone)]
pub struct GeminiAnalyzer {
    client: reqwest::Client,
    config: AnalyzerConfig,
}

impl GeminiAnalyzer {
    pub fn new(config: AnalyzerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// The key is read on every call so a fixed environment is picked up without a restart.
    fn api_key(&self) -> Result<String, AnalyzeError> {
        self.config
            .key_vars
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                AnalyzeError::Configuration(format!(
                    "no API key found, set one of {}",
                    self.config.key_vars.join(", ")
                ))
            })
    }

    async fn call(&self, frame: &EncodedFrame) -> Result<String, AnalyzeError> {
        let key = self.api_key()?;
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.api_base.trim_end_matches('/'),
            self.config.model
        );

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(&request_body(frame))
            .send()
            .await
            .map_err(|e| AnalyzeError::from_failure(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AnalyzeError::from_failure(e.to_string()))?;

        if !status.is_success() {
            warn!("Analysis request failed with {}", status);
            return Err(AnalyzeError::from_failure(format!("{status}: {body}")));
        }
        Ok(body)
    }
}

impl Analyze for GeminiAnalyzer {
    async fn analyze(&self, frame: EncodedFrame) -> Result<AnalysisResult, AnalyzeError> {
        let body = self.call(&frame).await?;
        let text = extract_text(&body)?;
        let result = parse_analysis(&text, &frame)?;
        debug!(
            "Analysis: {} vehicles, {} congestion, {} boxes",
            result.vehicle_count,
            result.congestion_level,
            result.detected_objects.len()
        );
        Ok(result)
    }
}

fn request_body(frame: &EncodedFrame) -> Value {
    let data = base64::engine::general_purpose::STANDARD.encode(&frame.jpeg);
    json!({
        "contents": [{
            "parts": [
                { "inlineData": { "mimeType": "image/jpeg", "data": data } },
                { "text": ANALYSIS_PROMPT }
            ]
        }],
        "generationConfig": {
            "responseMimeType": "application/json",
            "responseSchema": response_schema()
        }
    })
}

fn response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "vehicleCount": { "type": "INTEGER" },
            "congestionLevel": { "type": "STRING", "enum": ["Low", "Medium", "High"] },
            "description": { "type": "STRING" },
            "detectedObjects": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "ymin": { "type": "NUMBER" },
                        "xmin": { "type": "NUMBER" },
                        "ymax": { "type": "NUMBER" },
                        "xmax": { "type": "NUMBER" },
                        "label": { "type": "STRING" }
                    },
                    "required": ["ymin", "xmin", "ymax", "xmax", "label"]
                }
            }
        },
        "required": ["vehicleCount", "congestionLevel", "description"]
    })
}

#[derive(Deserialize)]
struct GenerateContentResponse {
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

fn malformed(reason: impl std::fmt::Display) -> AnalyzeError {
    AnalyzeError::Transient(format!("malformed response: {reason}"))
}

/// Pulls the model's text answer out of the service envelope.
fn extract_text(body: &str) -> Result<String, AnalyzeError> {
    let response: GenerateContentResponse = serde_json::from_str(body).map_err(malformed)?;
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(malformed("no text in the first candidate"));
    }
    Ok(text)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    vehicle_count: Option<Value>,
    congestion_level: Option<Value>,
    description: Option<Value>,
    detected_objects: Option<Vec<RawBox>>,
}

#[derive(Deserialize)]
struct RawBox {
    ymin: Option<f64>,
    xmin: Option<f64>,
    ymax: Option<f64>,
    xmax: Option<f64>,
    label: Option<String>,
}

/// Validates the model answer and stamps it with the frame's capture time.
pub fn parse_analysis(text: &str, frame: &EncodedFrame) -> Result<AnalysisResult, AnalyzeError> {
    let text = strip_code_fence(text);
    let raw: RawAnalysis = serde_json::from_str(text).map_err(malformed)?;

    let vehicle_count = match raw.vehicle_count {
        Some(value) => parse_count(&value)?,
        None => return Err(malformed("missing vehicleCount")),
    };
    let congestion_level = match raw.congestion_level {
        Some(Value::String(level)) => level.parse::<CongestionLevel>().map_err(malformed)?,
        Some(other) => return Err(malformed(format!("congestionLevel is not a string: {other}"))),
        None => return Err(malformed("missing congestionLevel")),
    };
    let description = match raw.description {
        Some(Value::String(description)) => description,
        Some(other) => return Err(malformed(format!("description is not a string: {other}"))),
        None => return Err(malformed("missing description")),
    };
    let detected_objects = raw
        .detected_objects
        .unwrap_or_default()
        .into_iter()
        .filter_map(normalize_box)
        .collect();

    Ok(AnalysisResult {
        vehicle_count,
        congestion_level,
        description,
        detected_objects,
        timestamp: frame.captured_at.format("%H:%M:%S").to_string(),
        processed_at: frame.captured_at.timestamp_millis(),
    })
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            let rest = rest.strip_prefix("json").unwrap_or(rest);
            rest.strip_suffix("```").unwrap_or(rest).trim()
        }
        None => trimmed,
    }
}

fn parse_count(value: &Value) -> Result<u32, AnalyzeError> {
    let count = match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
        _ => None,
    };
    count
        .and_then(|c| u32::try_from(c).ok())
        .ok_or_else(|| malformed(format!("vehicleCount is not a non-negative integer: {value}")))
}

fn normalize_box(raw: RawBox) -> Option<BoundingBox> {
    let coords = [raw.ymin?, raw.xmin?, raw.ymax?, raw.xmax?];
    if coords.iter().any(|c| !c.is_finite()) {
        debug!("Dropping box with non-finite coordinates: {:?}", coords);
        return None;
    }
    // Some models answer on a 0..1000 grid regardless of the instruction.
    let scale = if coords.iter().any(|c| *c > 1.0) { 1000.0 } else { 1.0 };
    let [ymin, xmin, ymax, xmax] = coords.map(|c| (c / scale).clamp(0.0, 1.0) as f32);

    Some(BoundingBox {
        ymin: ymin.min(ymax),
        xmin: xmin.min(xmax),
        ymax: ymin.max(ymax),
        xmax: xmin.max(xmax),
        label: raw
            .label
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string()),
    })
}
