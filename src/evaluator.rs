use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::Scores;

const DEFAULT_API_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
const MAX_RETRIES: usize = 2;
const BASE_BACKOFF_MS: u64 = 300;
const MAX_SCORE: f64 = 10.0;

const SYSTEM_INSTRUCTION: &str = "あなたは英語の発音を評価する講師です。\
お手本の英文と学習者の録音を比較し、発音・流暢さ・イントネーションをそれぞれ0から10で採点してください。\
録音内容を文字起こしし、正しく発音できなかった単語を列挙し、日本語で具体的な改善アドバイスを書いてください。\
応答は指定されたJSONスキーマに従ってください。";

#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AudioClip {
    pub async fn from_file(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let mime_type = match path.extension().and_then(|e| e.to_str()) {
            Some("wav") => "audio/wav",
            Some("mp3") => "audio/mp3",
            Some("ogg") => "audio/ogg",
            _ => "audio/webm",
        };
        Ok(Self {
            mime_type: mime_type.to_string(),
            bytes,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub scores: Scores,
    pub transcription: String,
    pub incorrect_words: Vec<String>,
    pub advice: String,
}

#[async_trait]
pub trait SpeechEvaluator: Send + Sync {
    async fn evaluate(&self, reference_text: &str, audio: &AudioClip) -> AppResult<Evaluation>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEvaluation {
    pronunciation_score: f64,
    fluency_score: f64,
    intonation_score: f64,
    transcription: String,
    incorrect_words: Vec<String>,
    advice: String,
}

/// Pulls the JSON object out of a fenced block or the outermost braces.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let body = after_fence.strip_prefix("json").unwrap_or(after_fence);
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(first), Some(last)) if last > first => &trimmed[first..=last],
        _ => trimmed,
    }
}

fn check_score(name: &str, value: f64) -> AppResult<f64> {
    if !value.is_finite() || !(0.0..=MAX_SCORE).contains(&value) {
        return Err(AppError::Evaluation(format!(
            "{name} {value} is outside 0-{MAX_SCORE}"
        )));
    }
    Ok(value)
}

pub fn parse_evaluation(text: &str) -> AppResult<Evaluation> {
    let raw: RawEvaluation = serde_json::from_str(extract_json(text)).map_err(|e| {
        warn!(error = %e, "model response did not match the evaluation schema");
        AppError::Evaluation(format!("invalid evaluation JSON: {e}"))
    })?;

    Ok(Evaluation {
        scores: Scores {
            pronunciation: check_score("pronunciationScore", raw.pronunciation_score)?,
            fluency: check_score("fluencyScore", raw.fluency_score)?,
            intonation: check_score("intonationScore", raw.intonation_score)?,
        },
        transcription: raw.transcription,
        incorrect_words: raw.incorrect_words,
        advice: raw.advice,
    })
}

fn response_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "pronunciationScore": { "type": "NUMBER", "description": "発音の正確さ (0-10)" },
            "fluencyScore": { "type": "NUMBER", "description": "流暢さ (0-10)" },
            "intonationScore": { "type": "NUMBER", "description": "イントネーションとリズム (0-10)" },
            "transcription": { "type": "STRING", "description": "発話の文字起こし" },
            "incorrectWords": {
                "type": "ARRAY",
                "items": { "type": "STRING" },
                "description": "正しく発音できなかった単語"
            },
            "advice": { "type": "STRING", "description": "日本語での改善アドバイス" }
        },
        "required": [
            "pronunciationScore",
            "fluencyScore",
            "intonationScore",
            "transcription",
            "incorrectWords",
            "advice"
        ]
    })
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
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

#[derive(Clone)]
pub struct GeminiEvaluator {
    client: reqwest::Client,
    api_key: String,
    model: String,
    api_endpoint: String,
}

impl GeminiEvaluator {
    pub fn new(api_key: String, model: String, timeout: Duration) -> AppResult<Self> {
        if api_key.trim().is_empty() {
            return Err(AppError::Evaluation("GEMINI_API_KEY is not configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Evaluation(e.to_string()))?;
        Ok(Self {
            client,
            api_key,
            model,
            api_endpoint: DEFAULT_API_ENDPOINT.to_string(),
        })
    }

    async fn post_with_retry(&self, payload: &serde_json::Value) -> AppResult<GenerateResponse> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.api_endpoint.trim_end_matches('/'),
            self.model
        );
        let mut last_error = None;

        for retry in 0..=MAX_RETRIES {
            let sent = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(payload)
                .send()
                .await;

            let err = match sent {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<GenerateResponse>()
                        .await
                        .map_err(|e| AppError::Evaluation(format!("unreadable response: {e}")));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    let err = AppError::Evaluation(format!("HTTP {status}: {body}"));
                    if !is_retryable(status) {
                        return Err(err);
                    }
                    err
                }
                Err(e) => AppError::Evaluation(format!("request failed: {e}")),
            };

            if retry < MAX_RETRIES {
                let backoff = Duration::from_millis(BASE_BACKOFF_MS * (1 << retry));
                warn!(retry, error = %err, "evaluation request failed, retrying");
                sleep(backoff).await;
            }
            last_error = Some(err);
        }

        Err(last_error.unwrap_or_else(|| AppError::Evaluation("no attempt made".into())))
    }
}

#[async_trait]
impl SpeechEvaluator for GeminiEvaluator {
    async fn evaluate(&self, reference_text: &str, audio: &AudioClip) -> AppResult<Evaluation> {
        let payload = json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_INSTRUCTION }] },
            "contents": [{
                "role": "user",
                "parts": [
                    { "inlineData": { "mimeType": audio.mime_type, "data": STANDARD.encode(&audio.bytes) } },
                    { "text": format!("私の発音を評価してください。お手本の文は次の通りです: \"{reference_text}\"") }
                ]
            }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": response_schema()
            }
        });

        let response = self.post_with_retry(&payload).await?;
        let text = response
            .text()
            .ok_or_else(|| AppError::Evaluation("empty response".into()))?;
        debug!(chars = text.len(), "evaluation response received");
        parse_evaluation(&text)
    }
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}
