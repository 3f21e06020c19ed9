// Generative model providers. Each provider turns a prompt into a stream of
// text chunks; picking which model id to try is the caller's business.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use ollama_rs::generation::completion::request::GenerationRequest;
use ollama_rs::Ollama;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use tracing::debug;

use crate::error::GenerateError;

pub type TextStream = BoxStream<'static, Result<String, GenerateError>>;

pub const GEMINI_MODELS: &[&str] = &[
    "gemini-3-flash-preview",
    "gemini-2.5-flash",
    "gemini-2.5-flash-lite",
];

pub const OLLAMA_MODELS: &[&str] = &["llama3.2:latest"];

#[async_trait]
pub trait TextModel: Send + Sync {
    /// Start generating `prompt` with `model`. Errors returned here happen
    /// before any text was produced; errors inside the stream happen after.
    async fn stream(&self, model: &str, prompt: &str) -> Result<TextStream, GenerateError>;

    fn provider(&self) -> &'static str;
}

static RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b429\b|resource[ _]exhausted|too many requests")
        .expect("rate limit pattern is valid")
});

/// Whether switching to the next model candidate may get past this error.
pub fn is_rate_limited(err: &GenerateError) -> bool {
    match err {
        GenerateError::Status { status: 429, .. } => true,
        GenerateError::Status { body, .. } => RATE_LIMIT.is_match(body),
        GenerateError::Provider { message, .. } => RATE_LIMIT.is_match(message),
        _ => false,
    }
}

// Gemini (REST, server-sent events)

pub struct GeminiModel {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GeminiModel {
    pub fn new(client: Client, base_url: &str, api_key: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [RequestPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error: Option<ApiError>,
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
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// Splits a server-sent event byte stream into `data:` payloads. Lines may be
/// cut anywhere by the network, so incomplete tails are held back.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(data) = data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a final line the server did not terminate with a newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        data_payload(&String::from_utf8_lossy(&rest))
    }
}

fn data_payload(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let data = line.strip_prefix("data:")?.trim_start();
    (!data.is_empty()).then(|| data.to_string())
}

fn chunk_text(model: &str, payload: &str) -> Result<String, GenerateError> {
    let chunk: GenerateContentChunk =
        serde_json::from_str(payload).map_err(|e| GenerateError::Malformed {
            model: model.to_string(),
            message: e.to_string(),
        })?;

    if let Some(err) = chunk.error {
        return Err(GenerateError::Status {
            model: model.to_string(),
            status: err.code,
            body: format!("{} {}", err.status, err.message).trim().to_string(),
        });
    }

    Ok(chunk
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().map(|p| p.text).collect())
        .unwrap_or_default())
}

fn decode_chunk(
    model: &str,
    decoder: &mut SseDecoder,
    chunk: reqwest::Result<Bytes>,
) -> Result<String, GenerateError> {
    let bytes = chunk.map_err(|e| GenerateError::Stream {
        model: model.to_string(),
        message: e.to_string(),
    })?;

    let mut text = String::new();
    for payload in decoder.push(&bytes) {
        text.push_str(&chunk_text(model, &payload)?);
    }
    Ok(text)
}

#[async_trait]
impl TextModel for GeminiModel {
    async fn stream(&self, model: &str, prompt: &str) -> Result<TextStream, GenerateError> {
        let url = format!("{}/v1beta/models/{}:streamGenerateContent", self.base_url, model);
        let request = GenerateContentRequest {
            contents: [Content {
                role: "user",
                parts: [RequestPart { text: prompt }],
            }],
        };

        debug!(model, "requesting gemini stream");
        let response = self
            .client
            .post(&url)
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerateError::Transport {
                model: model.to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(GenerateError::Status {
                model: model.to_string(),
                status,
                body,
            });
        }

        let model = model.to_string();
        let body = response.bytes_stream().boxed();
        let stream = stream::unfold(Some((body, SseDecoder::default())), move |state| {
            let model = model.clone();
            async move {
                let (mut body, mut decoder) = state?;
                match body.next().await {
                    Some(chunk) => {
                        let text = decode_chunk(&model, &mut decoder, chunk);
                        Some((text, Some((body, decoder))))
                    }
                    None => {
                        let text = match decoder.finish() {
                            Some(payload) => chunk_text(&model, &payload),
                            None => Ok(String::new()),
                        };
                        Some((text, None))
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    fn provider(&self) -> &'static str {
        "gemini"
    }
}

// Ollama (local models)

pub struct OllamaModel {
    ollama: Ollama,
}

impl OllamaModel {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            ollama: Ollama::try_new(url)?,
        })
    }
}

#[async_trait]
impl TextModel for OllamaModel {
    async fn stream(&self, model: &str, prompt: &str) -> Result<TextStream, GenerateError> {
        let request = GenerationRequest::new(model.to_string(), prompt.to_string());

        let upstream = self
            .ollama
            .generate_stream(request)
            .await
            .map_err(|e| GenerateError::Provider {
                model: model.to_string(),
                message: e.to_string(),
            })?;

        let model = model.to_string();
        let stream = upstream.map(move |item| match item {
            Ok(responses) => Ok(responses.into_iter().map(|r| r.response).collect::<String>()),
            Err(e) => Err(GenerateError::Stream {
                model: model.clone(),
                message: e.to_string(),
            }),
        });

        Ok(stream.boxed())
    }

    fn provider(&self) -> &'static str {
        "ollama"
    }
}
