// Paper explanations: cache first, otherwise generate with the first model
// candidate that is not rate limited and stream the text while keeping a copy
// for the cache.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::cache::{cache_key, ExplanationCache};
use crate::error::{ExplainError, GenerateError};
use crate::model::{is_rate_limited, TextModel, TextStream};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 30);

pub type ChunkStream = BoxStream<'static, Result<Bytes, GenerateError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_header(&self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
        }
    }
}

pub struct Explanation {
    pub cache: CacheStatus,
    pub body: ChunkStream,
    /// Producer task on a miss. Finishes after the cache write attempt.
    pub completion: Option<JoinHandle<()>>,
}

pub fn build_prompt(bibtex: &str) -> String {
    format!(
        "Please provide a concise explanation of this paper in English.\n\n\
        Structure your response with clear Markdown formatting:\n\n\
        ## Summary\n\
        A one-sentence summary of what this paper proposes.\n\n\
        ## Core Contribution\n\
        A bulleted list of key technical contributions.\n\n\
        ## Impact\n\
        Why this paper is important or what problem it solves.\n\n\
        **Note**: Use bolding for key terms. Ensure there is a blank line between sections \
        and paragraphs for readability. Start directly with the first heading, without any \
        introduction.\n\n\
        Here is the BibTeX for a computer science paper:\n\
        ```bibtex\n{}\n```\n",
        bibtex
    )
}

pub struct Explainer {
    model: Option<Arc<dyn TextModel>>,
    candidates: Vec<String>,
    cache: Arc<dyn ExplanationCache>,
    ttl: Duration,
}

impl Explainer {
    /// `model` is `None` when the provider credential is missing; every
    /// request then fails before touching the cache.
    pub fn new(
        model: Option<Arc<dyn TextModel>>,
        candidates: Vec<String>,
        cache: Arc<dyn ExplanationCache>,
        ttl: Duration,
    ) -> Self {
        Self {
            model,
            candidates,
            cache,
            ttl,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.model.is_some()
    }

    pub fn provider(&self) -> Option<&'static str> {
        self.model.as_ref().map(|m| m.provider())
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    pub fn cache(&self) -> &Arc<dyn ExplanationCache> {
        &self.cache
    }

    pub async fn explain(&self, bibtex: &str) -> Result<Explanation, ExplainError> {
        if bibtex.trim().is_empty() {
            return Err(ExplainError::MissingBibtex);
        }
        let model = self.model.as_ref().ok_or(ExplainError::MissingCredential)?;

        let key = cache_key(bibtex);
        match self.cache.get(&key).await {
            Ok(Some(text)) => {
                info!(key = %key, "explanation cache hit");
                return Ok(Explanation {
                    cache: CacheStatus::Hit,
                    body: stream::iter(vec![Ok(Bytes::from(text))]).boxed(),
                    completion: None,
                });
            }
            Ok(None) => debug!(key = %key, "explanation cache miss"),
            Err(e) => warn!(key = %key, error = %e, "cache read failed, treating as miss"),
        }

        let prompt = build_prompt(bibtex);
        let (chosen, upstream) = self.open(model.as_ref(), &prompt).await?;
        info!(model = %chosen, key = %key, "streaming explanation");

        let (tx, rx) = mpsc::channel(32);
        let completion = tokio::spawn(relay(
            upstream,
            tx,
            self.cache.clone(),
            key,
            self.ttl,
        ));

        Ok(Explanation {
            cache: CacheStatus::Miss,
            body: ReceiverStream::new(rx).boxed(),
            completion: Some(completion),
        })
    }

    /// Try each candidate in order. Only rate limits move on to the next one.
    async fn open(
        &self,
        model: &dyn TextModel,
        prompt: &str,
    ) -> Result<(String, TextStream), ExplainError> {
        let mut last_error = None;

        for candidate in &self.candidates {
            match model.stream(candidate, prompt).await {
                Ok(stream) => return Ok((candidate.clone(), stream)),
                Err(e) if is_rate_limited(&e) => {
                    warn!(model = %candidate, error = %e, "rate limited, trying next model");
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(model = %candidate, error = %e, "generation failed");
                    return Err(e.into());
                }
            }
        }

        Err(last_error.map_or(ExplainError::NoCandidates, ExplainError::from))
    }
}

/// Forward upstream chunks to the client and accumulate them. Generation runs
/// to the end even if the client went away so the result still gets cached.
async fn relay(
    mut upstream: TextStream,
    tx: mpsc::Sender<Result<Bytes, GenerateError>>,
    cache: Arc<dyn ExplanationCache>,
    key: String,
    ttl: Duration,
) {
    let mut full_text = String::new();
    let mut client_gone = false;

    while let Some(item) = upstream.next().await {
        match item {
            Ok(chunk) if chunk.is_empty() => {}
            Ok(chunk) => {
                full_text.push_str(&chunk);
                if !client_gone && tx.send(Ok(Bytes::from(chunk))).await.is_err() {
                    debug!(key = %key, "client disconnected, finishing generation for the cache");
                    client_gone = true;
                }
            }
            Err(e) => {
                error!(key = %key, model = %e.model(), error = %e, "explanation stream failed");
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
    drop(tx);

    if full_text.is_empty() {
        warn!(key = %key, "model produced no text, nothing cached");
        return;
    }

    match cache.set(&key, &full_text, ttl).await {
        Ok(()) => info!(key = %key, chars = full_text.len(), "explanation cached"),
        Err(e) => warn!(key = %key, error = %e, "cache write failed"),
    }
}
