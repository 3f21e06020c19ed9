// Stand-ins for the model provider, the cache and the HTTP upstreams.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cache::ExplanationCache;
use crate::error::{CacheError, GenerateError};
use crate::explain::ChunkStream;
use crate::model::{TextModel, TextStream};

pub enum Script {
    Chunks(Vec<&'static str>),
    RateLimited,
    Fail(u16, &'static str),
    /// Yields the chunks, then fails mid-stream.
    Break(Vec<&'static str>, &'static str),
}

impl Script {
    pub fn chunks(chunks: &[&'static str]) -> Self {
        Self::Chunks(chunks.to_vec())
    }
}

/// Model whose behaviour per model id is scripted. Records every call.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, model: &str, script: Script) -> Self {
        self.scripts.insert(model.to_string(), script);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

fn ok_chunks(chunks: &[&'static str]) -> Vec<Result<String, GenerateError>> {
    chunks.iter().map(|c| Ok(c.to_string())).collect()
}

#[async_trait]
impl TextModel for ScriptedModel {
    async fn stream(&self, model: &str, _prompt: &str) -> Result<TextStream, GenerateError> {
        self.calls.lock().unwrap().push(model.to_string());

        match self.scripts.get(model) {
            Some(Script::Chunks(c)) => Ok(stream::iter(ok_chunks(c)).boxed()),
            Some(Script::RateLimited) => Err(GenerateError::Status {
                model: model.to_string(),
                status: 429,
                body: "RESOURCE_EXHAUSTED".to_string(),
            }),
            Some(Script::Fail(status, body)) => Err(GenerateError::Status {
                model: model.to_string(),
                status: *status,
                body: body.to_string(),
            }),
            Some(Script::Break(c, message)) => {
                let mut items = ok_chunks(c);
                items.push(Err(GenerateError::Stream {
                    model: model.to_string(),
                    message: message.to_string(),
                }));
                Ok(stream::iter(items).boxed())
            }
            None => Err(GenerateError::Status {
                model: model.to_string(),
                status: 404,
                body: "model not found".to_string(),
            }),
        }
    }

    fn provider(&self) -> &'static str {
        "scripted"
    }
}

/// Cache that fails every operation but counts them.
#[derive(Default)]
pub struct FailingCache {
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl FailingCache {
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExplanationCache for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Poisoned)
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), CacheError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Err(CacheError::Poisoned)
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// In-memory cache that records every write with its TTL.
#[derive(Default)]
pub struct RecordingCache {
    writes: Mutex<Vec<(String, String, Duration)>>,
}

impl RecordingCache {
    pub fn writes(&self) -> Vec<(String, String, Duration)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExplanationCache for RecordingCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let writes = self.writes.lock().unwrap();
        Ok(writes
            .iter()
            .rev()
            .find(|(k, _, _)| k == key)
            .map(|(_, v, _)| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.writes
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string(), ttl));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Concatenates a response body, stopping at the first error.
pub async fn collect_body(mut body: ChunkStream) -> Result<String, String> {
    let mut text = String::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        text.push_str(&String::from_utf8_lossy(&chunk));
    }
    Ok(text)
}

/// Serves a filter on an ephemeral localhost port and evaluates to its base URL.
macro_rules! spawn_server {
    ($filter:expr) => {{
        let (addr, server) = warp::serve($filter).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        format!("http://{}", addr)
    }};
}
pub(crate) use spawn_server;

/// A base URL nothing listens on.
pub async fn closed_port() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}
