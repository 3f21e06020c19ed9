// Command line / environment configuration and the startup wiring built from it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::Client;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{ExplanationCache, MemoryCache, RedisCache};
use crate::explain::{Explainer, DEFAULT_TTL};
use crate::model::{GeminiModel, OllamaModel, TextModel, GEMINI_MODELS, OLLAMA_MODELS};
use crate::search::SortMode;

pub const MEMORY_CACHE_URL: &str = "memory://";

#[derive(Parser, Debug)]
#[command(author, version, about = "Computer Science Conference Searcher: search proxy and streamed paper explanations", long_about = None)]
pub struct Args {
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true, hide = true)]
    pub gemini_api_key: Option<String>,

    #[arg(long, env = "GEMINI_BASE_URL", default_value = "https://generativelanguage.googleapis.com")]
    pub gemini_base_url: String,

    /// `memory://` keeps explanations in process instead of Redis
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:8080")]
    pub backend_url: String,

    #[arg(long, env = "PUBLIC_URL", default_value = "http://localhost:3000")]
    pub public_url: String,

    #[arg(long, env = "EXPLAIN_PROVIDER", value_enum, default_value_t = Provider::Gemini)]
    pub provider: Provider,

    /// Comma separated model ids, tried in order
    #[arg(long, env = "EXPLAIN_MODELS", value_delimiter = ',')]
    pub models: Vec<String>,

    #[arg(long, env = "OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,

    #[arg(long, env = "DBLP_URL", default_value = "https://dblp.org")]
    pub dblp_url: String,

    #[arg(long, env = "CACHE_TTL_DAYS", default_value_t = 30)]
    pub cache_ttl_days: u64,

    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the web server (default)
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value_t = 3000)]
        port: u16,
    },

    /// Query the search backend from the terminal
    Search {
        query: String,

        #[arg(long = "venue")]
        venues: Vec<String>,

        #[arg(long = "year")]
        years: Vec<String>,

        #[arg(short, long, default_value_t = 1)]
        page: u32,

        #[arg(short, long, value_enum, default_value_t = SortMode::Relevance)]
        sort: SortMode,
    },

    /// Stream an explanation for a BibTeX file or a DBLP key
    Explain {
        #[arg(long, conflicts_with = "key", required_unless_present = "key")]
        file: Option<PathBuf>,

        #[arg(long)]
        key: Option<String>,
    },

    /// Print the citation for a DBLP key or a locally described paper
    Bibtex {
        #[arg(long)]
        key: Option<String>,

        #[arg(long, default_value = "")]
        title: String,

        #[arg(long, default_value = "")]
        venue: String,

        #[arg(long, default_value_t = 0)]
        year: i32,

        #[arg(long = "author")]
        authors: Vec<String>,

        #[arg(long)]
        ee_link: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Provider {
    Gemini,
    Ollama,
}

impl Args {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve {
            host: "127.0.0.1".to_string(),
            port: 3000,
        })
    }

    /// Redis rejects a zero expiry, so 0 days means the default.
    pub fn cache_ttl(&self) -> Duration {
        match self.cache_ttl_days {
            0 => DEFAULT_TTL,
            days => Duration::from_secs(days * 24 * 60 * 60),
        }
    }

    pub fn candidates(&self) -> Vec<String> {
        let configured: Vec<String> = self
            .models
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();
        if !configured.is_empty() {
            return configured;
        }

        let defaults = match self.provider {
            Provider::Gemini => GEMINI_MODELS,
            Provider::Ollama => OLLAMA_MODELS,
        };
        defaults.iter().map(|m| m.to_string()).collect()
    }

    pub fn build_cache(&self) -> Result<Arc<dyn ExplanationCache>> {
        if self.redis_url == MEMORY_CACHE_URL {
            info!("Using in-memory explanation cache");
            return Ok(Arc::new(MemoryCache::new()) as Arc<dyn ExplanationCache>);
        }
        let cache: Arc<dyn ExplanationCache> = Arc::new(
            RedisCache::new(&self.redis_url)
                .with_context(|| format!("invalid REDIS_URL '{}'", self.redis_url))?,
        );
        Ok(cache)
    }

    /// `None` when Gemini is selected without an API key. The server still
    /// starts; explanation requests report the missing credential.
    pub fn build_model(&self, client: &Client) -> Result<Option<Arc<dyn TextModel>>> {
        match self.provider {
            Provider::Gemini => match self.gemini_api_key.as_deref().filter(|k| !k.is_empty()) {
                Some(key) => {
                    let model: Arc<dyn TextModel> =
                        Arc::new(GeminiModel::new(client.clone(), &self.gemini_base_url, key));
                    Ok(Some(model))
                }
                None => {
                    warn!("GEMINI_API_KEY is not set, explanations are disabled");
                    Ok(None)
                }
            },
            Provider::Ollama => {
                let model: Arc<dyn TextModel> = Arc::new(
                    OllamaModel::new(&self.ollama_url)
                        .with_context(|| format!("invalid OLLAMA_URL '{}'", self.ollama_url))?,
                );
                Ok(Some(model))
            }
        }
    }

    pub fn build_explainer(&self, client: &Client) -> Result<Explainer> {
        let candidates = self.candidates();
        info!(provider = ?self.provider, candidates = ?candidates, "explanation models");
        Ok(Explainer::new(
            self.build_model(client)?,
            candidates,
            self.build_cache()?,
            self.cache_ttl(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        let mut full = vec!["cscs"];
        full.extend_from_slice(argv);
        Args::try_parse_from(full).unwrap()
    }

    #[test]
    fn serve_is_the_default_command() {
        let args = parse(&[]);
        assert!(matches!(args.command(), Command::Serve { port: 3000, .. }));
        assert_eq!(args.cache_ttl(), DEFAULT_TTL);
        assert_eq!(parse(&["--cache-ttl-days", "0"]).cache_ttl(), DEFAULT_TTL);
        assert_eq!(
            parse(&["--cache-ttl-days", "1"]).cache_ttl(),
            Duration::from_secs(24 * 60 * 60)
        );
    }

    #[test]
    fn candidates_default_per_provider() {
        let args = parse(&["--provider", "gemini"]);
        assert_eq!(
            args.candidates(),
            vec!["gemini-3-flash-preview", "gemini-2.5-flash", "gemini-2.5-flash-lite"]
        );

        let args = parse(&["--provider", "ollama"]);
        assert_eq!(args.candidates(), vec!["llama3.2:latest"]);
    }

    #[test]
    fn explicit_models_override_defaults() {
        let args = parse(&["--models", "a, b,,c"]);
        assert_eq!(args.candidates(), vec!["a", "b", "c"]);
    }

    #[test]
    fn missing_gemini_key_disables_the_model() {
        let args = parse(&["--provider", "gemini", "--gemini-api-key", ""]);
        assert!(args.build_model(&Client::new()).unwrap().is_none());

        let args = parse(&["--provider", "gemini", "--gemini-api-key", "k"]);
        let model = args.build_model(&Client::new()).unwrap().unwrap();
        assert_eq!(model.provider(), "gemini");
    }

    #[test]
    fn memory_url_selects_in_process_cache() {
        let args = parse(&["--redis-url", "memory://"]);
        assert_eq!(args.build_cache().unwrap().name(), "memory");

        let args = parse(&["--redis-url", "not a url"]);
        assert!(args.build_cache().is_err());
    }

    #[test]
    fn explain_needs_a_source() {
        assert!(Args::try_parse_from(["cscs", "explain"]).is_err());
        assert!(Args::try_parse_from(["cscs", "explain", "--file", "a.bib", "--key", "k"]).is_err());
        let args = parse(&["explain", "--key", "conf/osdi/OngaroO14"]);
        assert!(matches!(args.command(), Command::Explain { key: Some(_), file: None }));
    }
}
