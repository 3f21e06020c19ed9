// Search proxy. Query parameters go to the backend untouched and its JSON
// comes back untouched; the only job here is hiding where the backend lives.

use bytes::Bytes;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::error::SearchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    #[default]
    Relevance,
    Year,
    #[value(name = "citation_count")]
    CitationCount,
}

impl SortMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::Year => "year",
            Self::CitationCount => "citation_count",
        }
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed search request for the terminal client. The proxy route forwards raw
/// query pairs instead.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub q: String,
    pub venues: Vec<String>,
    pub years: Vec<String>,
    pub page: u32,
    pub sort: SortMode,
    pub facets: Vec<String>,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            q: String::new(),
            venues: Vec::new(),
            years: Vec::new(),
            page: 1,
            sort: SortMode::Relevance,
            facets: vec!["venue".to_string(), "year".to_string()],
        }
    }
}

impl SearchQuery {
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if !self.q.is_empty() {
            pairs.push(("q".to_string(), self.q.clone()));
        }
        for venue in &self.venues {
            pairs.push(("venue".to_string(), venue.clone()));
        }
        for year in &self.years {
            pairs.push(("year".to_string(), year.clone()));
        }
        pairs.push(("page".to_string(), self.page.to_string()));
        pairs.push(("sort".to_string(), self.sort.to_string()));
        if !self.facets.is_empty() {
            pairs.push(("facets".to_string(), self.facets.join(",")));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Paper {
    #[serde(default)]
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub venue: String,
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub ee_link: Option<String>,
    #[serde(default)]
    pub dblp_key: Option<String>,
    #[serde(default)]
    pub citation_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FacetDistribution {
    #[serde(default)]
    pub venue: BTreeMap<String, u64>,
    #[serde(default)]
    pub year: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub hits: Vec<Paper>,
    #[serde(default)]
    pub estimated_total_hits: u64,
    #[serde(default)]
    pub processing_time_ms: u64,
    #[serde(default)]
    pub facet_distribution: Option<FacetDistribution>,
}

pub struct SearchProxy {
    client: Client,
    endpoint: String,
}

impl SearchProxy {
    pub fn new(client: Client, backend_url: &str) -> Self {
        Self {
            client,
            endpoint: format!("{}/search", backend_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Forward `params` in order (repeated keys included) and return the
    /// backend body byte for byte.
    pub async fn forward(&self, params: &[(String, String)]) -> Result<Bytes, SearchError> {
        debug!(endpoint = %self.endpoint, params = ?params, "forwarding search");

        let response = self
            .client
            .get(&self.endpoint)
            .query(params)
            .header(ACCEPT, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            warn!(status, endpoint = %self.endpoint, "search backend error");
            return Err(SearchError::Backend(status));
        }

        let body = response.bytes().await?;
        serde_json::from_slice::<serde::de::IgnoredAny>(&body)?;
        Ok(body)
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResponse, SearchError> {
        let body = self.forward(&query.to_pairs()).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Cheapest possible request, for health reporting.
    pub async fn ping(&self) -> Result<(), SearchError> {
        self.forward(&[("limit".to_string(), "0".to_string())])
            .await
            .map(|_| ())
    }
}
