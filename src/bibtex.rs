// Citation text for a paper: DBLP's own record when the paper has a DBLP key,
// otherwise a locally assembled @inproceedings entry.

use reqwest::Client;
use tracing::{debug, warn};

use crate::search::Paper;

pub fn fallback_bibtex(paper: &Paper) -> String {
    let key = paper
        .dblp_key
        .clone()
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| format!("conf/{}/{}", paper.venue.to_lowercase(), paper.year));

    format!(
        "@inproceedings{{{},\n  author    = {{{}}},\n  title     = {{{}}},\n  booktitle = {{{}}},\n  year      = {{{}}},\n  url       = {{{}}}\n}}",
        key,
        paper.authors.join(" and "),
        paper.title,
        paper.venue,
        paper.year,
        paper.ee_link.as_deref().unwrap_or_default(),
    )
}

pub struct BibtexClient {
    client: Client,
    dblp_url: String,
}

impl BibtexClient {
    pub fn new(client: Client, dblp_url: &str) -> Self {
        Self {
            client,
            dblp_url: dblp_url.trim_end_matches('/').to_string(),
        }
    }

    /// Never fails: any problem reaching DBLP falls back to the local entry.
    pub async fn fetch(&self, paper: &Paper) -> String {
        if let Some(key) = paper.dblp_key.as_deref().filter(|k| !k.is_empty()) {
            match self.fetch_dblp(key).await {
                Ok(Some(bibtex)) => return bibtex,
                Ok(None) => debug!(key, "DBLP had no usable record"),
                Err(e) => warn!(key, error = %e, "DBLP fetch failed, using local citation"),
            }
        }
        fallback_bibtex(paper)
    }

    async fn fetch_dblp(&self, key: &str) -> reqwest::Result<Option<String>> {
        let url = format!("{}/rec/{}.bib", self.dblp_url, key);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "DBLP returned non-success");
            return Ok(None);
        }

        // Returned byte for byte: the explanation cache key hashes this text.
        let text = response.text().await?;
        Ok((!text.trim().is_empty()).then_some(text))
    }
}
