// ┌─┐┌─┐┌─┐┌─┐
// │  └─┐│  └─┐
// └─┘└─┘└─┘└─┘

// Computer Science Conference Searcher.
// Proxies paper search to the search backend and streams cached AI explanations of papers.

// Copyright 2025 Servus Altissimi (Pseudonym)

// Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the "Software"), to deal in the Software without restriction, including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
// The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

mod bibtex;
mod cache;
mod config;
mod error;
mod explain;
mod model;
mod search;
#[cfg(test)]
mod testutil;
mod web;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use futures::StreamExt;
use reqwest::Client;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::bibtex::BibtexClient;
use crate::config::{Args, Command};
use crate::search::{Paper, SearchProxy, SearchQuery, SortMode};
use crate::web::AppState;

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "cscs=debug,warp=debug"
    } else {
        "cscs=info,warp=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn banner(title: &str) {
    println!("{}", "=".repeat(64));
    println!("   {}", title);
    println!("{}", "=".repeat(64));
}

async fn serve(args: &Args, client: Client, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", host, port))?;

    banner("CSCS - Computer Science Conference Searcher");
    println!("\nBackend: {}", args.backend_url);
    println!("Cache: {}", args.redis_url);
    println!("Provider: {:?}", args.provider);
    println!("Public URL: {}\n", args.public_url);

    let explainer = args.build_explainer(&client)?;
    if !explainer.is_configured() {
        println!("Explanations disabled: GEMINI_API_KEY is not set\n");
    }

    let state = AppState {
        explainer: Arc::new(explainer),
        search: Arc::new(SearchProxy::new(client.clone(), &args.backend_url)),
        bibtex: Arc::new(BibtexClient::new(client, &args.dblp_url)),
        public_url: Arc::from(args.public_url.trim_end_matches('/')),
    };

    web::start_web_server(state, addr).await
}

async fn search(
    args: &Args,
    client: Client,
    q: String,
    venues: Vec<String>,
    years: Vec<String>,
    page: u32,
    sort: SortMode,
) -> Result<()> {
    let proxy = SearchProxy::new(client, &args.backend_url);
    let query = SearchQuery {
        q,
        venues,
        years,
        page: page.max(1),
        sort,
        ..SearchQuery::default()
    };

    let response = proxy
        .search(&query)
        .await
        .with_context(|| format!("search against {} failed", proxy.endpoint()))?;

    banner(&format!("Results for \"{}\"", query.q));
    println!(
        "\n{} hits in {} ms (page {}, sorted by {})\n",
        response.estimated_total_hits, response.processing_time_ms, query.page, query.sort
    );

    for (i, paper) in response.hits.iter().enumerate() {
        println!("[{}] {}", i + 1, paper.title);
        println!("    {}", paper.authors.join(", "));
        print!("    {} {}", paper.venue, paper.year);
        if let Some(citations) = paper.citation_count {
            print!(" | {} citations", citations);
        }
        println!();
        if let Some(link) = &paper.ee_link {
            println!("    {}", link);
        }
        println!();
    }

    if let Some(facets) = &response.facet_distribution {
        println!("{}", "-".repeat(64));
        let venues: Vec<String> = facets
            .venue
            .iter()
            .map(|(v, n)| format!("{} ({})", v, n))
            .collect();
        let years: Vec<String> = facets
            .year
            .iter()
            .rev()
            .map(|(y, n)| format!("{} ({})", y, n))
            .collect();
        println!("Venues: {}", venues.join(", "));
        println!("Years: {}", years.join(", "));
    }

    Ok(())
}

async fn explain(args: &Args, client: Client, file: Option<std::path::PathBuf>, key: Option<String>) -> Result<()> {
    let citation = match (file, key) {
        (Some(path), _) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?,
        (None, Some(key)) => {
            let paper = Paper {
                dblp_key: Some(key),
                ..Paper::default()
            };
            BibtexClient::new(client.clone(), &args.dblp_url).fetch(&paper).await
        }
        (None, None) => return Err(anyhow!("either --file or --key is required")),
    };

    let explainer = args.build_explainer(&client)?;
    let explanation = explainer.explain(&citation).await?;

    banner(&format!("Explanation (cache {})", explanation.cache.as_header()));
    println!();

    let mut body = explanation.body;
    let mut stdout = std::io::stdout();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        stdout.write_all(&chunk)?;
        stdout.flush()?;
    }
    println!();

    // Give the cache write a moment to land before the process exits.
    if let Some(completion) = explanation.completion {
        if tokio::time::timeout(Duration::from_secs(5), completion).await.is_err() {
            tracing::warn!("cache write did not finish before exit");
        }
    }

    Ok(())
}

async fn bibtex(args: &Args, client: Client, paper: Paper) -> Result<()> {
    if paper.dblp_key.is_none() && paper.title.is_empty() {
        return Err(anyhow!("either --key or --title is required"));
    }
    let bibtex = BibtexClient::new(client, &args.dblp_url).fetch(&paper).await;
    println!("{}", bibtex);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.verbose);

    let client = Client::builder()
        .user_agent(concat!("cscs/", env!("CARGO_PKG_VERSION")))
        .build()?;

    match args.command() {
        Command::Serve { host, port } => serve(&args, client, &host, port).await,
        Command::Search {
            query,
            venues,
            years,
            page,
            sort,
        } => search(&args, client, query, venues, years, page, sort).await,
        Command::Explain { file, key } => explain(&args, client, file, key).await,
        Command::Bibtex {
            key,
            title,
            venue,
            year,
            authors,
            ee_link,
        } => {
            let paper = Paper {
                title,
                authors,
                venue,
                year,
                ee_link,
                dblp_key: key.filter(|k| !k.is_empty()),
                ..Paper::default()
            };
            bibtex(&args, client, paper).await
        }
    }
}
