// HTTP surface: the two API proxies, citation lookup, health, the search page
// and the metadata files crawlers ask for.

use crate::bibtex::BibtexClient;
use crate::error::{ErrorBody, ExplainError};
use crate::explain::{Explainer, Explanation};
use crate::search::{Paper, SearchProxy};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use warp::http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

const SITE_NAME: &str = "CSCS - Computer Science Conference Searcher";
const SITE_SHORT_NAME: &str = "CSCS";
const SITE_DESCRIPTION: &str = "Instant access to 400,000+ academic papers in Computer Science.";

#[derive(Clone)]
pub struct AppState {
    pub explainer: Arc<Explainer>,
    pub search: Arc<SearchProxy>,
    pub bibtex: Arc<BibtexClient>,
    pub public_url: Arc<str>,
}

#[derive(Debug, Serialize)]
struct StatusMessage {
    status: String,
    message: String,
}

impl StatusMessage {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    backend: StatusMessage,
    cache: StatusMessage,
    model: StatusMessage,
}

#[derive(Debug, Deserialize)]
struct ExplainRequest {
    bibtex: String,
}

pub fn routes(state: AppState) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let state_filter = warp::any().map(move || state.clone());

    let index = warp::get()
        .and(warp::path::end())
        .map(|| warp::reply::html(INDEX_HTML));

    let search = warp::get()
        .and(warp::path!("api" / "search"))
        .and(warp::query::<Vec<(String, String)>>())
        .and(state_filter.clone())
        .and_then(search_papers);

    let explain = warp::post()
        .and(warp::path!("api" / "gemini"))
        .and(warp::body::bytes())
        .and(state_filter.clone())
        .and_then(explain_paper);

    let bibtex = warp::get()
        .and(warp::path!("api" / "bibtex"))
        .and(warp::query::<Vec<(String, String)>>())
        .and(state_filter.clone())
        .and_then(get_bibtex);

    let health = warp::get()
        .and(warp::path!("api" / "health"))
        .and(state_filter.clone())
        .and_then(health_check);

    let robots = warp::get()
        .and(warp::path!("robots.txt"))
        .and(state_filter.clone())
        .map(|state: AppState| robots_txt(&state.public_url));

    let sitemap = warp::get()
        .and(warp::path!("sitemap.xml"))
        .and(state_filter.clone())
        .map(|state: AppState| sitemap_xml(&state.public_url));

    let manifest = warp::get()
        .and(warp::path!("manifest.webmanifest"))
        .map(web_manifest);

    index
        .or(search)
        .or(explain)
        .or(bibtex)
        .or(health)
        .or(robots)
        .or(sitemap)
        .or(manifest)
        .with(warp::trace::request())
}

pub async fn start_web_server(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
    };

    let (bound, server) = warp::serve(routes(state)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!("Web interface running on http://{}", bound);
    server.await;
    Ok(())
}

fn json_error(status: StatusCode, body: &ErrorBody) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

fn explain_error(err: ExplainError) -> Response {
    error!(error = %err, "explanation request failed");
    json_error(err.status(), &err.body())
}

async fn search_papers(params: Vec<(String, String)>, state: AppState) -> Result<Response, Infallible> {
    debug!(params = ?params, "search request");

    match state.search.forward(&params).await {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
            Ok(response)
        }
        Err(e) => {
            warn!(error = %e, "search proxy failed");
            Ok(json_error(e.status(), &e.body()))
        }
    }
}

async fn explain_paper(body: Bytes, state: AppState) -> Result<Response, Infallible> {
    let request: ExplainRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return Ok(explain_error(ExplainError::InvalidBody(e.to_string()))),
    };

    match state.explainer.explain(&request.bibtex).await {
        Ok(explanation) => Ok(stream_reply(explanation)),
        Err(e) => Ok(explain_error(e)),
    }
}

// The producer task is left detached; it finishes (and caches) on its own.
fn stream_reply(explanation: Explanation) -> Response {
    let mut response = Response::new(Body::wrap_stream(explanation.body));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert("x-cache", HeaderValue::from_static(explanation.cache.as_header()));
    response
}

fn paper_from_pairs(params: &[(String, String)]) -> Paper {
    let mut paper = Paper::default();
    for (key, value) in params {
        match key.as_str() {
            "key" | "dblp_key" if !value.is_empty() => paper.dblp_key = Some(value.clone()),
            "title" => paper.title = value.clone(),
            "venue" => paper.venue = value.clone(),
            "year" => paper.year = value.parse().unwrap_or_default(),
            "authors" | "author" => paper.authors.push(value.clone()),
            "ee_link" if !value.is_empty() => paper.ee_link = Some(value.clone()),
            _ => {}
        }
    }
    paper
}

async fn get_bibtex(params: Vec<(String, String)>, state: AppState) -> Result<Response, Infallible> {
    let paper = paper_from_pairs(&params);
    if paper.title.is_empty() && paper.dblp_key.is_none() {
        return Ok(json_error(
            StatusCode::BAD_REQUEST,
            &ErrorBody {
                error: "title or key is required".to_string(),
                details: None,
            },
        ));
    }

    let bibtex = state.bibtex.fetch(&paper).await;
    Ok(warp::reply::with_header(bibtex, "content-type", "text/plain; charset=utf-8").into_response())
}

async fn health_check(state: AppState) -> Result<Response, Infallible> {
    let backend = match state.search.ping().await {
        Ok(()) => StatusMessage::ok("Search backend is reachable"),
        Err(e) => StatusMessage::error(format!("Cannot reach search backend: {}", e)),
    };

    let cache = state.explainer.cache();
    let cache = match cache.get("health:probe").await {
        Ok(_) => StatusMessage::ok(format!("{} cache is reachable", cache.name())),
        Err(e) => StatusMessage::error(format!("Cannot reach {} cache: {}", cache.name(), e)),
    };

    let model = match state.explainer.provider() {
        Some(provider) => StatusMessage::ok(format!(
            "{} configured, candidates: {}",
            provider,
            state.explainer.candidates().join(", ")
        )),
        None => StatusMessage::error("GEMINI_API_KEY is not set"),
    };

    let healthy = backend.is_ok() && cache.is_ok() && model.is_ok();
    let report = HealthReport {
        status: if healthy { "ok" } else { "degraded" },
        backend,
        cache,
        model,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok(warp::reply::with_status(warp::reply::json(&report), status).into_response())
}

fn robots_txt(public_url: &str) -> impl Reply {
    format!(
        "User-agent: *\nAllow: /\nDisallow: /api/\n\nSitemap: {}/sitemap.xml\n",
        public_url
    )
}

fn sitemap_xml(public_url: &str) -> impl Reply {
    let xml = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
        <urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n\
        <url>\n\
        <loc>{}</loc>\n\
        <lastmod>{}</lastmod>\n\
        <changefreq>daily</changefreq>\n\
        <priority>1.0</priority>\n\
        </url>\n\
        </urlset>\n",
        public_url,
        Utc::now().format("%Y-%m-%d")
    );
    warp::reply::with_header(xml, "content-type", "application/xml")
}

fn web_manifest() -> impl Reply {
    let manifest = serde_json::json!({
        "name": SITE_NAME,
        "short_name": SITE_SHORT_NAME,
        "description": SITE_DESCRIPTION,
        "start_url": "/",
        "display": "standalone",
        "background_color": "#ffffff",
        "theme_color": "#000000",
        "icons": [
            { "src": "/icon.png", "sizes": "192x192", "type": "image/png" },
            { "src": "/icon.png", "sizes": "512x512", "type": "image/png" }
        ]
    });
    warp::reply::with_header(
        warp::reply::json(&manifest),
        "content-type",
        "application/manifest+json",
    )
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>CSCS - Computer Science Conference Searcher</title>
    <meta name="description" content="Instant access to 400,000+ academic papers in Computer Science.">
    <link rel="manifest" href="/manifest.webmanifest">
    <style>
        body { font-family: Arial; margin: 20px; background: #f5f5f5; }
        h1 { color: #333; }
        .layout { display: grid; grid-template-columns: 220px 1fr; gap: 20px; }
        .search-bar { margin: 20px 0; }
        input[type="text"], select { padding: 8px; margin: 5px 0; }
        button { padding: 8px 16px; background: rgb(100, 149, 237); color: white; border: none; cursor: pointer; margin-right: 5px; border-radius: 0; }
        button:hover { background: #5a8dd4; }
        button:disabled { background: #aaa; cursor: default; }
        button.explain { background: #28a745; font-size: 12px; padding: 4px 8px; }
        .facets { background: white; padding: 10px; border: 1px solid #ddd; }
        .facets h3 { margin: 10px 0 5px 0; font-size: 14px; }
        .facets label { display: block; font-size: 13px; }
        .result { background: white; padding: 15px; margin: 10px 0; border: 1px solid #ddd; }
        .result h3 { margin: 0 0 10px 0; }
        .result a { color: #007bff; text-decoration: none; }
        .info { color: #666; font-size: 14px; }
        .error { padding: 10px; background: #f8d7da; color: #721c24; border: 1px solid #f5c6cb; }
        #panel { display: none; position: fixed; right: 0; top: 0; bottom: 0; width: 40%; background: white; border-left: 1px solid #ddd; padding: 20px; overflow-y: auto; }
        #panel pre { white-space: pre-wrap; font-family: inherit; }
    </style>
</head>
<body>
    <h1>CSCS</h1>
    <div class="search-bar">
        <input type="text" id="q" placeholder="Search papers..." style="width: 400px;">
        <select id="sort">
            <option value="relevance">Relevance</option>
            <option value="year">Year</option>
            <option value="citation_count">Citations</option>
        </select>
        <button onclick="runSearch(1)">Search</button>
    </div>
    <div class="layout">
        <div class="facets" id="facets"></div>
        <div>
            <div class="info" id="summary"></div>
            <div id="results"></div>
            <div id="pager"></div>
        </div>
    </div>
    <div id="panel">
        <button onclick="closePanel()">Close</button>
        <h2 id="panel-title"></h2>
        <pre id="panel-body"></pre>
    </div>

    <script>
        const state = { page: 1, venue: new Set(), year: new Set() };

        function params() {
            const p = new URLSearchParams();
            const q = document.getElementById('q').value.trim();
            if (q) p.set('q', q);
            state.venue.forEach(v => p.append('venue', v));
            state.year.forEach(y => p.append('year', y));
            p.set('page', state.page);
            p.set('sort', document.getElementById('sort').value);
            p.set('facets', 'venue,year');
            return p;
        }

        async function runSearch(page) {
            state.page = page || state.page;
            const results = document.getElementById('results');
            try {
                const res = await fetch('/api/search?' + params().toString());
                if (!res.ok) throw new Error('status ' + res.status);
                render(await res.json());
            } catch (e) {
                results.innerHTML = '<div class="error">Search failed (' + escapeHtml(e.message) + ')</div>';
            }
        }

        function render(data) {
            document.getElementById('summary').textContent =
                `${data.estimatedTotalHits} results (${data.processingTimeMs} ms)`;

            const results = document.getElementById('results');
            results.innerHTML = '';
            data.hits.forEach(paper => {
                const div = document.createElement('div');
                div.className = 'result';
                const title = paper.ee_link
                    ? `<a href="${escapeHtml(paper.ee_link)}" target="_blank">${escapeHtml(paper.title)}</a>`
                    : escapeHtml(paper.title);
                div.innerHTML = `<h3>${title}</h3>
                    <div class="info">${escapeHtml((paper.authors || []).join(', '))}</div>
                    <div class="info">${escapeHtml(paper.venue)} ${paper.year}</div>`;
                const button = document.createElement('button');
                button.className = 'explain';
                button.textContent = 'Explain';
                button.onclick = () => explain(paper);
                div.appendChild(button);
                results.appendChild(div);
            });

            renderFacets(data.facetDistribution || {});

            const pages = Math.ceil(data.estimatedTotalHits / 20);
            const pager = document.getElementById('pager');
            pager.innerHTML = '';
            const prev = document.createElement('button');
            prev.textContent = 'Previous';
            prev.disabled = state.page <= 1;
            prev.onclick = () => runSearch(state.page - 1);
            const next = document.createElement('button');
            next.textContent = 'Next';
            next.disabled = state.page >= pages;
            next.onclick = () => runSearch(state.page + 1);
            pager.append(prev, ` Page ${state.page} of ${Math.max(pages, 1)} `, next);
        }

        function renderFacets(dist) {
            const facets = document.getElementById('facets');
            facets.innerHTML = '';
            [['venue', 'Venue'], ['year', 'Year']].forEach(([field, label]) => {
                const counts = dist[field] || {};
                const h = document.createElement('h3');
                h.textContent = label;
                facets.appendChild(h);
                Object.entries(counts)
                    .sort((a, b) => field === 'year' ? b[0].localeCompare(a[0]) : b[1] - a[1])
                    .forEach(([value, count]) => {
                        const l = document.createElement('label');
                        const box = document.createElement('input');
                        box.type = 'checkbox';
                        box.checked = state[field].has(value);
                        box.onchange = () => {
                            box.checked ? state[field].add(value) : state[field].delete(value);
                            runSearch(1);
                        };
                        l.append(box, ` ${value} (${count})`);
                        facets.appendChild(l);
                    });
            });
        }

        async function explain(paper) {
            const panel = document.getElementById('panel');
            const body = document.getElementById('panel-body');
            document.getElementById('panel-title').textContent = paper.title;
            body.textContent = 'Loading...';
            panel.style.display = 'block';

            try {
                const p = new URLSearchParams({ title: paper.title, venue: paper.venue, year: paper.year });
                if (paper.dblp_key) p.set('key', paper.dblp_key);
                if (paper.ee_link) p.set('ee_link', paper.ee_link);
                (paper.authors || []).forEach(a => p.append('authors', a));
                const bibtex = await (await fetch('/api/bibtex?' + p.toString())).text();

                const res = await fetch('/api/gemini', {
                    method: 'POST',
                    headers: { 'Content-Type': 'application/json' },
                    body: JSON.stringify({ bibtex }),
                });
                if (!res.ok) {
                    const err = await res.json().catch(() => ({}));
                    throw new Error(err.error || 'request failed');
                }

                const reader = res.body.getReader();
                const decoder = new TextDecoder();
                body.textContent = '';
                while (true) {
                    const { done, value } = await reader.read();
                    if (done) break;
                    body.textContent += decoder.decode(value, { stream: true });
                }
            } catch (e) {
                console.error(e);
                body.textContent = 'Sorry, an error occurred while processing your request.';
            }
        }

        function closePanel() {
            document.getElementById('panel').style.display = 'none';
        }

        function escapeHtml(text) {
            const div = document.createElement('div');
            div.textContent = text == null ? '' : String(text);
            return div.innerHTML;
        }

        document.getElementById('q').addEventListener('keypress', e => {
            if (e.key === 'Enter') runSearch(1);
        });
        document.getElementById('sort').addEventListener('change', () => runSearch(1));

        runSearch(1);
    </script>
</body>
</html>
"#;
