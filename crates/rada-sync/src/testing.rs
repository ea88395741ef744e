//! In-memory collaborators for engine and sweep tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rada_adapters::{PortalParser, PreviewExtractor};
use rada_core::{Keywords, TEMP_PREFIX};
use rada_storage::{FetchError, FetchedResponse, Fetcher};
use reqwest::StatusCode;

use crate::{Classifier, SyncEngine, SyncServices};

pub const LISTING: &str = "https://bip.pila.pl/2025.html";

/// Serves canned bodies by URL and records every request.
#[derive(Default)]
pub struct FakeFetcher {
    bodies: HashMap<String, Vec<u8>>,
    failing: Vec<String>,
    requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub fn page(self, url: &str, html: &str) -> Self {
        self.file(url, html.as_bytes())
    }

    pub fn file(mut self, url: &str, body: &[u8]) -> Self {
        self.bodies.insert(url.to_string(), body.to_vec());
        self
    }

    pub fn fail(mut self, url: &str) -> Self {
        self.failing.push(url.to_string());
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests().iter().filter(|u| *u == url).count()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        if self.failing.iter().any(|u| u == url) {
            return Err(FetchError::HttpStatus {
                status: 500,
                url: url.to_string(),
            });
        }
        let body = self
            .bodies
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })?;
        Ok(FetchedResponse {
            status: StatusCode::OK,
            final_url: url.to_string(),
            body,
        })
    }
}

/// Preview text keyed by the attachment's original filename.
#[derive(Default)]
pub struct StaticPreview {
    texts: HashMap<String, String>,
}

impl StaticPreview {
    pub fn text(mut self, original_filename: &str, text: &str) -> Self {
        self.texts.insert(original_filename.to_string(), text.to_string());
        self
    }
}

impl PreviewExtractor for StaticPreview {
    fn preview(&self, path: &Path) -> String {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let original = name.strip_prefix(TEMP_PREFIX).unwrap_or(&name);
        self.texts.get(original).cloned().unwrap_or_default()
    }
}

/// Returns the same keywords for every preview and counts the calls.
pub struct FixedClassifier {
    keywords: Keywords,
    calls: AtomicUsize,
}

impl FixedClassifier {
    pub fn new(keywords: Keywords) -> Arc<Self> {
        Arc::new(Self {
            keywords,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    async fn classify(&self, _preview: &str) -> Keywords {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.keywords.clone()
    }
}

pub fn engine(fetcher: FakeFetcher, preview: StaticPreview, keywords: Keywords) -> (SyncEngine, Arc<FakeFetcher>) {
    engine_with(fetcher, preview, FixedClassifier::new(keywords))
}

pub fn engine_with(
    fetcher: FakeFetcher,
    preview: StaticPreview,
    classifier: Arc<FixedClassifier>,
) -> (SyncEngine, Arc<FakeFetcher>) {
    let fetcher = Arc::new(fetcher);
    let engine = SyncEngine::new(
        fetcher.clone(),
        Arc::new(PortalParser::default()),
        Arc::new(preview),
        classifier,
    );
    (engine, fetcher)
}

pub fn services(fetcher: FakeFetcher, preview: StaticPreview, keywords: Keywords) -> (SyncServices, Arc<FakeFetcher>) {
    let fetcher = Arc::new(fetcher);
    let services = SyncServices::new(
        fetcher.clone(),
        PortalParser::default(),
        Arc::new(preview),
        FixedClassifier::new(keywords),
        LISTING,
    );
    (services, fetcher)
}

fn page(links: &[(&str, &str)]) -> String {
    let anchors: String = links
        .iter()
        .map(|(href, text)| format!("<li><a href=\"{href}\">{text}</a></li>\n"))
        .collect();
    format!("<html><body><ul>\n{anchors}</ul></body></html>")
}

/// Agenda page listing `(href, link text)` attachments.
pub fn agenda_page(links: &[(&str, &str)]) -> String {
    page(links)
}

/// Year listing with one link per `(numeral, href)`, newest first.
pub fn listing_page(sessions: &[(&str, &str)]) -> String {
    let links: Vec<(String, String)> = sessions
        .iter()
        .map(|(numeral, href)| (href.to_string(), format!("{numeral} Sesja Rady Miasta Piły")))
        .collect();
    let borrowed: Vec<(&str, &str)> = links.iter().map(|(h, t)| (h.as_str(), t.as_str())).collect();
    page(&borrowed)
}

/// Session page with a single numbered agenda link.
pub fn session_page(agenda_href: &str, agenda_number: u32) -> String {
    page(&[(agenda_href, &format!("Porządek obrad nr {agenda_number}"))])
}
