//! HTTP fetch utilities and the on-disk session mirror.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rada_core::{
    agenda_dir_name, parse_session_dir_name, session_dir_name, temp_filename, DrukNumber,
    MirrorEntry, AGENDA_DIR_PREFIX, SESSION_DIR_PREFIX, TEMP_PREFIX,
};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "rada-storage";

/// Root of the local mirror: `<root>/Sesja<n>/Porzadek<m>/<file>`.
#[derive(Debug, Clone)]
pub struct MirrorDir {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirroredFile {
    pub filename: String,
    pub sesja: String,
    pub porzadek: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Path relative to the mirror root, `/`-separated.
    pub path: String,
}

impl MirrorDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_number: u32) -> PathBuf {
        self.root.join(session_dir_name(session_number))
    }

    pub fn agenda_dir(&self, session_number: u32, agenda_number: u32) -> PathBuf {
        self.session_dir(session_number).join(agenda_dir_name(agenda_number))
    }

    pub async fn ensure_agenda_dir(&self, session_number: u32, agenda_number: u32) -> anyhow::Result<PathBuf> {
        let dir = self.agenda_dir(session_number, agenda_number);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating agenda directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Session numbers already mirrored locally, ascending.
    pub async fn existing_sessions(&self) -> anyhow::Result<Vec<u32>> {
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking mirror root {}", self.root.display()))?
        {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading mirror root {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(n) = parse_session_dir_name(&entry.file_name().to_string_lossy()) {
                sessions.push(n);
            }
        }
        sessions.sort_unstable();
        sessions.dedup();
        Ok(sessions)
    }

    /// Every mirrored file under `Sesja*/Porzadek*/`, sorted by relative path.
    pub async fn list_files(&self) -> anyhow::Result<Vec<MirroredFile>> {
        let mut out = Vec::new();
        for session in subdirs_with_prefix(&self.root, SESSION_DIR_PREFIX).await? {
            for agenda in subdirs_with_prefix(&session, AGENDA_DIR_PREFIX).await? {
                let mut entries = fs::read_dir(&agenda)
                    .await
                    .with_context(|| format!("reading {}", agenda.display()))?;
                while let Some(entry) = entries.next_entry().await? {
                    let meta = entry.metadata().await?;
                    if !meta.is_file() {
                        continue;
                    }
                    let filename = entry.file_name().to_string_lossy().to_string();
                    let sesja = dir_label(&session);
                    let porzadek = dir_label(&agenda);
                    out.push(MirroredFile {
                        path: format!("{sesja}/{porzadek}/{filename}"),
                        filename,
                        sesja,
                        porzadek,
                        size: meta.len(),
                        modified: meta.modified().ok().map(DateTime::<Utc>::from),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Maps a dashboard-supplied relative path into the mirror; `None` if it escapes the root.
    pub fn resolve_relative(&self, relative: &str) -> Option<PathBuf> {
        let rel = Path::new(relative);
        if relative.is_empty() || !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        Some(self.root.join(rel))
    }
}

async fn subdirs_with_prefix(dir: &Path, prefix: &str) -> anyhow::Result<Vec<PathBuf>> {
    if !fs::try_exists(dir).await? {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() && entry.file_name().to_string_lossy().starts_with(prefix) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

fn dir_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// True when `filename` belongs to `druk`: it starts with `DRUK_NR<id>` and the
/// identifier is not followed by a further digit.
pub fn entry_matches_druk(filename: &str, druk: &DrukNumber) -> bool {
    filename
        .strip_prefix(&druk.stem())
        .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_digit()))
}

/// Snapshot of one agenda directory's file names, kept current by the sync
/// engine as it creates and renames entries during a pass.
#[derive(Debug, Clone)]
pub struct MirrorIndex {
    dir: PathBuf,
    names: BTreeSet<String>,
}

impl MirrorIndex {
    pub async fn load(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        let mut names = BTreeSet::new();
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing mirror directory {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(TEMP_PREFIX) {
                names.insert(name);
            }
        }
        Ok(Self { dir, names })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn lookup(&self, druk: &DrukNumber) -> MirrorEntry {
        self.names
            .iter()
            .find(|name| entry_matches_druk(name, druk))
            .map(|name| MirrorEntry::classify(druk, name))
            .unwrap_or(MirrorEntry::Absent)
    }

    pub fn record(&mut self, filename: impl Into<String>) {
        self.names.insert(filename.into());
    }

    pub fn record_rename(&mut self, from: &str, to: &str) {
        self.names.remove(from);
        self.names.insert(to.to_string());
    }
}

/// One-shot directory scan for a single identifier.
pub async fn lookup_druk(dir: impl Into<PathBuf>, druk: &DrukNumber) -> anyhow::Result<MirrorEntry> {
    Ok(MirrorIndex::load(dir).await?.lookup(druk))
}

pub fn temp_path(dir: &Path, original_filename: &str) -> PathBuf {
    dir.join(temp_filename(original_filename))
}

/// Moves a fully written temp file to its final name inside `dir`.
pub async fn promote(temp: &Path, dir: &Path, final_name: &str) -> anyhow::Result<PathBuf> {
    let target = dir.join(final_name);
    fs::rename(temp, &target).await.with_context(|| {
        format!("renaming {} -> {}", temp.display(), target.display())
    })?;
    Ok(target)
}

/// Renames an existing entry in place; renaming to the same name is a no-op.
pub async fn rename_entry(dir: &Path, from: &str, to: &str) -> anyhow::Result<()> {
    if from == to {
        return Ok(());
    }
    let (src, dst) = (dir.join(from), dir.join(to));
    fs::rename(&src, &dst)
        .await
        .with_context(|| format!("renaming {} -> {}", src.display(), dst.display()))
}

pub async fn discard(temp: &Path) -> anyhow::Result<()> {
    match fs::remove_file(temp).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", temp.display())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of portal pages and attachment bodies.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError>;

    async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }

    /// Fetches `url` fully and writes the body to `dest`. Returns the byte count.
    async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, FetchError> {
        let resp = self.fetch_bytes(url).await?;
        fs::write(dest, &resp.body).await.map_err(|source| FetchError::Io {
            path: dest.to_path_buf(),
            source,
        })?;
        Ok(resp.body.len() as u64)
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(bytes = body.len(), "fetched");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", url))
            .await
    }
}
