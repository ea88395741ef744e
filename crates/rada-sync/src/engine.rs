//! Per-agenda sync: decides for every attachment whether to skip it, create a
//! new entry, or upgrade a bare entry in place, without ever producing a second
//! file for the same druk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use rada_adapters::{PortalParser, PreviewExtractor};
use rada_core::{final_filename, upgraded_filename, AttachmentLink, DrukNumber, Keywords, MirrorEntry};
use rada_storage::{discard, promote, rename_entry, temp_path, Fetcher, MirrorIndex};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{Classifier, MIN_PREVIEW_CHARS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttachmentOutcome {
    /// An enriched entry already exists for the druk.
    Skipped { filename: String },
    Created { filename: String },
    /// A bare entry gained keywords.
    Upgraded { from: String, to: String },
    /// A bare entry exists and no keywords were available.
    Unchanged { filename: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgendaSyncReport {
    pub attachments: usize,
    pub skipped: usize,
    pub created: usize,
    pub upgraded: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl AgendaSyncReport {
    fn record(&mut self, outcome: &AttachmentOutcome) {
        match outcome {
            AttachmentOutcome::Skipped { .. } => self.skipped += 1,
            AttachmentOutcome::Created { .. } => self.created += 1,
            AttachmentOutcome::Upgraded { .. } => self.upgraded += 1,
            AttachmentOutcome::Unchanged { .. } => self.unchanged += 1,
        }
    }

    pub fn merge(&mut self, other: &AgendaSyncReport) {
        self.attachments += other.attachments;
        self.skipped += other.skipped;
        self.created += other.created;
        self.upgraded += other.upgraded;
        self.unchanged += other.unchanged;
        self.failed += other.failed;
        self.cancelled |= other.cancelled;
    }
}

/// One async mutex per agenda directory; concurrent passes over the same
/// directory are serialized.
#[derive(Debug, Default)]
struct DirectoryLocks {
    inner: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl DirectoryLocks {
    fn for_dir(&self, dir: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(dir.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

pub struct SyncEngine {
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<PortalParser>,
    previewer: Arc<dyn PreviewExtractor>,
    classifier: Arc<dyn Classifier>,
    dir_locks: DirectoryLocks,
}

impl SyncEngine {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        parser: Arc<PortalParser>,
        previewer: Arc<dyn PreviewExtractor>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            fetcher,
            parser,
            previewer,
            classifier,
            dir_locks: DirectoryLocks::default(),
        }
    }

    /// Syncs every attachment of the agenda page at `agenda_url` into `dir`.
    /// Per-attachment failures are counted and the pass continues.
    pub async fn sync_agenda(
        &self,
        agenda_url: &str,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<AgendaSyncReport> {
        let html = self
            .fetcher
            .fetch_text(agenda_url)
            .await
            .with_context(|| format!("fetching agenda page {agenda_url}"))?;
        let links = self.parser.attachments(&html, agenda_url)?;

        let lock = self.dir_locks.for_dir(dir);
        let _held = lock.lock().await;
        let mut index = MirrorIndex::load(dir).await?;
        let mut report = AgendaSyncReport {
            attachments: links.len(),
            ..AgendaSyncReport::default()
        };

        for link in &links {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.sync_attachment(link, &mut index).await {
                Ok(outcome) => report.record(&outcome),
                Err(err) => {
                    warn!(url = %link.url, error = %format!("{err:#}"), "attachment sync failed");
                    report.failed += 1;
                }
            }
        }

        debug!(agenda = agenda_url, ?report, "agenda pass complete");
        Ok(report)
    }

    /// Applies the druk state machine to one attachment. On error no temp file
    /// is left behind.
    pub async fn sync_attachment(&self, link: &AttachmentLink, index: &mut MirrorIndex) -> Result<AttachmentOutcome> {
        let entry = link
            .druk
            .as_ref()
            .map(|druk| index.lookup(druk))
            .unwrap_or(MirrorEntry::Absent);
        if let MirrorEntry::Enriched { filename } = entry {
            debug!(%filename, "enriched entry present; not fetching");
            return Ok(AttachmentOutcome::Skipped { filename });
        }

        let temp = temp_path(index.dir(), &link.original_filename);
        let result = match self.fetcher.download_to(&link.url, &temp).await {
            Ok(_) => self.settle(link, index, &temp, link.druk.clone(), entry).await,
            Err(err) => Err(anyhow::Error::new(err).context(format!("downloading {}", link.url))),
        };
        if result.is_err() {
            discard(&temp).await?;
        }
        result
    }

    async fn settle(
        &self,
        link: &AttachmentLink,
        index: &mut MirrorIndex,
        temp: &Path,
        mut druk: Option<DrukNumber>,
        mut entry: MirrorEntry,
    ) -> Result<AttachmentOutcome> {
        let preview = self.preview(temp).await;
        let keywords = if preview.trim().chars().count() >= MIN_PREVIEW_CHARS {
            self.classifier.classify(&preview).await
        } else {
            Keywords::empty()
        };

        if druk.is_none() {
            druk = self.parser.matchers().druk_in_text(&preview);
            if let Some(found) = &druk {
                debug!(druk = %found, file = %link.original_filename, "druk recovered from document text");
                entry = index.lookup(found);
            }
        }

        let dir = index.dir().to_path_buf();
        match (entry, druk) {
            (MirrorEntry::Enriched { filename }, _) => {
                discard(temp).await?;
                Ok(AttachmentOutcome::Skipped { filename })
            }
            (MirrorEntry::Bare { filename }, Some(druk)) => {
                let target = upgraded_filename(&druk, &filename, &keywords);
                rename_entry(&dir, &filename, &target).await?;
                index.record_rename(&filename, &target);
                discard(temp).await?;
                if target == filename {
                    Ok(AttachmentOutcome::Unchanged { filename })
                } else {
                    info!(%druk, from = %filename, to = %target, "upgraded bare entry");
                    Ok(AttachmentOutcome::Upgraded { from: filename, to: target })
                }
            }
            (_, druk) => {
                let target = final_filename(druk.as_ref(), &link.original_filename, &keywords);
                promote(temp, &dir, &target).await?;
                index.record(target.clone());
                info!(file = %target, druk = ?druk.as_ref().map(DrukNumber::as_str), "stored attachment");
                Ok(AttachmentOutcome::Created { filename: target })
            }
        }
    }

    async fn preview(&self, path: &Path) -> String {
        let previewer = self.previewer.clone();
        let path = path.to_path_buf();
        match tokio::task::spawn_blocking(move || previewer.preview(&path)).await {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "preview task failed");
                String::new()
            }
        }
    }
}
