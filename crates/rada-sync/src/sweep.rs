//! Session discovery and the four sweep modes.

use std::sync::Arc;

use anyhow::{Context, Result};
use rada_adapters::PortalParser;
use rada_core::{AgendaRef, SessionRef, SweepMode};
use rada_storage::{Fetcher, MirrorDir};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::{ProgressSink, SweepError};
use crate::engine::{AgendaSyncReport, SyncEngine};

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub mode: Option<SweepMode>,
    pub sessions_total: usize,
    pub sessions_synced: usize,
    pub sessions_failed: Vec<u32>,
    pub attachments: AgendaSyncReport,
    pub cancelled: bool,
}

impl SweepReport {
    fn new(mode: SweepMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    fn absorb(&mut self, agenda: &AgendaSyncReport) {
        self.sessions_synced += 1;
        self.attachments.merge(agenda);
        self.cancelled |= agenda.cancelled;
    }
}

/// Discovers sessions on the year listing and syncs their latest agendas into
/// one mirror root.
pub struct SessionSweep {
    engine: Arc<SyncEngine>,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<PortalParser>,
    mirror: MirrorDir,
    listing_url: String,
}

impl SessionSweep {
    pub fn new(
        engine: Arc<SyncEngine>,
        fetcher: Arc<dyn Fetcher>,
        parser: Arc<PortalParser>,
        mirror: MirrorDir,
        listing_url: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            fetcher,
            parser,
            mirror,
            listing_url: listing_url.into(),
        }
    }

    pub fn mirror(&self) -> &MirrorDir {
        &self.mirror
    }

    pub async fn latest_session(&self) -> Result<SessionRef> {
        let html = self.listing().await?;
        Ok(self.parser.latest_session(&html, &self.listing_url)?)
    }

    /// Sessions in listing order (newest first on the portal).
    pub async fn all_sessions(&self) -> Result<Vec<SessionRef>> {
        let html = self.listing().await?;
        Ok(self.parser.all_sessions(&html, &self.listing_url)?)
    }

    pub async fn latest_agenda(&self, session: &SessionRef) -> Result<AgendaRef> {
        let html = self
            .fetcher
            .fetch_text(&session.url)
            .await
            .with_context(|| format!("fetching session {} page {}", session.number, session.url))?;
        self.parser
            .latest_agenda(&html, &session.url)
            .with_context(|| format!("session {}", session.number))
    }

    /// Latest session and its authoritative agenda, without syncing anything.
    pub async fn discover_latest(&self) -> Result<(SessionRef, AgendaRef)> {
        let session = self.latest_session().await?;
        let agenda = self.latest_agenda(&session).await?;
        Ok((session, agenda))
    }

    /// Resolves the session's latest agenda and syncs it into
    /// `Sesja<n>/Porzadek<m>`.
    pub async fn sync_session(&self, session: &SessionRef, cancel: &CancellationToken) -> Result<AgendaSyncReport> {
        let agenda = self.latest_agenda(session).await?;
        self.sync_resolved(session, &agenda, cancel).await
    }

    async fn sync_resolved(
        &self,
        session: &SessionRef,
        agenda: &AgendaRef,
        cancel: &CancellationToken,
    ) -> Result<AgendaSyncReport> {
        let dir = self.mirror.ensure_agenda_dir(session.number, agenda.number).await?;
        info!(session = session.number, agenda = agenda.number, dir = %dir.display(), "syncing agenda");
        self.engine.sync_agenda(&agenda.url, &dir, cancel).await
    }

    pub async fn run(&self, mode: SweepMode, sink: &dyn ProgressSink, cancel: &CancellationToken) -> Result<SweepReport> {
        let report = match mode {
            SweepMode::Latest => self.run_latest(sink, cancel).await?,
            SweepMode::UpdateExisting => self.run_update_existing(sink, cancel).await?,
            SweepMode::Session(number) => self.run_single(number, sink, cancel).await?,
            SweepMode::Backfill => self.run_backfill(sink, cancel).await?,
        };
        if report.cancelled {
            sink.status("Download cancelled", 100, None);
            sink.action("Download cancelled", &format!("{mode} sweep stopped early")).await;
        }
        Ok(report)
    }

    async fn run_latest(&self, sink: &dyn ProgressSink, cancel: &CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::new(SweepMode::Latest);

        sink.status("Looking for the latest session...", 10, None);
        let session = self.latest_session().await?;

        sink.status("Looking for the latest agenda...", 30, None);
        let agenda = self.latest_agenda(&session).await?;
        report.sessions_total = 1;

        sink.status(
            &format!("Downloading files of session {}, agenda {}...", session.number, agenda.number),
            50,
            None,
        );
        let synced = self.sync_resolved(&session, &agenda, cancel).await?;
        report.absorb(&synced);

        if !report.cancelled {
            sink.status("Finished successfully", 100, None);
            sink.action(
                "Downloaded latest files",
                &format!("Session {}, agenda {}", session.number, agenda.number),
            )
            .await;
        }
        Ok(report)
    }

    async fn run_update_existing(&self, sink: &dyn ProgressSink, cancel: &CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::new(SweepMode::UpdateExisting);

        sink.status("Checking existing sessions...", 5, None);
        let existing = self.mirror.existing_sessions().await?;
        if existing.is_empty() {
            sink.status("No existing sessions to update", 100, Some("No sessions found locally"));
            sink.action("No sessions to update", "The download folder is empty").await;
            return Ok(report);
        }

        sink.status("Looking up all sessions online...", 10, None);
        let targets: Vec<SessionRef> = self
            .all_sessions()
            .await?
            .into_iter()
            .filter(|s| existing.contains(&s.number))
            .collect();
        report.sessions_total = targets.len();
        sink.status(&format!("Found {} sessions to update", targets.len()), 15, None);

        self.sync_each(&targets, 15, 80, "Updating", sink, cancel, &mut report).await;

        if !report.cancelled {
            sink.status("Finished updating existing sessions", 100, None);
            sink.action(
                "Updated existing sessions",
                &format!("Updated {} sessions", report.sessions_total),
            )
            .await;
        }
        Ok(report)
    }

    async fn run_single(&self, number: u32, sink: &dyn ProgressSink, cancel: &CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::new(SweepMode::Session(number));

        sink.status(&format!("Looking for session {number}..."), 20, None);
        let session = self
            .all_sessions()
            .await?
            .into_iter()
            .find(|s| s.number == number)
            .ok_or(SweepError::SessionNotFound(number))?;
        report.sessions_total = 1;

        sink.status(&format!("Downloading session {number}..."), 50, None);
        let synced = self.sync_session(&session, cancel).await?;
        report.absorb(&synced);

        if !report.cancelled {
            sink.status(&format!("Finished downloading session {number}"), 100, None);
            sink.action(&format!("Downloaded session {number}"), "").await;
        }
        Ok(report)
    }

    async fn run_backfill(&self, sink: &dyn ProgressSink, cancel: &CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::new(SweepMode::Backfill);

        sink.status("Looking up all sessions...", 5, None);
        let mut sessions = self.all_sessions().await?;
        sessions.sort_by_key(|s| s.number);
        report.sessions_total = sessions.len();
        sink.status(&format!("Found {} sessions to download", sessions.len()), 10, None);

        self.sync_each(&sessions, 10, 85, "Downloading", sink, cancel, &mut report).await;

        if !report.cancelled {
            sink.status("Finished downloading all sessions", 100, None);
            sink.action(
                "Downloaded all sessions from the first",
                &format!("Downloaded {} sessions", report.sessions_total),
            )
            .await;
        }
        Ok(report)
    }

    /// Syncs sessions in order; a failing session is recorded and skipped.
    #[allow(clippy::too_many_arguments)]
    async fn sync_each(
        &self,
        sessions: &[SessionRef],
        base: usize,
        span: usize,
        verb: &str,
        sink: &dyn ProgressSink,
        cancel: &CancellationToken,
        report: &mut SweepReport,
    ) {
        let total = sessions.len().max(1);
        for (i, session) in sessions.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let progress = (base + i * span / total) as u8;
            sink.status(&format!("{verb} session {}...", session.number), progress, None);

            match self.sync_session(session, cancel).await {
                Ok(synced) => report.absorb(&synced),
                Err(err) => {
                    warn!(session = session.number, error = %format!("{err:#}"), "session sync failed; continuing");
                    report.sessions_failed.push(session.number);
                }
            }
            if report.cancelled {
                break;
            }
        }
    }

    async fn listing(&self) -> Result<String> {
        self.fetcher
            .fetch_text(&self.listing_url)
            .await
            .with_context(|| format!("fetching session listing {}", self.listing_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{SweepController, TracingSink};
    use crate::testing::{agenda_page, listing_page, services, session_page, FakeFetcher, StaticPreview, LISTING};
    use rada_core::{Keywords, SweepPhase};
    use std::path::Path;
    use tempfile::tempdir;

    const BASE: &str = "https://bip.pila.pl";

    fn portal() -> FakeFetcher {
        FakeFetcher::default()
            .page(
                LISTING,
                &listing_page(&[
                    ("XII", "/2025/sesja-xii.html"),
                    ("XI", "/2025/sesja-xi.html"),
                    ("X", "/2025/sesja-x.html"),
                ]),
            )
            .page(&format!("{BASE}/2025/sesja-xii.html"), &session_page("/2025/xii/porzadek-2.html", 2))
            .page(&format!("{BASE}/2025/sesja-xi.html"), &session_page("/2025/xi/porzadek-1.html", 1))
            .page(&format!("{BASE}/2025/sesja-x.html"), &session_page("/2025/x/porzadek-3.html", 3))
            .page(
                &format!("{BASE}/2025/xii/porzadek-2.html"),
                &agenda_page(&[("/files/d120.pdf", "DRUK NR 120"), ("/files/opinia.pdf", "Opinia komisji")]),
            )
            .page(
                &format!("{BASE}/2025/xi/porzadek-1.html"),
                &agenda_page(&[("/files/d110.pdf", "DRUK NR 110")]),
            )
            .page(
                &format!("{BASE}/2025/x/porzadek-3.html"),
                &agenda_page(&[("/files/d100.docx", "DRUK NR 100")]),
            )
            .file(&format!("{BASE}/files/d120.pdf"), b"120")
            .file(&format!("{BASE}/files/opinia.pdf"), b"op")
            .file(&format!("{BASE}/files/d110.pdf"), b"110")
            .file(&format!("{BASE}/files/d100.docx"), b"100")
    }

    fn preview() -> StaticPreview {
        StaticPreview::default()
            .text("d120.pdf", "Projekt uchwały w sprawie budżetu")
            .text("opinia.pdf", "Opinia komisji budżetowej do projektu")
            .text("d110.pdf", "Projekt uchwały w sprawie podatków")
            .text("d100.docx", "Projekt uchwały w sprawie nazwy ulicy")
    }

    fn count_files(root: &Path) -> usize {
        let mut count = 0;
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    count += 1;
                }
            }
        }
        count
    }

    #[tokio::test]
    async fn latest_mode_mirrors_newest_session_agenda() {
        let dir = tempdir().unwrap();
        let (services, _) = services(portal(), preview(), Keywords::new(["budżet", "miasta"]));
        let sweep = services.sweep(dir.path());

        let report = sweep
            .run(SweepMode::Latest, &TracingSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.sessions_synced, 1);
        let agenda_dir = dir.path().join("Sesja12/Porzadek2");
        assert!(agenda_dir.join("DRUK_NR120_budżet_miasta.pdf").is_file());
        assert!(agenda_dir.join("budżet_miasta.pdf").is_file());
    }

    #[tokio::test]
    async fn backfill_runs_oldest_first_and_second_pass_refetches_nothing_enriched() {
        let dir = tempdir().unwrap();
        let (services, fetcher) = services(portal(), preview(), Keywords::new(["temat"]));
        let sweep = services.sweep(dir.path());
        let token = CancellationToken::new();

        let first = sweep.run(SweepMode::Backfill, &TracingSink, &token).await.unwrap();
        assert_eq!(first.sessions_synced, 3);
        let files_after_first = count_files(dir.path());
        assert_eq!(files_after_first, 4);

        let sessions_order: Vec<String> = fetcher
            .requests()
            .into_iter()
            .filter(|u| u.contains("/2025/sesja-"))
            .collect();
        assert_eq!(
            sessions_order,
            vec![
                format!("{BASE}/2025/sesja-x.html"),
                format!("{BASE}/2025/sesja-xi.html"),
                format!("{BASE}/2025/sesja-xii.html"),
            ]
        );

        let second = sweep.run(SweepMode::Backfill, &TracingSink, &token).await.unwrap();
        assert_eq!(second.attachments.skipped, 3);
        assert_eq!(count_files(dir.path()), files_after_first);
        for druk_url in ["d120.pdf", "d110.pdf", "d100.docx"] {
            assert_eq!(fetcher.request_count(&format!("{BASE}/files/{druk_url}")), 1);
        }
    }

    #[tokio::test]
    async fn update_existing_continues_past_a_failing_session() {
        let dir = tempdir().unwrap();
        for n in [10, 11, 12] {
            std::fs::create_dir_all(dir.path().join(format!("Sesja{n}"))).unwrap();
        }
        let fetcher = portal().fail(&format!("{BASE}/2025/sesja-xii.html"));
        let (services, _) = services(fetcher, preview(), Keywords::empty());
        let sweep = services.sweep(dir.path());

        let report = sweep
            .run(SweepMode::UpdateExisting, &TracingSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.sessions_total, 3);
        assert_eq!(report.sessions_failed, vec![12]);
        assert_eq!(report.sessions_synced, 2);
        assert!(dir.path().join("Sesja11/Porzadek1/DRUK_NR110.pdf").is_file());
        assert!(dir.path().join("Sesja10/Porzadek3/DRUK_NR100.docx").is_file());
    }

    #[tokio::test]
    async fn update_existing_with_empty_mirror_reports_and_stops() {
        let dir = tempdir().unwrap();
        let (services, fetcher) = services(portal(), preview(), Keywords::empty());
        let controller = Arc::new(SweepController::new(None));
        let guard = controller.try_begin(SweepMode::UpdateExisting).unwrap();

        let report = crate::run_guarded(&services.sweep(dir.path()), guard).await.unwrap();

        assert_eq!(report.sessions_total, 0);
        assert!(fetcher.requests().is_empty());
        let status = controller.snapshot();
        assert_eq!(status.phase, SweepPhase::Succeeded);
        assert_eq!(status.progress, 100);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn unknown_session_fails_the_sweep() {
        let dir = tempdir().unwrap();
        let (services, _) = services(portal(), preview(), Keywords::empty());
        let controller = Arc::new(SweepController::new(None));
        let guard = controller.try_begin(SweepMode::Session(99)).unwrap();

        let err = crate::run_guarded(&services.sweep(dir.path()), guard).await.unwrap_err();

        assert!(matches!(err.downcast_ref::<SweepError>(), Some(SweepError::SessionNotFound(99))));
        let status = controller.snapshot();
        assert_eq!(status.phase, SweepPhase::Failed);
        assert_eq!(status.progress, 0);
    }

    #[tokio::test]
    async fn single_session_mode_syncs_only_that_session() {
        let dir = tempdir().unwrap();
        let (services, _) = services(portal(), preview(), Keywords::empty());

        let report = services
            .sweep(dir.path())
            .run(SweepMode::Session(11), &TracingSink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.sessions_synced, 1);
        assert_eq!(count_files(dir.path()), 1);
        assert!(dir.path().join("Sesja11/Porzadek1/DRUK_NR110.pdf").is_file());
    }

    #[tokio::test]
    async fn cancelled_backfill_syncs_nothing() {
        let dir = tempdir().unwrap();
        let (services, _) = services(portal(), preview(), Keywords::empty());
        let token = CancellationToken::new();
        token.cancel();

        let report = services
            .sweep(dir.path())
            .run(SweepMode::Backfill, &TracingSink, &token)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.sessions_synced, 0);
    }
}
