//! Sweep orchestration: environment config, the per-agenda sync engine, the
//! four sweep modes, single-flight control and the optional cron schedule.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rada_adapters::{AgendaPolicy, DocumentPreviewer, PortalMatchers, PortalParser, PortalPatterns, PreviewExtractor};
use rada_core::SweepMode;
use rada_storage::{Fetcher, HttpClientConfig, HttpFetcher, MirrorDir};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod classify;
pub mod controller;
pub mod engine;
pub mod journal;
pub mod settings;
pub mod sweep;

#[cfg(test)]
mod testing;

pub use classify::{classifier_from_config, Classifier, NoopClassifier, OpenRouterClassifier};
pub use controller::{ProgressSink, SweepController, SweepError, SweepGuard, TracingSink};
pub use engine::{AgendaSyncReport, AttachmentOutcome, SyncEngine};
pub use journal::ActionLog;
pub use settings::{AppSettings, SettingsError, SettingsStore};
pub use sweep::{SessionSweep, SweepReport};

pub const CRATE_NAME: &str = "rada-sync";

const DEFAULT_OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub portal_url: String,
    pub download_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_connect_timeout_secs: u64,
    pub classifier: ClassifierConfig,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub portal_config_path: PathBuf,
    pub settings_path: PathBuf,
    pub log_path: PathBuf,
    pub web_port: u16,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            portal_url: std::env::var("RADA_PORTAL_URL")
                .unwrap_or_else(|_| "https://bip.pila.pl/2025.html".to_string()),
            download_dir: std::env::var("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            user_agent: std::env::var("RADA_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_number("RADA_HTTP_TIMEOUT_SECS").unwrap_or(60),
            http_connect_timeout_secs: env_number("RADA_HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(10),
            classifier: ClassifierConfig {
                api_key: std::env::var("OPENROUTER_API_KEY").ok(),
                model: std::env::var("OPENROUTER_MODEL")
                    .unwrap_or_else(|_| "nvidia/nemotron-nano-9b-v2:free".to_string()),
                endpoint: std::env::var("OPENROUTER_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_OPENROUTER_ENDPOINT.to_string()),
            },
            scheduler_enabled: std::env::var("RADA_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("RADA_SYNC_CRON").unwrap_or_else(|_| "0 0 7 * * *".to_string()),
            portal_config_path: std::env::var("RADA_PORTAL_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("portal.yaml")),
            settings_path: std::env::var("RADA_SETTINGS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("app_settings.json")),
            log_path: std::env::var("RADA_LOG_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("download_log.json")),
            web_port: env_number("RADA_WEB_PORT").unwrap_or(5000),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            connect_timeout: Duration::from_secs(self.http_connect_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Portal wording and agenda selection, read from `portal.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Overrides `RADA_PORTAL_URL` when set.
    pub listing_url: Option<String>,
    pub agenda_policy: AgendaPolicy,
    pub patterns: PortalPatterns,
}

impl PortalConfig {
    /// A missing file yields the built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parser(&self) -> Result<PortalParser> {
        let matchers = PortalMatchers::compile(&self.patterns).context("compiling portal patterns")?;
        Ok(PortalParser::new(matchers, self.agenda_policy))
    }
}

/// Long-lived collaborators shared by every sweep of a process.
#[derive(Clone)]
pub struct SyncServices {
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<PortalParser>,
    engine: Arc<SyncEngine>,
    listing_url: String,
}

impl SyncServices {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        parser: PortalParser,
        previewer: Arc<dyn PreviewExtractor>,
        classifier: Arc<dyn Classifier>,
        listing_url: impl Into<String>,
    ) -> Self {
        let parser = Arc::new(parser);
        let engine = Arc::new(SyncEngine::new(fetcher.clone(), parser.clone(), previewer, classifier));
        Self {
            fetcher,
            parser,
            engine,
            listing_url: listing_url.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let portal = PortalConfig::load(&config.portal_config_path)?;
        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let listing_url = portal.listing_url.clone().unwrap_or_else(|| config.portal_url.clone());
        Ok(Self::new(
            Arc::new(fetcher),
            portal.parser()?,
            Arc::new(DocumentPreviewer::default()),
            classifier_from_config(&config.classifier)?,
            listing_url,
        ))
    }

    pub fn listing_url(&self) -> &str {
        &self.listing_url
    }

    pub fn sweep(&self, download_dir: impl Into<PathBuf>) -> SessionSweep {
        SessionSweep::new(
            self.engine.clone(),
            self.fetcher.clone(),
            self.parser.clone(),
            MirrorDir::new(download_dir),
            self.listing_url.clone(),
        )
    }
}

/// Runs `guard`'s sweep to completion and settles the controller's status.
pub async fn run_guarded(sweep: &SessionSweep, guard: SweepGuard) -> Result<SweepReport> {
    let mode = guard.mode();
    let token = guard.token();
    let controller = guard.controller().clone();
    info!(%mode, run_id = %guard.run_id(), "sweep started");

    match sweep.run(mode, controller.as_ref(), &token).await {
        Ok(report) => {
            info!(
                %mode,
                sessions = report.sessions_synced,
                failed = report.sessions_failed.len(),
                created = report.attachments.created,
                upgraded = report.attachments.upgraded,
                "sweep finished"
            );
            guard.succeed();
            Ok(report)
        }
        Err(err) => {
            let message = format!("{err:#}");
            controller.status("Download failed", 0, Some(&message));
            controller.action("Download error", &message).await;
            guard.fail(message);
            Err(err)
        }
    }
}

/// One sweep outside the web process, e.g. from the CLI.
pub async fn run_sweep_once_from_env(mode: SweepMode) -> Result<SweepReport> {
    let config = SyncConfig::from_env();
    let settings = SettingsStore::load_or_default(&config.settings_path, &config.download_dir);
    let services = SyncServices::from_config(&config)?;
    let controller = Arc::new(SweepController::new(Some(Arc::new(ActionLog::new(&config.log_path)))));
    let guard = controller.try_begin(mode)?;
    run_guarded(&services.sweep(settings.download_dir()), guard).await
}

/// Daily latest-only sweep, when `RADA_SCHEDULER_ENABLED` is set.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    services: SyncServices,
    controller: Arc<SweepController>,
    settings: Arc<SettingsStore>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let services = services.clone();
        let controller = controller.clone();
        let settings = settings.clone();
        Box::pin(async move {
            let guard = match controller.try_begin(SweepMode::Latest) {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(error = %err, "scheduled sweep skipped");
                    return;
                }
            };
            let sweep = services.sweep(settings.download_dir());
            if let Err(err) = run_guarded(&sweep, guard).await {
                warn!(error = %format!("{err:#}"), "scheduled sweep failed");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_portal_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let cfg = PortalConfig::load(&dir.path().join("portal.yaml")).unwrap();
        assert_eq!(cfg, PortalConfig::default());
        assert!(cfg.parser().is_ok());
    }

    #[test]
    fn portal_config_overrides_policy_and_patterns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("portal.yaml");
        std::fs::write(
            &path,
            "listing_url: https://bip.pila.pl/2026.html\nagenda_policy: first_listed\npatterns:\n  agenda_label: harmonogram\n",
        )
        .unwrap();

        let cfg = PortalConfig::load(&path).unwrap();
        assert_eq!(cfg.listing_url.as_deref(), Some("https://bip.pila.pl/2026.html"));
        assert_eq!(cfg.agenda_policy, AgendaPolicy::FirstListed);
        assert_eq!(cfg.patterns.agenda_label, "harmonogram");
        assert_eq!(cfg.patterns.session_label, PortalPatterns::default().session_label);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let cfg = PortalConfig {
            patterns: PortalPatterns {
                druk: "DRUK(".into(),
                ..PortalPatterns::default()
            },
            ..PortalConfig::default()
        };
        assert!(cfg.parser().is_err());
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let dir = tempdir().unwrap();
        let config = SyncConfig {
            scheduler_enabled: false,
            ..SyncConfig::from_env()
        };
        let (services, _) = testing::services(
            testing::FakeFetcher::default(),
            testing::StaticPreview::default(),
            rada_core::Keywords::empty(),
        );
        let settings = Arc::new(SettingsStore::load_or_default(&dir.path().join("s.json"), dir.path()));
        let controller = Arc::new(SweepController::new(None));
        let sched = maybe_build_scheduler(&config, services, controller, settings).await.unwrap();
        assert!(sched.is_none());
    }
}
