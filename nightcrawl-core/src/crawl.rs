use crate::alert::{AlertSink, LogAlertSink, WebhookAlertSink};
use crate::analyzer::{DeepAnalyzer, HttpAnalyzer};
use crate::config::EngineConfig;
use crate::data::{retry_once, Database, FailedUrl, PageRecord, ThreatLevel};
use crate::error::{CoreError, Result};
use crate::graph::{LinkGraph, node_key};
use crate::threat::ThreatClassifier;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use nightcrawl_scanner::blocking::{HttpRenderService, RenderService};
use nightcrawl_scanner::crawler::{FailureCallback, PageCallback, ProgressCallback};
use nightcrawl_scanner::frontier::Frontier;
use nightcrawl_scanner::proxy::ControlPortRefresher;
use nightcrawl_scanner::{
    CrawlFailure, CrawlStats, Crawler, FailureReason, ProxyRouter, RecoveryPolicy, ScannedPage,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

/// Options for one crawl run
pub struct CrawlOptions {
    pub seeds: Vec<String>,
    pub config: EngineConfig,
    pub show_progress_bars: bool,
}

/// Callback for reporting crawl progress
pub type CrawlProgressCallback = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub session_id: String,
    pub status: RunStatus,
    pub stats: CrawlStats,
    pub node_count: i64,
    pub edge_count: i64,
    pub threat_counts: Vec<(ThreatLevel, i64)>,
    pub top_nodes: Vec<(String, f64)>,
    pub failed_urls: Vec<FailedUrl>,
    /// False if analyzer tasks were still running when the run ended.
    pub analysis_drained: bool,
}

/// Wires storage, classification and the link graph around a scanner
/// `Crawler`. Collaborators not injected are built from the config.
pub struct CrawlEngine {
    config: EngineConfig,
    db: Arc<Database>,
    analyzer: Option<Arc<dyn DeepAnalyzer>>,
    alert_sink: Option<Arc<dyn AlertSink>>,
    renderer: Option<Arc<dyn RenderService>>,
    progress_callback: Option<ProgressCallback>,
}

impl CrawlEngine {
    pub fn new(config: EngineConfig, db: Arc<Database>) -> Self {
        Self {
            config,
            db,
            analyzer: None,
            alert_sink: None,
            renderer: None,
            progress_callback: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn DeepAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alert_sink = Some(sink);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn RenderService>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    fn analyzer(&self) -> Result<Option<Arc<dyn DeepAnalyzer>>> {
        if let Some(analyzer) = &self.analyzer {
            return Ok(Some(analyzer.clone()));
        }
        let settings = &self.config.analyzer;
        match &settings.endpoint {
            Some(endpoint) => Ok(Some(Arc::new(HttpAnalyzer::new(
                endpoint,
                settings.api_key.clone(),
                Duration::from_secs(settings.timeout_secs),
            )?))),
            None => Ok(None),
        }
    }

    fn alert_sink(&self) -> Result<Arc<dyn AlertSink>> {
        if let Some(sink) = &self.alert_sink {
            return Ok(sink.clone());
        }
        match &self.config.alert_webhook {
            Some(url) => Ok(Arc::new(WebhookAlertSink::new(url)?)),
            None => Ok(Arc::new(LogAlertSink)),
        }
    }

    fn renderer(&self) -> Result<Option<Arc<dyn RenderService>>> {
        if let Some(renderer) = &self.renderer {
            return Ok(Some(renderer.clone()));
        }
        match &self.config.render_endpoint {
            Some(endpoint) => Ok(Some(Arc::new(HttpRenderService::new(
                endpoint,
                Duration::from_secs(self.config.render_timeout_secs),
            )?))),
            None => Ok(None),
        }
    }

    fn router(&self) -> Result<ProxyRouter> {
        let mut router = ProxyRouter::new(self.config.routes.clone(), self.config.router_config())?;
        if let Some(address) = &self.config.control_port {
            router = router.with_refresher(Arc::new(ControlPortRefresher::new(
                address,
                self.config.control_password.clone(),
            )));
        }
        for (host, route_id) in &self.config.route_pins {
            router.force_route(host, route_id)?;
            debug!("Pinned {} to route {}", host, route_id);
        }
        Ok(router)
    }

    /// Run one crawl session to exhaustion, page cap or cancellation.
    pub async fn run(&self, seeds: &[String], cancel: CancellationToken) -> Result<CrawlSummary> {
        let seed_urls = parse_seeds(seeds)?;
        self.config.validate()?;

        let config_json = serde_json::to_string(&self.config)?;
        let session_id = self.db.create_session(seeds, Some(&config_json))?;
        info!("Crawl session {} started", session_id);

        let frontier = Arc::new(Frontier::new(self.config.frontier_config()));
        let router = Arc::new(self.router()?);

        let mut classifier = ThreatClassifier::new(
            self.db.clone(),
            &self.config.keywords,
            self.config.analyzer.requests_per_second,
        )
        .with_alert_sink(self.alert_sink()?);
        if let Some(analyzer) = self.analyzer()? {
            classifier = classifier.with_analyzer(analyzer, self.config.analyzer.max_content_chars);
        }
        let classifier = Arc::new(classifier);
        let graph = Arc::new(LinkGraph::new(self.db.clone()));

        let writer = StorageWriter::new();
        let page_callback: PageCallback = {
            let db = self.db.clone();
            let frontier = frontier.clone();
            let classifier = classifier.clone();
            let graph = graph.clone();
            let writer = writer.clone();
            Arc::new(move |page: &ScannedPage| {
                let (db, frontier, graph, classifier) =
                    (db.clone(), frontier.clone(), graph.clone(), classifier.clone());
                let page = page.clone();
                writer.submit(move || persist_page(&db, &frontier, &graph, &classifier, &page));
            })
        };
        let failure_callback: FailureCallback = {
            let db = self.db.clone();
            let writer = writer.clone();
            Arc::new(move |failure: &CrawlFailure| {
                if failure.reason == FailureReason::Cancelled {
                    return;
                }
                let db = db.clone();
                let failure = failure.clone();
                writer.submit(move || {
                    retry_once("record failed url", || {
                        db.record_failed_url(&failure.url, &failure.domain, &failure.reason.as_str())
                    });
                });
            })
        };

        let mut crawler = Crawler::new(frontier, router, self.config.crawler_config())?
            .with_recovery(RecoveryPolicy::new(self.config.recovery_config()))
            .with_page_callback(page_callback)
            .with_failure_callback(failure_callback);
        if let Some(renderer) = self.renderer()? {
            crawler = crawler.with_renderer(renderer);
        }
        if let Some(callback) = &self.progress_callback {
            crawler = crawler.with_progress_callback(callback.clone());
        }

        // Run timeout fires the same stop signal as Ctrl-C
        let timer = self.config.run_timeout_secs.map(|secs| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                        info!("Run timeout of {}s reached, stopping", secs);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            })
        });

        let outcome = crawler.run(&seed_urls, cancel.clone()).await;
        if let Some(timer) = timer {
            timer.abort();
        }
        writer.flush().await;
        let stats = match outcome {
            Ok(stats) => stats,
            Err(e) => {
                retry_once("fail session", || self.db.fail_session(&session_id));
                return Err(e.into());
            }
        };

        let analysis_drained = classifier
            .drain(Duration::from_secs(self.config.analyzer.timeout_secs))
            .await;

        if let Err(e) = graph.compute_centrality(self.config.centrality_half_life()) {
            warn!("Centrality update failed: {}", e);
        }

        let status = if cancel.is_cancelled() {
            retry_once("cancel session", || {
                self.db.cancel_session(&session_id, stats.pages_fetched)
            });
            RunStatus::Cancelled
        } else {
            retry_once("complete session", || {
                self.db.complete_session(&session_id, stats.pages_fetched)
            });
            RunStatus::Completed
        };
        info!("Crawl session {} {}", session_id, status.as_str());

        Ok(CrawlSummary {
            session_id,
            status,
            stats,
            node_count: graph.node_count()?,
            edge_count: graph.edge_count()?,
            threat_counts: self.db.threat_counts()?,
            top_nodes: graph.top_nodes(10)?,
            failed_urls: self.db.get_failed_urls()?,
            analysis_drained,
        })
    }
}

/// Runs SQLite writes on the blocking pool so fetch workers never wait on
/// the connection lock.
#[derive(Clone)]
struct StorageWriter {
    tracker: TaskTracker,
}

impl StorageWriter {
    fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
        }
    }

    fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.tracker.spawn_blocking(job);
    }

    /// Wait for every submitted write.
    async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

fn parse_seeds(seeds: &[String]) -> Result<Vec<Url>> {
    if seeds.is_empty() {
        return Err(CoreError::Config("at least one seed URL is required".into()));
    }
    seeds
        .iter()
        .map(|seed| {
            let url = Url::parse(seed.trim())
                .map_err(|e| CoreError::Config(format!("invalid seed URL {}: {}", seed, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(CoreError::Config(format!(
                    "seed URL {} must be http or https",
                    seed
                )));
            }
            Ok(url)
        })
        .collect()
}

fn indicator_rows(page: &ScannedPage) -> Vec<(&str, &str)> {
    let found = &page.indicators;
    let mut rows: Vec<(&str, &str)> = Vec::new();
    rows.extend(found.emails.iter().map(|v| ("email", v.as_str())));
    rows.extend(found.ips.iter().map(|v| ("ip", v.as_str())));
    rows.extend(found.btc_addresses.iter().map(|v| ("btc", v.as_str())));
    rows.extend(found.eth_addresses.iter().map(|v| ("eth", v.as_str())));
    rows.extend(found.chatrooms.iter().map(|v| ("chatroom", v.as_str())));
    rows.extend(
        found
            .non_http_links
            .iter()
            .map(|l| (l.kind.as_str(), l.value.as_str())),
    );
    rows
}

/// Page callback body: classify, store the node, its edges and indicators.
fn persist_page(
    db: &Database,
    frontier: &Frontier,
    graph: &LinkGraph,
    classifier: &ThreatClassifier,
    page: &ScannedPage,
) {
    let key = node_key(page.url());
    let url = key.as_str();
    let previous = db.page_threat_level(url).ok().flatten().unwrap_or_default();

    let assessment = (!page.is_metadata_only()).then(|| classifier.assess(url, &page.body));
    if let Some(assessment) = &assessment
        && !frontier.first_sighting(&assessment.content_hash)
    {
        debug!("{} mirrors content already seen this run", url);
    }

    let record = PageRecord {
        url: url.to_string(),
        domain: page.entry.domain(),
        title: page.title.clone(),
        content_hash: assessment.as_ref().map(|a| a.content_hash.clone()),
        threat_level: assessment.as_ref().map(|a| a.level).unwrap_or_default(),
        page_size: page.page_size,
        status_code: Some(page.status_code),
        content_type: page.content_type.clone(),
        depth: page.entry.depth,
        ..Default::default()
    };
    let stored = retry_once("upsert page", || graph.upsert_node(&record)).is_some();

    if stored && let Some(assessment) = &assessment {
        if assessment.level > ThreatLevel::Info {
            info!("{} scored {} by keywords", url, assessment.level.as_str());
        }
        classifier.record(url, page.title.as_deref(), previous, assessment);
    }

    for link in &page.links {
        let text = Some(link.text.as_str()).filter(|t| !t.is_empty());
        retry_once("upsert edge", || {
            graph.upsert_edge(url, &link.url, text, link.is_external, page.entry.depth + 1)
        });
    }

    let rows = indicator_rows(page);
    if !rows.is_empty() {
        retry_once("insert indicators", || db.insert_indicators(url, &rows));
    }
}

/// Execute a crawl with the given options
/// Opens the configured database, stops on Ctrl-C, returns the run summary.
pub async fn execute_crawl(
    options: CrawlOptions,
    progress_callback: Option<CrawlProgressCallback>,
) -> Result<CrawlSummary> {
    let CrawlOptions {
        seeds,
        config,
        show_progress_bars,
    } = options;

    config.validate()?;
    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(Database::new(&db_path)?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let progress_callback = progress_callback.clone();
        tokio::spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if signal.is_ok() {
                        if let Some(callback) = &progress_callback {
                            callback("[!] Interrupt received, finishing in-flight pages...".to_string());
                        }
                        cancel.cancel();
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    let progress_bar = if show_progress_bars {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message("Starting crawl...");
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(Arc::new(pb))
    } else {
        None
    };

    let processed = Arc::new(AtomicUsize::new(0));
    let mut engine = CrawlEngine::new(config, db);
    if let Some(pb) = &progress_bar {
        let pb = pb.clone();
        let processed = processed.clone();
        engine = engine.with_progress_callback(Arc::new(move |_worker_id: usize, url: String| {
            let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
            pb.set_message(format!("Crawling... {} URLs processed ({})", count, url));
        }));
    }

    let result = engine.run(&seeds, cancel.clone()).await;

    if let Some(pb) = &progress_bar {
        let total = processed.load(Ordering::Relaxed);
        pb.finish_with_message(format!("Crawl finished! {} URLs processed", total));
    }
    cancel.cancel();

    result
}

fn level_label(level: ThreatLevel) -> colored::ColoredString {
    let label = format!("{:<10}", level.as_str().to_uppercase());
    match level {
        ThreatLevel::Critical => label.red().bold(),
        ThreatLevel::High => label.red(),
        ThreatLevel::Medium => label.yellow(),
        ThreatLevel::Low => label.cyan(),
        ThreatLevel::Info => label.white(),
    }
}

/// Generate the text run report
pub fn generate_crawl_report(summary: &CrawlSummary) -> String {
    let divider = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n\n";
    let mut report = String::new();
    report.push_str(divider);
    report.push_str("# Summary:\n");
    report.push_str(&format!("  Session: {} ({})\n", summary.session_id, summary.status.as_str()));
    report.push_str(&format!(
        "  Generated at: {}\n",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));
    report.push_str(&format!("  Pages fetched: {}\n", summary.stats.pages_fetched));
    report.push_str(&format!("  Failed URLs: {}\n", summary.stats.failures));
    report.push_str(&format!("  Links discovered: {}\n", summary.stats.links_discovered));
    report.push_str(&format!("  Links queued: {}\n", summary.stats.links_enqueued));
    report.push_str(&format!(
        "  Graph: {} nodes, {} edges\n",
        summary.node_count, summary.edge_count
    ));
    if !summary.analysis_drained {
        report.push_str("  [!] Some deep analysis was still pending at shutdown\n");
    }
    report.push('\n');
    report.push_str(divider);

    report.push_str("## Threat levels\n");
    if summary.threat_counts.is_empty() {
        report.push_str("  No pages classified\n");
    }
    for (level, count) in &summary.threat_counts {
        report.push_str(&format!("  {} {}\n", level_label(*level), count));
    }
    report.push('\n');

    if !summary.stats.blocklisted_domains.is_empty() {
        report.push_str("## Blocklisted domains\n");
        for domain in &summary.stats.blocklisted_domains {
            report.push_str(&format!("  {}\n", domain));
        }
        report.push('\n');
    }

    if !summary.failed_urls.is_empty() {
        report.push_str("## Failed URLs\n");
        for failed in &summary.failed_urls {
            report.push_str(&format!(
                "  {} {} \x1b[90m{}\x1b[0m\n",
                "✗".red(),
                failed.url,
                failed.reason
            ));
        }
        report.push('\n');
    }

    if !summary.top_nodes.is_empty() {
        report.push_str("## Most central pages\n");
        for (url, score) in &summary.top_nodes {
            report.push_str(&format!("  {:>8.4} {}\n", score, url));
        }
        report.push('\n');
    }

    report
}
