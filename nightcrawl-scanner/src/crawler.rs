use crate::blocking::{BlockingDetector, RecoveryAction, RecoveryPolicy, RenderService};
use crate::error::{Result, ScanError};
use crate::extract::{UserAgentPool, extract_page};
use crate::frontier::Frontier;
use crate::proxy::{DomainStatus, ProxyRoute, ProxyRouter, RouteOutcome, Transport};
use crate::result::{
    CrawlFailure, CrawlStats, FailureReason, FetchOutcome, FrontierEntry, ScannedPage, is_onion,
};
use reqwest::Client;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

pub type ProgressCallback = Arc<dyn Fn(usize, String) + Send + Sync>;
pub type PageCallback = Arc<dyn Fn(&ScannedPage) + Send + Sync>;
pub type FailureCallback = Arc<dyn Fn(&CrawlFailure) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub workers: usize,
    pub onion_timeout: Duration,
    pub clearnet_timeout: Duration,
    pub max_attempts: u32,
    /// Follow clearnet links found on pages, not only hidden services.
    pub follow_clearnet: bool,
    /// Text bodies are truncated to this many bytes.
    pub max_body_bytes: usize,
}

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            onion_timeout: Duration::from_secs(90),
            clearnet_timeout: Duration::from_secs(45),
            max_attempts: 8,
            follow_clearnet: false,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    pages: AtomicUsize,
    failures: AtomicUsize,
    discovered: AtomicUsize,
    enqueued: AtomicUsize,
}

/// Fixed pool of fetch workers pulling from a shared frontier.
#[derive(Clone)]
pub struct Crawler {
    frontier: Arc<Frontier>,
    router: Arc<ProxyRouter>,
    detector: BlockingDetector,
    recovery: Arc<RecoveryPolicy>,
    renderer: Option<Arc<dyn RenderService>>,
    clients: Arc<HashMap<String, Client>>,
    user_agents: Arc<UserAgentPool>,
    config: CrawlerConfig,
    counters: Arc<Counters>,
    page_callback: Option<PageCallback>,
    failure_callback: Option<FailureCallback>,
    progress_callback: Option<ProgressCallback>,
}

impl Crawler {
    pub fn new(frontier: Arc<Frontier>, router: Arc<ProxyRouter>, config: CrawlerConfig) -> Result<Self> {
        let mut clients = HashMap::new();
        for route in router.routes() {
            clients.insert(route.id.clone(), build_client(route, &config)?);
        }

        Ok(Self {
            frontier,
            router,
            detector: BlockingDetector::new(),
            recovery: Arc::new(RecoveryPolicy::default()),
            renderer: None,
            clients: Arc::new(clients),
            user_agents: Arc::new(UserAgentPool::new()),
            config,
            counters: Arc::new(Counters::default()),
            page_callback: None,
            failure_callback: None,
            progress_callback: None,
        })
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = Arc::new(recovery);
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn RenderService>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_page_callback(mut self, callback: PageCallback) -> Self {
        self.page_callback = Some(callback);
        self
    }

    pub fn with_failure_callback(mut self, callback: FailureCallback) -> Self {
        self.failure_callback = Some(callback);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    pub fn router(&self) -> &Arc<ProxyRouter> {
        &self.router
    }

    /// Seed the frontier and run the worker pool until the frontier is
    /// exhausted, the page cap is hit, or `cancel` fires.
    pub async fn run(&self, seeds: &[Url], cancel: CancellationToken) -> Result<CrawlStats> {
        let queued = seeds
            .iter()
            .filter(|seed| self.frontier.try_enqueue(FrontierEntry::seed((*seed).clone())))
            .count();
        let workers = self.config.workers.max(1);
        info!(
            "Starting crawl of {} seed(s) ({} queued) with {} workers",
            seeds.len(),
            queued,
            workers
        );

        let shared = Arc::new(self.clone());
        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                let crawler = shared.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { crawler.worker_loop(worker_id, cancel).await })
            })
            .collect();

        for joined in futures::future::join_all(handles).await {
            joined?;
        }

        let stats = self.stats();
        info!(
            "Crawl complete. {} pages fetched, {} failures",
            stats.pages_fetched, stats.failures
        );
        Ok(stats)
    }

    pub fn stats(&self) -> CrawlStats {
        CrawlStats {
            pages_fetched: self.counters.pages.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            links_discovered: self.counters.discovered.load(Ordering::Relaxed),
            links_enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            blocklisted_domains: self.router.blocklisted_domains(),
        }
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        debug!("Worker {} started", worker_id);

        while let Some(lease) = self.frontier.dequeue(&cancel).await {
            let entry = lease.entry().clone();

            if let Some(ref callback) = self.progress_callback {
                callback(worker_id, entry.url.to_string());
            }

            match self.process(&entry, &cancel).await {
                Ok(page) => self.handle_page(page),
                Err(FailureReason::Cancelled) => {
                    debug!("Worker {} dropped {} on stop signal", worker_id, entry.url);
                }
                Err(reason) => self.record_failure(&entry, reason),
            }
            self.recovery.finish(entry.url.as_str());
            drop(lease);
        }

        debug!("Worker {} finished", worker_id);
    }

    /// Fetch one entry, retrying across routes until it yields a clean page
    /// or a reason to give up.
    async fn process(
        &self,
        entry: &FrontierEntry,
        cancel: &CancellationToken,
    ) -> std::result::Result<ScannedPage, FailureReason> {
        let url = &entry.url;
        let domain = entry.domain();

        let mut route = self.route_for(url, &domain)?;
        let mut render_next = false;
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() && attempts > 0 {
                return Err(FailureReason::Cancelled);
            }
            attempts += 1;
            if attempts > self.config.max_attempts {
                return Err(FailureReason::AttemptsExhausted);
            }

            let (outcome, rendered) = if std::mem::take(&mut render_next) {
                self.render_or_fetch(url, &route).await
            } else {
                (self.fetch(url, &route).await, false)
            };

            if let Some(error) = &outcome.error {
                if !outcome.transport_failure {
                    return Err(FailureReason::Transport(error.clone()));
                }
                debug!("Transport failure on {} via {}: {}", url, route.id, error);
                if self.router.report_outcome(&route, url, RouteOutcome::TransportFailure)
                    == DomainStatus::Blocklisted
                {
                    self.frontier.block_domain(&domain);
                    return Err(FailureReason::DomainBlocked);
                }
                route = self.rotate(&route, url, &domain).await?;
                continue;
            }

            if outcome.status_code != 200 {
                self.router.report_outcome(&route, url, RouteOutcome::Success);
                return Err(FailureReason::HttpStatus(outcome.status_code));
            }

            let detection = self.detector.classify(&outcome);
            match self.recovery.decide(url.as_str(), &domain, detection.verdict) {
                RecoveryAction::Proceed => {
                    self.router.report_outcome(&route, url, RouteOutcome::Success);
                    return Ok(self.build_page(entry, outcome, rendered));
                }
                RecoveryAction::Backoff(delay) => {
                    warn!("Rate limited on {}, backing off {:?}", domain, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(FailureReason::Cancelled),
                    }
                }
                RecoveryAction::Render { attempt } => {
                    warn!(
                        "{} on {} (pattern {:?}), render attempt {}",
                        detection.verdict.as_str(),
                        url,
                        detection.pattern,
                        attempt
                    );
                    render_next = true;
                }
                RecoveryAction::Rotate => {
                    warn!(
                        "{} on {} via {}, rotating route",
                        detection.verdict.as_str(),
                        url,
                        route.id
                    );
                    self.router.report_outcome(&route, url, RouteOutcome::Blocked);
                    route = self.rotate(&route, url, &domain).await?;
                }
                RecoveryAction::Abandon(verdict) => {
                    self.router.report_outcome(&route, url, RouteOutcome::Blocked);
                    return Err(FailureReason::Blocked(verdict));
                }
            }
        }
    }

    fn route_for(&self, url: &Url, domain: &str) -> std::result::Result<ProxyRoute, FailureReason> {
        match self.router.select_route(url) {
            Ok(route) => Ok(route),
            Err(ScanError::DomainBlocked(_)) => {
                self.frontier.block_domain(domain);
                Err(FailureReason::DomainBlocked)
            }
            Err(e) => {
                warn!("No route for {}: {}", url, e);
                Err(FailureReason::NoRoute)
            }
        }
    }

    async fn rotate(
        &self,
        route: &ProxyRoute,
        url: &Url,
        domain: &str,
    ) -> std::result::Result<ProxyRoute, FailureReason> {
        match self.router.rotate(route, url).await {
            Ok(next) => Ok(next),
            Err(ScanError::DomainBlocked(_)) => {
                self.frontier.block_domain(domain);
                Err(FailureReason::DomainBlocked)
            }
            Err(e) => {
                warn!("Route rotation failed for {}: {}", url, e);
                Err(FailureReason::NoRoute)
            }
        }
    }

    async fn fetch(&self, url: &Url, route: &ProxyRoute) -> FetchOutcome {
        let start = Instant::now();
        let Some(client) = self.clients.get(&route.id) else {
            let error = ScanError::NoRoute(route.id.clone());
            return FetchOutcome::failed(url.to_string(), route.id.clone(), &error, start.elapsed());
        };

        let timeout = if is_onion(url) {
            self.config.onion_timeout
        } else {
            self.config.clearnet_timeout
        };

        debug!("Fetching {} via {}", url, route.id);
        let response = match client
            .get(url.clone())
            .header(reqwest::header::USER_AGENT, self.user_agents.next_agent())
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return FetchOutcome::failed(url.to_string(), route.id.clone(), &e.into(), start.elapsed());
            }
        };

        let mut outcome = FetchOutcome::new(url.to_string(), route.id.clone());
        outcome.status_code = response.status().as_u16();
        outcome.headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        outcome.content_type = outcome.headers.get("content-type").cloned();

        if outcome.is_text() {
            match read_capped(response, self.config.max_body_bytes).await {
                Ok(body) => outcome.body = body,
                Err(e) => {
                    return FetchOutcome::failed(url.to_string(), route.id.clone(), &e.into(), start.elapsed());
                }
            }
        }
        outcome.elapsed = start.elapsed();
        outcome
    }

    /// Go through the render service when one is configured, otherwise
    /// (or if it fails) refetch directly.
    async fn render_or_fetch(&self, url: &Url, route: &ProxyRoute) -> (FetchOutcome, bool) {
        if let Some(renderer) = &self.renderer {
            let start = Instant::now();
            match renderer.render(url.as_str()).await {
                Ok(html) => {
                    let mut outcome = FetchOutcome::new(url.to_string(), route.id.clone());
                    outcome.status_code = 200;
                    outcome.content_type = Some("text/html".to_string());
                    outcome.body = html;
                    outcome.elapsed = start.elapsed();
                    return (outcome, true);
                }
                Err(e) => warn!("Render of {} failed: {}", url, e),
            }
        }
        (self.fetch(url, route).await, false)
    }

    fn build_page(&self, entry: &FrontierEntry, outcome: FetchOutcome, rendered: bool) -> ScannedPage {
        let mut page = ScannedPage {
            entry: entry.clone(),
            status_code: outcome.status_code,
            content_type: outcome.content_type.clone(),
            title: None,
            body: String::new(),
            page_size: 0,
            links: Vec::new(),
            indicators: Default::default(),
            route_id: outcome.route_id.clone(),
            response_time: outcome.elapsed,
            rendered,
        };

        if !outcome.is_text() {
            page.page_size = outcome
                .headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            debug!("Metadata only for {} ({:?})", entry.url, outcome.content_type);
            return page;
        }

        let data = extract_page(&outcome.body, &entry.url);
        page.title = data.title;
        page.links = data.links;
        page.indicators = data.indicators;
        page.page_size = outcome.body.len();
        page.body = outcome.body;
        page
    }

    fn in_scope(&self, url: &Url) -> bool {
        is_onion(url) || self.config.follow_clearnet
    }

    fn handle_page(&self, page: ScannedPage) {
        self.counters.pages.fetch_add(1, Ordering::Relaxed);
        self.counters
            .discovered
            .fetch_add(page.links.len(), Ordering::Relaxed);
        info!(
            "Fetched {} ({} bytes, {} links)",
            page.url(),
            page.page_size,
            page.links.len()
        );

        if let Some(ref callback) = self.page_callback {
            callback(&page);
        }

        for link in &page.links {
            let Ok(target) = Url::parse(&link.url) else {
                continue;
            };
            if !self.in_scope(&target) {
                continue;
            }
            let entry = FrontierEntry::discovered(
                target,
                Some(page.url().to_string()),
                page.entry.depth + 1,
            );
            if self.frontier.try_enqueue(entry) {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_failure(&self, entry: &FrontierEntry, reason: FailureReason) {
        warn!("Abandoned {}: {}", entry.url, reason.as_str());
        self.counters.failures.fetch_add(1, Ordering::Relaxed);

        if let Some(ref callback) = self.failure_callback {
            callback(&CrawlFailure {
                url: entry.url.to_string(),
                domain: entry.domain(),
                reason,
            });
        }
    }
}

fn build_client(route: &ProxyRoute, config: &CrawlerConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(config.onion_timeout / 2)
        .pool_max_idle_per_host(50)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .redirect(reqwest::redirect::Policy::limited(5));

    builder = match (&route.transport, &route.endpoint) {
        (Transport::Direct, _) | (_, None) => builder.no_proxy(),
        (_, Some(endpoint)) => builder.proxy(reqwest::Proxy::all(endpoint.as_str())?),
    };

    Ok(builder.build()?)
}

/// Read a response body chunk by chunk, stopping once `limit` bytes are held.
async fn read_capped(mut response: reqwest::Response, limit: usize) -> reqwest::Result<String> {
    let mut body: Vec<u8> = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let room = limit - body.len();
        if chunk.len() >= room {
            body.extend_from_slice(&chunk[..room]);
            debug!("Body of {} truncated at {} bytes", response.url(), limit);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::{BlockingVerdict, RecoveryConfig};
    use crate::frontier::FrontierConfig;
    use crate::proxy::RouterConfig;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    fn html(body: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/html")
            .set_body_bytes(body.as_bytes().to_vec())
    }

    fn direct_crawler(config: CrawlerConfig) -> Crawler {
        let frontier = Arc::new(Frontier::new(FrontierConfig::default()));
        let router = Arc::new(ProxyRouter::new(vec![], RouterConfig::default()).unwrap());
        Crawler::new(frontier, router, config).unwrap()
    }

    fn clearnet_config(workers: usize) -> CrawlerConfig {
        CrawlerConfig {
            workers,
            follow_clearnet: true,
            ..CrawlerConfig::default()
        }
    }

    fn collect_pages(crawler: Crawler) -> (Crawler, Arc<Mutex<Vec<ScannedPage>>>) {
        let pages = Arc::new(Mutex::new(Vec::new()));
        let sink = pages.clone();
        let crawler = crawler.with_page_callback(Arc::new(move |page: &ScannedPage| {
            sink.lock().unwrap().push(page.clone());
        }));
        (crawler, pages)
    }

    fn collect_failures(crawler: Crawler) -> (Crawler, Arc<Mutex<Vec<CrawlFailure>>>) {
        let failures = Arc::new(Mutex::new(Vec::new()));
        let sink = failures.clone();
        let crawler = crawler.with_failure_callback(Arc::new(move |failure: &CrawlFailure| {
            sink.lock().unwrap().push(failure.clone());
        }));
        (crawler, failures)
    }

    fn seed(uri: &str) -> Vec<Url> {
        vec![Url::parse(uri).unwrap()]
    }

    /// Test basic link discovery
    #[tokio::test]
    async fn test_link_discovery() {
        let mock_server = MockServer::start().await;

        let root_html = format!(
            r#"<html><head><title>Root</title></head><body>
                <a href="{}/page1">Page 1</a>
                <a href="{}/page2">Page 2</a>
            </body></html>"#,
            mock_server.uri(),
            mock_server.uri()
        );

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html(&root_html))
            .mount(&mock_server)
            .await;
        for p in ["/page1", "/page2"] {
            Mock::given(method("GET"))
                .and(path(p))
                .respond_with(html("<html><body>leaf</body></html>"))
                .expect(1)
                .mount(&mock_server)
                .await;
        }

        let (crawler, pages) = collect_pages(direct_crawler(clearnet_config(1)));
        let stats = crawler
            .run(&seed(&mock_server.uri()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.pages_fetched, 3);
        assert_eq!(stats.links_discovered, 2);
        assert_eq!(stats.links_enqueued, 2);

        let pages = pages.lock().unwrap();
        let root = pages.iter().find(|p| p.entry.depth == 0).unwrap();
        assert_eq!(root.title.as_deref(), Some("Root"));
        assert_eq!(root.links[0].text, "Page 1");
        assert!(pages.iter().filter(|p| p.entry.depth == 1).all(|p| p.entry.source_url.is_some()));
    }

    /// Test that multiple workers are actually used during crawling
    #[tokio::test]
    async fn test_multiple_workers_are_used() {
        let mock_server = MockServer::start().await;

        let mut root_html = String::from("<html><body>");
        for i in 1..=10 {
            root_html.push_str(&format!(
                r#"<a href="{}/page{}">Page {}</a>"#,
                mock_server.uri(),
                i,
                i
            ));
        }
        root_html.push_str("</body></html>");

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html(&root_html))
            .mount(&mock_server)
            .await;

        for i in 1..=10 {
            Mock::given(method("GET"))
                .and(path(format!("/page{}", i)))
                .respond_with(
                    html("<html><body>Page</body></html>")
                        .set_delay(Duration::from_millis(50)),
                )
                .mount(&mock_server)
                .await;
        }

        let activity: Arc<Mutex<HashSet<usize>>> = Arc::new(Mutex::new(HashSet::new()));
        let activity_clone = activity.clone();
        let crawler = direct_crawler(clearnet_config(4)).with_progress_callback(Arc::new(
            move |worker_id, _url| {
                activity_clone.lock().unwrap().insert(worker_id);
            },
        ));

        let stats = crawler
            .run(&seed(&mock_server.uri()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.pages_fetched, 11);
        let workers_used = activity.lock().unwrap().len();
        assert!(
            workers_used > 1,
            "Expected multiple workers to be used, only {} did any work",
            workers_used
        );
    }

    #[tokio::test]
    async fn test_clearnet_links_not_followed_by_default() {
        let mock_server = MockServer::start().await;
        let root_html = format!(r#"<a href="{}/other">Other</a>"#, mock_server.uri());

        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html(&root_html))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/other"))
            .respond_with(html("other"))
            .expect(0)
            .mount(&mock_server)
            .await;

        let (crawler, pages) = collect_pages(direct_crawler(CrawlerConfig {
            workers: 2,
            ..CrawlerConfig::default()
        }));
        let stats = crawler
            .run(&seed(&mock_server.uri()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.pages_fetched, 1);
        assert_eq!(stats.links_enqueued, 0);
        assert_eq!(pages.lock().unwrap()[0].links.len(), 1);
    }

    #[tokio::test]
    async fn test_non_200_recorded_without_retry() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (crawler, failures) = collect_failures(direct_crawler(clearnet_config(1)));
        let stats = crawler
            .run(
                &seed(&format!("{}/missing", mock_server.uri())),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.pages_fetched, 0);
        assert_eq!(stats.failures, 1);
        assert_eq!(failures.lock().unwrap()[0].reason, FailureReason::HttpStatus(404));
    }

    #[tokio::test]
    async fn test_oversized_body_is_truncated() {
        let mock_server = MockServer::start().await;
        let filler = "a".repeat(4096);
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(html(&format!(
                "<html><head><title>Big</title></head><body>{}</body></html>",
                filler
            )))
            .mount(&mock_server)
            .await;

        let (crawler, pages) = collect_pages(direct_crawler(CrawlerConfig {
            max_body_bytes: 1024,
            ..clearnet_config(1)
        }));
        let stats = crawler
            .run(
                &seed(&format!("{}/big", mock_server.uri())),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.pages_fetched, 1);
        let pages = pages.lock().unwrap();
        assert_eq!(pages[0].page_size, 1024);
        assert_eq!(pages[0].title.as_deref(), Some("Big"));
    }

    #[tokio::test]
    async fn test_binary_content_is_metadata_only() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dump.bin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(vec![0u8; 64]),
            )
            .mount(&mock_server)
            .await;

        let (crawler, pages) = collect_pages(direct_crawler(clearnet_config(1)));
        crawler
            .run(
                &seed(&format!("{}/dump.bin", mock_server.uri())),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        let pages = pages.lock().unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].is_metadata_only());
        assert!(pages[0].links.is_empty());
        assert_eq!(pages[0].page_size, 64);
    }

    #[tokio::test]
    async fn test_captcha_abandoned_after_three_verdicts() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gate"))
            .respond_with(html("<h1>Solve the captcha to continue</h1>"))
            .expect(3)
            .mount(&mock_server)
            .await;

        let (crawler, failures) = collect_failures(direct_crawler(clearnet_config(1)));
        let stats = crawler
            .run(
                &seed(&format!("{}/gate", mock_server.uri())),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(stats.pages_fetched, 0);
        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].reason,
            FailureReason::Blocked(BlockingVerdict::Captcha)
        );
    }

    struct StaticRenderer(&'static str);

    #[async_trait]
    impl RenderService for StaticRenderer {
        async fn render(&self, _url: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_challenge_page_rendered() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html("Checking your browser before accessing"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let (crawler, pages) = collect_pages(
            direct_crawler(clearnet_config(1)).with_renderer(Arc::new(StaticRenderer(
                "<html><head><title>Inside</title></head><body>ok</body></html>",
            ))),
        );
        crawler
            .run(&seed(&mock_server.uri()), CancellationToken::new())
            .await
            .unwrap();

        let pages = pages.lock().unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].rendered);
        assert_eq!(pages[0].title.as_deref(), Some("Inside"));
    }

    #[tokio::test]
    async fn test_rate_limit_backs_off_then_succeeds() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html("Too many requests, slow down"))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(html("<title>Fine</title>"))
            .mount(&mock_server)
            .await;

        let (crawler, pages) = collect_pages(direct_crawler(clearnet_config(1)).with_recovery(
            RecoveryPolicy::new(RecoveryConfig {
                base_backoff: Duration::from_millis(10),
                ..RecoveryConfig::default()
            }),
        ));
        let stats = crawler
            .run(&seed(&mock_server.uri()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.failures, 0);
        assert_eq!(pages.lock().unwrap()[0].title.as_deref(), Some("Fine"));
    }

    #[tokio::test]
    async fn test_transport_failures_blocklist_domain() {
        // Nothing listens on these ports, so every attempt is refused.
        let routes = vec![
            ProxyRoute::relay("relay-a", "http://127.0.0.1:1"),
            ProxyRoute::relay("relay-b", "http://127.0.0.1:2"),
            ProxyRoute::relay("relay-c", "http://127.0.0.1:3"),
        ];
        let frontier = Arc::new(Frontier::new(FrontierConfig::default()));
        let router = Arc::new(ProxyRouter::new(routes, RouterConfig::default()).unwrap());
        let crawler = Crawler::new(frontier.clone(), router.clone(), CrawlerConfig {
            workers: 1,
            ..CrawlerConfig::default()
        })
        .unwrap();
        let (crawler, failures) = collect_failures(crawler);

        let stats = crawler
            .run(&seed("http://x.onion/"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.blocklisted_domains, vec!["x.onion".to_string()]);
        assert_eq!(router.domain_failures("x.onion"), 6);
        assert_eq!(failures.lock().unwrap()[0].reason, FailureReason::DomainBlocked);

        let later = FrontierEntry::seed(Url::parse("http://x.onion/other").unwrap());
        assert!(!frontier.try_enqueue(later));
        assert!(matches!(
            router.select_route(&Url::parse("http://x.onion/other").unwrap()),
            Err(ScanError::DomainBlocked(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(html("never"))
            .expect(0)
            .mount(&mock_server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = direct_crawler(clearnet_config(2))
            .run(&seed(&mock_server.uri()), cancel)
            .await
            .unwrap();
        assert_eq!(stats.pages_fetched, 0);
        assert_eq!(stats.failures, 0);
    }
}
