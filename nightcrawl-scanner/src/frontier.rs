use crate::result::FrontierEntry;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

const SKIP_DOMAINS: &[&str] = &[
    "duckduckgo", "google", "bing", "yahoo", "startpage", "facebook", "twitter", "instagram",
    "youtube",
];

const SKIP_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg", ".ico", ".mp3", ".mp4", ".avi",
    ".mov", ".wmv", ".flv", ".webm", ".zip", ".rar", ".7z", ".tar", ".gz", ".bz2", ".exe", ".msi",
    ".deb", ".rpm", ".dmg", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".css", ".js",
];

static SKIP_PATHS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"/api/", r"/ajax/", r"/download/", r"/static/", r"/assets/", r"\.json$", r"\.xml$",
        r"\.rss$",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Normalize a URL into its dedup key.
///
/// - Strips the fragment
/// - Folds `https` onto `http`
/// - Drops default ports
/// - Removes the trailing slash from non-root paths
/// - Lowercases the result
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    if normalized.scheme() == "https" {
        let _ = normalized.set_scheme("http");
    }
    if normalized.port() == Some(443) {
        let _ = normalized.set_port(None);
    }

    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        normalized.set_path(&path[..path.len() - 1]);
    }

    normalized.as_str().to_lowercase()
}

/// A dotted entry matches that host and its subdomains. A bare name such as
/// `google` matches any host with a label of that name.
fn host_matches(host: &str, entry: &str) -> bool {
    if entry.contains('.') {
        host == entry || host.ends_with(&format!(".{}", entry))
    } else {
        host.split('.').any(|label| label == entry)
    }
}

/// URLs that never enter the frontier.
#[derive(Debug, Clone)]
pub struct SkipList {
    domains: Vec<String>,
    extensions: Vec<String>,
    patterns: Vec<Regex>,
}

impl Default for SkipList {
    fn default() -> Self {
        Self {
            domains: SKIP_DOMAINS.iter().map(|s| s.to_string()).collect(),
            extensions: SKIP_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            patterns: SKIP_PATHS.clone(),
        }
    }
}

impl SkipList {
    pub fn with_domains(mut self, domains: &[String]) -> Self {
        self.domains
            .extend(domains.iter().map(|d| d.to_ascii_lowercase()));
        self
    }

    /// Extra path patterns; invalid expressions are ignored with a warning.
    pub fn with_patterns(mut self, patterns: &[String]) -> Self {
        for p in patterns {
            match Regex::new(p) {
                Ok(re) => self.patterns.push(re),
                Err(e) => tracing::warn!("Ignoring invalid skip pattern {}: {}", p, e),
            }
        }
        self
    }

    pub fn should_skip(&self, url: &Url) -> bool {
        let host = url.host_str().unwrap_or("").to_ascii_lowercase();
        if self.domains.iter().any(|d| host_matches(&host, d)) {
            return true;
        }

        let path = url.path().to_ascii_lowercase();
        if self.extensions.iter().any(|ext| path.ends_with(ext.as_str())) {
            return true;
        }

        self.patterns.iter().any(|re| re.is_match(&path))
    }
}

#[derive(Debug, Clone)]
pub struct FrontierConfig {
    pub per_domain_limit: usize,
    pub max_depth: usize,
    pub max_pages: Option<usize>,
    pub skip_list: SkipList,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            per_domain_limit: 4,
            max_depth: 3,
            max_pages: None,
            skip_list: SkipList::default(),
        }
    }
}

#[derive(Default)]
struct FrontierState {
    queue: VecDeque<FrontierEntry>,
    seen: HashSet<String>,
    content_hashes: HashSet<String>,
    in_flight: HashMap<String, usize>,
    in_flight_total: usize,
    blocked_domains: HashSet<String>,
    dequeued: usize,
    closed: bool,
}

pub struct Frontier {
    config: FrontierConfig,
    state: Mutex<FrontierState>,
    notify: Notify,
}

/// An entry checked out by a worker. Dropping the lease frees the domain's
/// in-flight slot.
pub struct FrontierLease<'a> {
    frontier: &'a Frontier,
    entry: FrontierEntry,
    domain: String,
}

impl FrontierLease<'_> {
    pub fn entry(&self) -> &FrontierEntry {
        &self.entry
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for FrontierLease<'_> {
    fn drop(&mut self) {
        self.frontier.release(&self.domain);
    }
}

impl Frontier {
    pub fn new(config: FrontierConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FrontierState::default()),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, FrontierState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an entry. Returns false if it was filtered, too deep, on a
    /// blocklisted domain, or its normalized URL was already seen.
    pub fn try_enqueue(&self, entry: FrontierEntry) -> bool {
        if !matches!(entry.url.scheme(), "http" | "https") {
            return false;
        }
        if self.config.skip_list.should_skip(&entry.url) {
            debug!("Skip-list rejected {}", entry.url);
            return false;
        }
        if entry.depth > self.config.max_depth {
            return false;
        }

        let domain = entry.domain();
        {
            let mut state = self.state();
            if state.closed || state.blocked_domains.contains(&domain) {
                return false;
            }
            if !state.seen.insert(entry.normalized_url.clone()) {
                return false;
            }
            state.queue.push_back(entry);
        }
        self.notify.notify_waiters();
        true
    }

    /// Wait for the next entry whose domain is below its in-flight cap.
    ///
    /// Returns `None` once the frontier is exhausted (empty with nothing in
    /// flight), the page cap is reached, or `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<FrontierLease<'_>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if state.closed || cancel.is_cancelled() {
                    return None;
                }
                if let Some(max) = self.config.max_pages
                    && state.dequeued >= max
                {
                    debug!("Page cap of {} reached", max);
                    state.closed = true;
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }

                let limit = self.config.per_domain_limit.max(1);
                let position = state.queue.iter().position(|e| {
                    state.in_flight.get(&e.domain()).copied().unwrap_or(0) < limit
                });

                if let Some(pos) = position
                    && let Some(entry) = state.queue.remove(pos)
                {
                    let domain = entry.domain();
                    *state.in_flight.entry(domain.clone()).or_insert(0) += 1;
                    state.in_flight_total += 1;
                    state.dequeued += 1;
                    return Some(FrontierLease {
                        frontier: self,
                        entry,
                        domain,
                    });
                }

                if state.queue.is_empty() && state.in_flight_total == 0 {
                    drop(state);
                    self.notify.notify_waiters();
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    fn release(&self, domain: &str) {
        {
            let mut state = self.state();
            if let Some(count) = state.in_flight.get_mut(domain) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.in_flight.remove(domain);
                }
            }
            state.in_flight_total = state.in_flight_total.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Drop queued work for a domain and refuse it from now on.
    pub fn block_domain(&self, domain: &str) {
        let domain = domain.to_ascii_lowercase();
        let removed = {
            let mut state = self.state();
            let before = state.queue.len();
            state.queue.retain(|e| e.domain() != domain);
            state.blocked_domains.insert(domain.clone());
            before - state.queue.len()
        };
        debug!("Blocked {} ({} queued entries dropped)", domain, removed);
        self.notify.notify_waiters();
    }

    pub fn is_domain_blocked(&self, domain: &str) -> bool {
        self.state()
            .blocked_domains
            .contains(&domain.to_ascii_lowercase())
    }

    /// True the first time a content fingerprint is seen in this run.
    pub fn first_sighting(&self, content_hash: &str) -> bool {
        self.state().content_hashes.insert(content_hash.to_string())
    }

    /// Stop handing out work. Leases already out are unaffected.
    pub fn close(&self) {
        self.state().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().queue.is_empty()
    }

    pub fn seen_count(&self) -> usize {
        self.state().seen.len()
    }

    pub fn dequeued_count(&self) -> usize {
        self.state().dequeued
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(url: &str) -> FrontierEntry {
        FrontierEntry::seed(Url::parse(url).unwrap())
    }

    fn entry_at(url: &str, depth: usize) -> FrontierEntry {
        FrontierEntry::discovered(Url::parse(url).unwrap(), None, depth)
    }

    #[test]
    fn test_normalize_strips_fragment_and_case() {
        let a = normalize_url(&Url::parse("http://Example.onion/Page#top").unwrap());
        let b = normalize_url(&Url::parse("HTTP://example.onion/page").unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalize_folds_scheme_and_trailing_slash() {
        let a = normalize_url(&Url::parse("https://example.onion/forum/").unwrap());
        let b = normalize_url(&Url::parse("http://example.onion/forum").unwrap());
        assert_eq!(a, b);
        assert_eq!(
            normalize_url(&Url::parse("http://example.onion/").unwrap()),
            "http://example.onion/"
        );
    }

    #[test]
    fn test_equivalent_urls_enqueue_once() {
        let frontier = Frontier::new(FrontierConfig::default());
        assert!(frontier.try_enqueue(entry("http://abc.onion/index")));
        assert!(!frontier.try_enqueue(entry("http://ABC.onion/index#section")));
        assert!(!frontier.try_enqueue(entry("https://abc.onion/index/")));
        assert!(frontier.try_enqueue(entry("http://abc.onion/other")));
        assert_eq!(frontier.len(), 2);
    }

    #[test]
    fn test_skip_list_rejects_without_bookkeeping() {
        let frontier = Frontier::new(FrontierConfig::default());
        assert!(!frontier.try_enqueue(entry("http://abc.onion/image.png")));
        assert!(!frontier.try_enqueue(entry("http://abc.onion/api/v1/users")));
        assert!(!frontier.try_enqueue(entry("https://www.google.com/search?q=x")));
        assert!(!frontier.try_enqueue(entry("http://abc.onion/feed.rss")));
        assert_eq!(frontier.seen_count(), 0);
    }

    #[test]
    fn test_skip_domains_match_whole_labels() {
        let skip = SkipList::default().with_domains(&["Evil.example".to_string()]);
        let skipped = |u: &str| skip.should_skip(&Url::parse(u).unwrap());

        assert!(skipped("https://www.google.co.uk/"));
        assert!(skipped("http://evil.example/"));
        assert!(skipped("http://cdn.evil.example/"));
        assert!(!skipped("http://googlezq3xkyrnbfpwh7.onion/"));
        assert!(!skipped("http://notgoogle.com/"));
        assert!(!skipped("http://notevil.example/"));
    }

    #[test]
    fn test_extra_skip_patterns() {
        let skip = SkipList::default().with_patterns(&["/logout".to_string()]);
        assert!(skip.should_skip(&Url::parse("http://abc.onion/logout").unwrap()));
        assert!(!skip.should_skip(&Url::parse("http://abc.onion/login").unwrap()));
    }

    #[test]
    fn test_depth_cap() {
        let frontier = Frontier::new(FrontierConfig {
            max_depth: 2,
            ..FrontierConfig::default()
        });
        assert!(frontier.try_enqueue(entry_at("http://abc.onion/a", 2)));
        assert!(!frontier.try_enqueue(entry_at("http://abc.onion/b", 3)));
        // a rejected-for-depth URL is not marked seen
        assert_eq!(frontier.seen_count(), 1);
    }

    #[test]
    fn test_blocked_domain_rejects_and_purges() {
        let frontier = Frontier::new(FrontierConfig::default());
        frontier.try_enqueue(entry("http://x.onion/1"));
        frontier.try_enqueue(entry("http://y.onion/1"));
        frontier.block_domain("x.onion");

        assert_eq!(frontier.len(), 1);
        assert!(!frontier.try_enqueue(entry("http://x.onion/2")));
        assert!(frontier.is_domain_blocked("X.onion"));
    }

    #[test]
    fn test_content_fingerprint_dedup() {
        let frontier = Frontier::new(FrontierConfig::default());
        assert!(frontier.first_sighting("abc"));
        assert!(!frontier.first_sighting("abc"));
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_exhausts() {
        let frontier = Frontier::new(FrontierConfig::default());
        let cancel = CancellationToken::new();
        frontier.try_enqueue(entry("http://a.onion/1"));
        frontier.try_enqueue(entry("http://b.onion/1"));

        {
            let first = frontier.dequeue(&cancel).await.unwrap();
            assert_eq!(first.entry().url.as_str(), "http://a.onion/1");
        }
        {
            let second = frontier.dequeue(&cancel).await.unwrap();
            assert_eq!(second.domain(), "b.onion");
        }
        assert!(frontier.dequeue(&cancel).await.is_none());
        assert_eq!(frontier.dequeued_count(), 2);
    }

    #[tokio::test]
    async fn test_per_domain_cap_lets_other_domains_through() {
        let frontier = Frontier::new(FrontierConfig {
            per_domain_limit: 1,
            ..FrontierConfig::default()
        });
        let cancel = CancellationToken::new();
        frontier.try_enqueue(entry("http://busy.onion/1"));
        frontier.try_enqueue(entry("http://busy.onion/2"));
        frontier.try_enqueue(entry("http://quiet.onion/1"));

        let first = frontier.dequeue(&cancel).await.unwrap();
        assert_eq!(first.domain(), "busy.onion");
        let second = frontier.dequeue(&cancel).await.unwrap();
        assert_eq!(second.domain(), "quiet.onion");
        assert_eq!(frontier.in_flight(), 2);

        drop(first);
        let third = frontier.dequeue(&cancel).await.unwrap();
        assert_eq!(third.entry().url.as_str(), "http://busy.onion/2");
    }

    #[tokio::test]
    async fn test_waiting_worker_wakes_on_enqueue() {
        let frontier = std::sync::Arc::new(Frontier::new(FrontierConfig::default()));
        let cancel = CancellationToken::new();
        frontier.try_enqueue(entry("http://a.onion/1"));
        let lease = frontier.dequeue(&cancel).await.unwrap();

        let waiter = {
            let frontier = frontier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                frontier
                    .dequeue(&cancel)
                    .await
                    .map(|l| l.entry().url.to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        frontier.try_enqueue(entry("http://a.onion/2"));
        drop(lease);

        let next = waiter.await.unwrap();
        assert_eq!(next.as_deref(), Some("http://a.onion/2"));
    }

    #[tokio::test]
    async fn test_page_cap_and_cancel_stop_dequeue() {
        let frontier = Frontier::new(FrontierConfig {
            max_pages: Some(1),
            ..FrontierConfig::default()
        });
        let cancel = CancellationToken::new();
        frontier.try_enqueue(entry("http://a.onion/1"));
        frontier.try_enqueue(entry("http://a.onion/2"));

        assert!(frontier.dequeue(&cancel).await.is_some());
        assert!(frontier.dequeue(&cancel).await.is_none());

        let other = Frontier::new(FrontierConfig::default());
        other.try_enqueue(entry("http://a.onion/1"));
        cancel.cancel();
        assert!(other.dequeue(&cancel).await.is_none());
    }
}
