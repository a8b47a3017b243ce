use crate::error::{Result, ScanError};
use crate::result::{host_of, is_onion};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

pub const DIRECT_ROUTE_ID: &str = "direct";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Relay,
    Socks5,
    Direct,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Relay => "relay",
            Transport::Socks5 => "socks5",
            Transport::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteHealth {
    #[default]
    Healthy,
    Degraded,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRoute {
    pub id: String,
    pub transport: Transport,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub health: RouteHealth,
    #[serde(default, alias = "domain_pattern")]
    pub assigned_domain_pattern: Option<String>,
}

impl ProxyRoute {
    pub fn relay(id: &str, endpoint: &str) -> Self {
        Self::with_transport(id, Transport::Relay, Some(endpoint))
    }

    pub fn socks5(id: &str, endpoint: &str) -> Self {
        Self::with_transport(id, Transport::Socks5, Some(endpoint))
    }

    pub fn direct() -> Self {
        Self::with_transport(DIRECT_ROUTE_ID, Transport::Direct, None)
    }

    fn with_transport(id: &str, transport: Transport, endpoint: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            transport,
            endpoint: endpoint.map(String::from),
            health: RouteHealth::Healthy,
            assigned_domain_pattern: None,
        }
    }

    pub fn for_domains(mut self, pattern: &str) -> Self {
        self.assigned_domain_pattern = Some(pattern.to_ascii_lowercase());
        self
    }

    /// `*.suffix` matches the suffix and its subdomains; anything else is an
    /// exact host match. No pattern matches every host.
    pub fn matches_domain(&self, domain: &str) -> bool {
        match &self.assigned_domain_pattern {
            None => true,
            Some(pattern) => match pattern.strip_prefix("*.") {
                Some(suffix) => domain == suffix || domain.ends_with(&format!(".{}", suffix)),
                None => domain == pattern,
            },
        }
    }

    /// Check the endpoint parses and its scheme fits the transport.
    pub fn validate(&self) -> Result<()> {
        let endpoint = match (&self.transport, &self.endpoint) {
            (Transport::Direct, _) => return Ok(()),
            (_, None) => {
                return Err(ScanError::ProxyConfig(format!(
                    "route {} has no endpoint",
                    self.id
                )));
            }
            (_, Some(endpoint)) => endpoint,
        };

        let parsed = Url::parse(endpoint).map_err(|e| {
            ScanError::ProxyConfig(format!("route {}: invalid endpoint {}: {}", self.id, endpoint, e))
        })?;

        let scheme_ok = match self.transport {
            Transport::Relay => matches!(parsed.scheme(), "http" | "https"),
            Transport::Socks5 => matches!(parsed.scheme(), "socks5" | "socks5h"),
            Transport::Direct => true,
        };
        if !scheme_ok || parsed.host_str().is_none() {
            return Err(ScanError::ProxyConfig(format!(
                "route {}: endpoint {} does not fit transport {}",
                self.id,
                endpoint,
                self.transport.as_str()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Success,
    TransportFailure,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainStatus {
    Healthy,
    RouteBlocked,
    Blocklisted,
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Domain is blocklisted once its failure count exceeds this.
    pub domain_failure_threshold: u32,
    /// Consecutive failures before a route is benched for a domain.
    pub route_failure_threshold: u32,
    pub route_cooldown: Duration,
    pub circuit_refresh_interval: Duration,
    pub proxy_clearnet: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            domain_failure_threshold: 5,
            route_failure_threshold: 3,
            route_cooldown: Duration::from_secs(600),
            circuit_refresh_interval: Duration::from_secs(300),
            proxy_clearnet: false,
        }
    }
}

/// Asks the anonymizing network for a fresh circuit.
#[async_trait]
pub trait CircuitRefresher: Send + Sync {
    async fn refresh(&self) -> Result<()>;
}

/// Sends `SIGNAL NEWNYM` to a local control port.
pub struct ControlPortRefresher {
    address: String,
    password: Option<String>,
}

impl ControlPortRefresher {
    pub fn new(address: &str, password: Option<String>) -> Self {
        Self {
            address: address.to_string(),
            password,
        }
    }
}

#[async_trait]
impl CircuitRefresher for ControlPortRefresher {
    async fn refresh(&self) -> Result<()> {
        let mut stream = TcpStream::connect(&self.address).await?;
        let auth = match &self.password {
            Some(pw) => format!("AUTHENTICATE \"{}\"\r\n", pw.replace('"', "\\\"")),
            None => "AUTHENTICATE\r\n".to_string(),
        };
        stream.write_all(auth.as_bytes()).await?;
        stream.write_all(b"SIGNAL NEWNYM\r\nQUIT\r\n").await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        let reply = String::from_utf8_lossy(&reply);
        if reply.lines().take(2).all(|l| l.starts_with("250")) {
            Ok(())
        } else {
            Err(ScanError::Other(format!(
                "control port refused NEWNYM: {}",
                reply.trim()
            )))
        }
    }
}

#[derive(Debug, Default)]
struct RouteState {
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct DomainState {
    failures: u32,
    blocklisted: bool,
    cursor: usize,
    pinned: Option<String>,
    routes: HashMap<String, RouteState>,
}

impl DomainState {
    fn route_available(&self, route_id: &str, now: Instant) -> bool {
        self.routes
            .get(route_id)
            .and_then(|r| r.blocked_until)
            .map(|until| until <= now)
            .unwrap_or(true)
    }
}

pub struct ProxyRouter {
    routes: Vec<ProxyRoute>,
    config: RouterConfig,
    domains: DashMap<String, DomainState>,
    route_health: DashMap<String, RouteHealth>,
    refresher: Option<Arc<dyn CircuitRefresher>>,
    last_refresh: Mutex<Option<Instant>>,
}

impl ProxyRouter {
    /// Build a router over the given routes. A direct route is always added
    /// for clearnet traffic.
    pub fn new(routes: Vec<ProxyRoute>, config: RouterConfig) -> Result<Self> {
        for route in &routes {
            route.validate()?;
        }
        let mut routes = routes;
        if !routes.iter().any(|r| r.transport == Transport::Direct) {
            routes.push(ProxyRoute::direct());
        }

        Ok(Self {
            routes,
            config,
            domains: DashMap::new(),
            route_health: DashMap::new(),
            refresher: None,
            last_refresh: Mutex::new(None),
        })
    }

    pub fn with_refresher(mut self, refresher: Arc<dyn CircuitRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn routes(&self) -> &[ProxyRoute] {
        &self.routes
    }

    fn route_by_id(&self, id: &str) -> Option<&ProxyRoute> {
        self.routes.iter().find(|r| r.id == id)
    }

    fn snapshot(&self, route: &ProxyRoute) -> ProxyRoute {
        let mut route = route.clone();
        route.health = self
            .route_health
            .get(&route.id)
            .map(|h| *h)
            .unwrap_or_default();
        route
    }

    /// Health of a route as seen by one domain: `Blocked` while the route is
    /// benched for that domain, otherwise the route's last reported health.
    pub fn route_health(&self, domain: &str, route_id: &str) -> RouteHealth {
        let benched = self
            .domains
            .get(&domain.to_ascii_lowercase())
            .is_some_and(|state| !state.route_available(route_id, Instant::now()));
        if benched {
            return RouteHealth::Blocked;
        }
        self.route_health
            .get(route_id)
            .map(|h| *h)
            .unwrap_or_default()
    }

    /// Routes allowed for a URL, ignoring health.
    fn eligible(&self, url: &Url, domain: &str) -> Vec<&ProxyRoute> {
        let onion = is_onion(url);
        self.routes
            .iter()
            .filter(|r| r.matches_domain(domain))
            .filter(|r| match r.transport {
                Transport::Relay => onion || self.config.proxy_clearnet,
                Transport::Socks5 => !onion && self.config.proxy_clearnet,
                Transport::Direct => !onion && !self.config.proxy_clearnet,
            })
            .collect()
    }

    pub fn select_route(&self, url: &Url) -> Result<ProxyRoute> {
        let domain = host_of(url);
        let now = Instant::now();
        let state = self.domains.entry(domain.clone()).or_default();

        if state.blocklisted {
            return Err(ScanError::DomainBlocked(domain));
        }

        if let Some(pinned) = state.pinned.as_deref()
            && let Some(route) = self.route_by_id(pinned)
        {
            if state.route_available(pinned, now) {
                let route = self.snapshot(route);
                drop(state);
                return self.enforce_transport(route, url);
            }
            debug!("Pinned route {} is benched for {}", pinned, domain);
        }

        let candidates: Vec<&ProxyRoute> = self
            .eligible(url, &domain)
            .into_iter()
            .filter(|r| state.route_available(&r.id, now))
            .collect();

        if candidates.is_empty() {
            return Err(ScanError::NoRoute(domain));
        }

        let route = candidates[state.cursor % candidates.len()];
        Ok(self.snapshot(route))
    }

    /// Swap a raw SOCKS or direct route for a relay when the target is a
    /// hidden service.
    pub fn enforce_transport(&self, route: ProxyRoute, url: &Url) -> Result<ProxyRoute> {
        if !is_onion(url) || route.transport == Transport::Relay {
            return Ok(route);
        }

        warn!(
            "Route {} ({}) selected for hidden service {}; correcting to relay",
            route.id,
            route.transport.as_str(),
            url
        );
        let domain = host_of(url);
        self.routes
            .iter()
            .find(|r| r.transport == Transport::Relay && r.matches_domain(&domain))
            .map(|r| self.snapshot(r))
            .ok_or(ScanError::NoRoute(domain))
    }

    /// Pin a domain to a specific route.
    pub fn force_route(&self, domain: &str, route_id: &str) -> Result<()> {
        if self.route_by_id(route_id).is_none() {
            return Err(ScanError::ProxyConfig(format!("unknown route {}", route_id)));
        }
        self.domains
            .entry(domain.to_ascii_lowercase())
            .or_default()
            .pinned = Some(route_id.to_string());
        Ok(())
    }

    pub fn report_outcome(&self, route: &ProxyRoute, url: &Url, outcome: RouteOutcome) -> DomainStatus {
        let domain = host_of(url);
        let mut state = self.domains.entry(domain.clone()).or_default();

        match outcome {
            RouteOutcome::Success => {
                state.failures = 0;
                state.routes.entry(route.id.clone()).or_default().consecutive_failures = 0;
                self.route_health.insert(route.id.clone(), RouteHealth::Healthy);
                DomainStatus::Healthy
            }
            RouteOutcome::TransportFailure | RouteOutcome::Blocked => {
                let route_blocked = {
                    let rs = state.routes.entry(route.id.clone()).or_default();
                    rs.consecutive_failures += 1;
                    if rs.consecutive_failures >= self.config.route_failure_threshold {
                        rs.blocked_until = Some(Instant::now() + self.config.route_cooldown);
                        rs.consecutive_failures = 0;
                        true
                    } else {
                        false
                    }
                };
                if route.transport != Transport::Direct {
                    self.route_health.insert(route.id.clone(), RouteHealth::Degraded);
                }

                if outcome == RouteOutcome::TransportFailure {
                    state.failures += 1;
                    if state.failures > self.config.domain_failure_threshold && !state.blocklisted {
                        state.blocklisted = true;
                        warn!(
                            "Domain {} blocklisted after {} failures",
                            domain, state.failures
                        );
                    }
                }

                if state.blocklisted {
                    DomainStatus::Blocklisted
                } else if route_blocked {
                    info!(
                        "Route {} benched for {} for {:?}",
                        route.id, domain, self.config.route_cooldown
                    );
                    DomainStatus::RouteBlocked
                } else {
                    DomainStatus::Healthy
                }
            }
        }
    }

    /// Move the domain to a different route. When no other route is
    /// available, ask for a fresh circuit and keep the current one.
    pub async fn rotate(&self, route: &ProxyRoute, url: &Url) -> Result<ProxyRoute> {
        let domain = host_of(url);
        let now = Instant::now();

        let alternative = {
            let mut state = self.domains.entry(domain.clone()).or_default();
            if state.blocklisted {
                return Err(ScanError::DomainBlocked(domain));
            }
            state.pinned = None;
            let candidates: Vec<&ProxyRoute> = self
                .eligible(url, &domain)
                .into_iter()
                .filter(|r| state.route_available(&r.id, now))
                .collect();

            let mut found = None;
            for step in 1..=candidates.len() {
                let idx = (state.cursor + step) % candidates.len();
                if candidates[idx].id != route.id {
                    state.cursor = idx;
                    found = Some(self.snapshot(candidates[idx]));
                    break;
                }
            }
            found
        };

        if let Some(next) = alternative {
            debug!("Rotated {} from {} to {}", domain, route.id, next.id);
            return Ok(next);
        }

        if route.transport != Transport::Direct {
            self.refresh_circuit().await;
        }
        self.select_route(url)
    }

    /// Request a new circuit unless one was requested within the refresh
    /// interval. Returns true if a refresh was sent.
    pub async fn refresh_circuit(&self) -> bool {
        let Some(refresher) = &self.refresher else {
            return false;
        };

        let mut last = self.last_refresh.lock().await;
        if let Some(at) = *last
            && at.elapsed() < self.config.circuit_refresh_interval
        {
            debug!("Circuit refresh skipped, last one {:?} ago", at.elapsed());
            return false;
        }

        *last = Some(Instant::now());
        match refresher.refresh().await {
            Ok(()) => {
                info!("Requested a fresh circuit");
                true
            }
            Err(e) => {
                warn!("Circuit refresh failed: {}", e);
                false
            }
        }
    }

    pub fn is_blocklisted(&self, domain: &str) -> bool {
        self.domains
            .get(&domain.to_ascii_lowercase())
            .map(|s| s.blocklisted)
            .unwrap_or(false)
    }

    pub fn domain_failures(&self, domain: &str) -> u32 {
        self.domains
            .get(&domain.to_ascii_lowercase())
            .map(|s| s.failures)
            .unwrap_or(0)
    }

    pub fn blocklisted_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .domains
            .iter()
            .filter(|e| e.value().blocklisted)
            .map(|e| e.key().clone())
            .collect();
        domains.sort();
        domains
    }
}
