use crate::error::{CoreError, Result};
use crate::threat::KeywordTable;
use nightcrawl_scanner::blocking::RecoveryConfig;
use nightcrawl_scanner::frontier::{FrontierConfig, SkipList};
use nightcrawl_scanner::proxy::{DIRECT_ROUTE_ID, ProxyRoute, RouterConfig};
use nightcrawl_scanner::CrawlerConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_CONFIG_DIR: &str = "~/.config/nightcrawl";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const DATABASE_FILE_NAME: &str = "nightcrawl.db";
/// One analyzer call every ~17 minutes.
const MIN_ANALYZER_RATE: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub requests_per_second: f64,
    pub max_content_chars: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            timeout_secs: 60,
            requests_per_second: 1.0,
            max_content_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: usize,
    pub per_domain_limit: usize,
    pub max_depth: usize,
    pub max_pages: Option<usize>,
    pub run_timeout_secs: Option<u64>,
    pub onion_timeout_secs: u64,
    pub clearnet_timeout_secs: u64,
    pub max_attempts: u32,
    pub domain_failure_threshold: u32,
    pub route_failure_threshold: u32,
    pub route_cooldown_secs: u64,
    pub circuit_refresh_interval_secs: u64,
    pub control_port: Option<String>,
    pub control_password: Option<String>,
    pub routes: Vec<ProxyRoute>,
    /// Host to route id. Pinned hosts use that route until it is rotated away.
    pub route_pins: BTreeMap<String, String>,
    pub proxy_clearnet: bool,
    pub follow_clearnet: bool,
    pub analyzer: AnalyzerConfig,
    pub render_endpoint: Option<String>,
    pub render_timeout_secs: u64,
    pub alert_webhook: Option<String>,
    pub keywords: KeywordTable,
    pub skip_domains: Vec<String>,
    pub skip_patterns: Vec<String>,
    pub centrality_half_life_days: Option<f64>,
    pub database_path: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            per_domain_limit: 4,
            max_depth: 3,
            max_pages: None,
            run_timeout_secs: None,
            onion_timeout_secs: 90,
            clearnet_timeout_secs: 45,
            max_attempts: 8,
            domain_failure_threshold: 5,
            route_failure_threshold: 3,
            route_cooldown_secs: 600,
            circuit_refresh_interval_secs: 300,
            control_port: None,
            control_password: None,
            routes: default_routes(),
            route_pins: BTreeMap::new(),
            proxy_clearnet: false,
            follow_clearnet: false,
            analyzer: AnalyzerConfig::default(),
            render_endpoint: None,
            render_timeout_secs: 30,
            alert_webhook: None,
            keywords: KeywordTable::default(),
            skip_domains: Vec::new(),
            skip_patterns: Vec::new(),
            centrality_half_life_days: None,
            database_path: format!("{}/{}", DEFAULT_CONFIG_DIR, DATABASE_FILE_NAME),
        }
    }
}

pub fn default_routes() -> Vec<ProxyRoute> {
    vec![
        ProxyRoute::relay("relay-8118", "http://127.0.0.1:8118"),
        ProxyRoute::relay("relay-8119", "http://127.0.0.1:8119"),
        ProxyRoute::relay("relay-8120", "http://127.0.0.1:8120"),
        ProxyRoute::socks5("socks-9050", "socks5h://127.0.0.1:9050"),
    ]
}

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

fn check_endpoint(name: &str, endpoint: &Option<String>) -> Result<()> {
    if let Some(endpoint) = endpoint {
        let url = Url::parse(endpoint)
            .map_err(|e| CoreError::Config(format!("{} endpoint {} is invalid: {}", name, endpoint, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CoreError::Config(format!(
                "{} endpoint {} must be http or https",
                name, endpoint
            )));
        }
    }
    Ok(())
}

impl EngineConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
            CoreError::Config(format!("cannot parse config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > 16 {
            return Err(CoreError::Config(format!(
                "workers must be between 1 and 16, got {}",
                self.workers
            )));
        }
        if self.per_domain_limit == 0 {
            return Err(CoreError::Config("per_domain_limit must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(CoreError::Config("max_attempts must be at least 1".into()));
        }
        let rate = self.analyzer.requests_per_second;
        if rate.is_nan() || rate < MIN_ANALYZER_RATE {
            return Err(CoreError::Config(format!(
                "analyzer.requests_per_second must be at least {}, got {}",
                MIN_ANALYZER_RATE, rate
            )));
        }

        let mut ids = std::collections::HashSet::new();
        for route in &self.routes {
            route
                .validate()
                .map_err(|e| CoreError::Config(e.to_string()))?;
            if !ids.insert(route.id.as_str()) {
                return Err(CoreError::Config(format!("duplicate route id {}", route.id)));
            }
        }

        for (host, route_id) in &self.route_pins {
            if route_id != DIRECT_ROUTE_ID && !ids.contains(route_id.as_str()) {
                return Err(CoreError::Config(format!(
                    "pin for {} names unknown route {}",
                    host, route_id
                )));
            }
        }

        check_endpoint("analyzer", &self.analyzer.endpoint)?;
        check_endpoint("render", &self.render_endpoint)?;
        check_endpoint("alert webhook", &self.alert_webhook)?;

        for pattern in &self.skip_patterns {
            Regex::new(pattern)
                .map_err(|e| CoreError::Config(format!("bad skip pattern {}: {}", pattern, e)))?;
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        expand_path(&self.database_path)
    }

    pub fn frontier_config(&self) -> FrontierConfig {
        FrontierConfig {
            per_domain_limit: self.per_domain_limit,
            max_depth: self.max_depth,
            max_pages: self.max_pages,
            skip_list: SkipList::default()
                .with_domains(&self.skip_domains)
                .with_patterns(&self.skip_patterns),
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            domain_failure_threshold: self.domain_failure_threshold,
            route_failure_threshold: self.route_failure_threshold,
            route_cooldown: Duration::from_secs(self.route_cooldown_secs),
            circuit_refresh_interval: Duration::from_secs(self.circuit_refresh_interval_secs),
            proxy_clearnet: self.proxy_clearnet,
        }
    }

    pub fn crawler_config(&self) -> CrawlerConfig {
        CrawlerConfig {
            workers: self.workers,
            onion_timeout: Duration::from_secs(self.onion_timeout_secs),
            clearnet_timeout: Duration::from_secs(self.clearnet_timeout_secs),
            max_attempts: self.max_attempts,
            follow_clearnet: self.follow_clearnet,
            ..CrawlerConfig::default()
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig::default()
    }

    pub fn centrality_half_life(&self) -> Option<Duration> {
        self.centrality_half_life_days
            .filter(|d| *d > 0.0)
            .map(|d| Duration::from_secs_f64(d * 86_400.0))
    }
}
