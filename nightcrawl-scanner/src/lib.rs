pub mod blocking;
pub mod crawler;
pub mod error;
pub mod extract;
pub mod frontier;
pub mod proxy;
pub mod result;

pub use blocking::{BlockingDetector, BlockingVerdict, RecoveryPolicy};
pub use crawler::{Crawler, CrawlerConfig};
pub use error::ScanError;
pub use frontier::{Frontier, FrontierConfig};
pub use proxy::{ProxyRoute, ProxyRouter, RouterConfig};
pub use result::{CrawlFailure, CrawlStats, FailureReason, ScannedPage};
