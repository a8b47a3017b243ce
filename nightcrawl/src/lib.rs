pub mod commands;

// Include handlers module directly from handlers.rs
#[path = "handlers.rs"]
pub mod handlers;

// Re-export commonly used handler functions for convenience
pub use handlers::{
    apply_crawl_overrides, load_config, load_seeds, load_urls_from_file, parse_url_line,
};

// Re-export crawl functionality from nightcrawl-core
pub use nightcrawl_core::crawl::{
    CrawlOptions, CrawlProgressCallback, CrawlSummary, execute_crawl, generate_crawl_report,
};
