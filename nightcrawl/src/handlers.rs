use anyhow::{Context, bail};
use clap::ArgMatches;
use colored::Colorize;
use nightcrawl_core::config::{
    CONFIG_FILE_NAME, DATABASE_FILE_NAME, DEFAULT_CONFIG_DIR, EngineConfig, expand_path,
};
use nightcrawl_core::crawl::{
    CrawlOptions, CrawlProgressCallback, execute_crawl, generate_crawl_report,
};
use nightcrawl_core::data::Database;
use nightcrawl_core::graph::LinkGraph;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use url::Url;

// Helper functions for crawl handler

/// Collect seeds from repeated --seed flags and an optional seeds file
pub fn load_seeds(seeds: Vec<String>, seeds_file: Option<&PathBuf>) -> Result<Vec<String>, String> {
    let mut all: Vec<String> = seeds
        .iter()
        .filter_map(|s| parse_url_line(s.trim()))
        .collect();
    if let Some(path) = seeds_file {
        all.extend(load_urls_from_file(path)?);
    }
    let mut seen = HashSet::new();
    all.retain(|url| seen.insert(url.clone()));

    if all.is_empty() {
        return Err("At least one --seed or a --seeds-file is required".to_string());
    }
    Ok(all)
}

/// Load and parse URLs from a file. Blank lines and `#` comments are skipped.
pub fn load_urls_from_file(path: &Path) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read seeds file {}: {}", path.display(), e))?;

    let urls: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(parse_url_line)
        .collect();

    if urls.is_empty() {
        return Err(format!("No valid URLs found in {}", path.display()));
    }

    Ok(urls)
}

/// Parse a single line as a URL, trying to add http:// if needed
pub fn parse_url_line(line: &str) -> Option<String> {
    if let Ok(url) = Url::parse(line)
        && url.has_host()
    {
        return Some(line.to_string());
    }

    let with_scheme = format!("http://{}", line);
    if let Ok(url) = Url::parse(&with_scheme)
        && url.host_str().is_some_and(|h| h.contains('.'))
    {
        return Some(with_scheme);
    }

    eprintln!("{} Skipping invalid URL '{}'", "⚠".yellow(), line);
    None
}

fn default_config_path() -> PathBuf {
    expand_path(DEFAULT_CONFIG_DIR).join(CONFIG_FILE_NAME)
}

/// Load the config named by --config, else the default file if present,
/// else built-in defaults. A named file that cannot be read is an error.
pub fn load_config(args: &ArgMatches) -> anyhow::Result<EngineConfig> {
    let config = match args.get_one::<PathBuf>("config") {
        Some(path) => EngineConfig::load(path)?,
        None => {
            let path = default_config_path();
            if path.exists() {
                EngineConfig::load(&path)?
            } else {
                EngineConfig::default()
            }
        }
    };
    Ok(config)
}

/// Apply crawl flags on top of a loaded config.
pub fn apply_crawl_overrides(mut config: EngineConfig, args: &ArgMatches) -> anyhow::Result<EngineConfig> {
    if let Some(depth) = args.get_one::<usize>("max-depth") {
        config.max_depth = *depth;
    }
    if let Some(pages) = args.get_one::<usize>("max-pages") {
        config.max_pages = Some(*pages);
    }
    if let Some(timeout) = args.get_one::<u64>("timeout") {
        config.run_timeout_secs = Some(*timeout);
    }
    if let Some(workers) = args.get_one::<usize>("workers") {
        config.workers = *workers;
    }
    if let Some(db) = args.get_one::<PathBuf>("db") {
        config.database_path = db.display().to_string();
    }
    if args.get_flag("follow-clearnet") {
        config.follow_clearnet = true;
    }
    config.validate()?;
    Ok(config)
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

pub fn handle_init(args: &ArgMatches) -> anyhow::Result<()> {
    print_divider();
    println!("{}", "  NIGHTCRAWL INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let target = args
        .get_one::<String>("PATH")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_DIR);
    let force = args.get_flag("force");
    let config_dir = expand_path(target);
    let config_path = config_dir.join(CONFIG_FILE_NAME);
    let db_path = config_dir.join(DATABASE_FILE_NAME);

    println!(
        "{} Target: {}",
        "→".blue(),
        config_dir.display().to_string().bright_white()
    );
    println!();

    if (config_path.exists() || Database::exists(&db_path)) && !force {
        println!("{}", "⚠ WARNING".yellow().bold());
        println!("An existing installation was found:");
        for existing in [&config_path, &db_path].into_iter().filter(|p| p.exists()) {
            println!(
                "  {} {}",
                "•".yellow(),
                existing.display().to_string().bright_white()
            );
        }
        println!();
        bail!("refusing to overwrite {}; rerun with --force", config_dir.display());
    }

    println!("{} Creating directory structure...", "→".blue());
    fs::create_dir_all(&config_dir)
        .with_context(|| format!("cannot create {}", config_dir.display()))?;

    let config = EngineConfig {
        database_path: db_path.display().to_string(),
        ..EngineConfig::default()
    };
    config.save(&config_path)?;
    println!(
        "  {} {}",
        "✓".green(),
        config_path.display().to_string().bright_white()
    );

    if force && Database::exists(&db_path) {
        println!(
            "{} Deleting existing database (force mode)",
            "→".yellow().bold()
        );
        Database::remove(&db_path)
            .with_context(|| format!("cannot remove {}", db_path.display()))?;
    }

    println!("{} Creating database...", "→".blue());
    Database::new(&db_path).with_context(|| format!("cannot create {}", db_path.display()))?;

    println!();
    print_divider();
    println!("{}", "  INITIALIZATION COMPLETE".green().bold());
    print_divider();
    println!();
    println!(
        "{} Config: {}",
        "✓".green().bold(),
        config_path.display().to_string().bright_white()
    );
    println!(
        "{} Database: {}",
        "✓".green().bold(),
        db_path.display().to_string().bright_white()
    );
    println!();
    Ok(())
}

pub async fn handle_crawl(sub_matches: &ArgMatches) -> anyhow::Result<()> {
    let seeds: Vec<String> = sub_matches
        .get_many::<String>("seed")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let seeds_file = sub_matches.get_one::<PathBuf>("seeds-file");

    let seeds = load_seeds(seeds, seeds_file).map_err(anyhow::Error::msg)?;
    let config = apply_crawl_overrides(load_config(sub_matches)?, sub_matches)?;
    debug!(?config, "resolved crawl configuration");

    println!("\n{} Crawling from {} seed(s)", "→".blue().bold(), seeds.len());
    println!("Workers: {}", config.workers);
    println!("Max depth: {}", config.max_depth);
    if let Some(pages) = config.max_pages {
        println!("Max pages: {}", pages);
    }
    println!(
        "Scope: {}",
        if config.follow_clearnet {
            "hidden services and clearnet"
        } else {
            "hidden services only"
        }
    );
    println!("Database: {}\n", config.database_path().display());

    let options = CrawlOptions {
        seeds,
        config,
        show_progress_bars: true,
    };
    let progress_callback: CrawlProgressCallback = Arc::new(|msg: String| {
        println!("{}", msg);
    });

    let summary = execute_crawl(options, Some(progress_callback))
        .await
        .context("crawl failed")?;

    println!("\n{} Crawl {}!\n", "✓".green().bold(), summary.status.as_str());
    print!("{}", generate_crawl_report(&summary));
    Ok(())
}

pub fn handle_graph(sub_matches: &ArgMatches) -> anyhow::Result<()> {
    let config = load_config(sub_matches)?;
    let db_path = sub_matches
        .get_one::<PathBuf>("db")
        .cloned()
        .unwrap_or_else(|| config.database_path());
    let top = *sub_matches.get_one::<usize>("top").unwrap_or(&10);

    if !Database::exists(&db_path) {
        bail!(
            "no database at {}; run `nightcrawl init` or crawl first",
            db_path.display()
        );
    }
    let db = Arc::new(Database::new(&db_path)?);
    let graph = LinkGraph::new(db);

    let scores = graph.compute_centrality(config.centrality_half_life())?;
    print_divider();
    println!(
        "  {} nodes, {} edges, {} scored",
        graph.node_count()?.to_string().cyan(),
        graph.edge_count()?.to_string().cyan(),
        scores.len().to_string().cyan()
    );
    print_divider();
    for (rank, (url, score)) in graph.top_nodes(top)?.iter().enumerate() {
        println!(
            "  {:>3}. {} {}",
            rank + 1,
            format!("{:.4}", score).bright_white().bold(),
            url
        );
    }
    println!();
    Ok(())
}
