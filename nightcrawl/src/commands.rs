use clap::{arg, command};
use std::path::PathBuf;

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);

pub fn command_argument_builder() -> clap::Command {
    clap::Command::new("nightcrawl")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("nightcrawl")
        .styles(CLAP_STYLING)
        .arg(arg!(-q --"quiet" "Suppress banner and non-essential output").required(false))
        .subcommand_required(false)
        .subcommand(
            command!("init")
                .about("Writes a default configuration and creates the nightcrawl database")
                .arg(
                    arg!([PATH])
                        .required(false)
                        .help("Directory to hold config.json and the database")
                        .default_value("~/.config/nightcrawl/"),
                )
                .arg(
                    arg!(-f --"force")
                        .help("Overwrite an existing configuration and database at the location.")
                        .required(false),
                ),
        )
        .subcommand(
            command!("crawl")
                .about(
                    "Crawl hidden services from one or more seeds through the configured proxy \
                routes. Pages, links and threat findings are stored in the database.",
                )
                .arg(
                    arg!(-s --"seed" <URL>)
                        .required(false)
                        .help("Seed URL (repeatable)")
                        .action(clap::ArgAction::Append),
                )
                .arg(
                    arg!(-S --"seeds-file" <PATH>)
                        .required(false)
                        .help("Path to a newline-delimited file of seed URLs")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-d --"max-depth" <DEPTH>)
                        .required(false)
                        .help("Maximum link depth from the seeds")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-m --"max-pages" <PAGES>)
                        .required(false)
                        .help("Stop after this many pages have been dequeued")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-T --"timeout" <SECONDS>)
                        .required(false)
                        .help("Stop the run after this many seconds")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    arg!(-w --"workers" <NUM_WORKERS>)
                        .required(false)
                        .help("The number of async fetch workers (1-16)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-c --"config" <PATH>)
                        .required(false)
                        .help("Config file (default: ~/.config/nightcrawl/config.json if present)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"db" <PATH>)
                        .required(false)
                        .help("Database file, overriding the config")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--"follow-clearnet")
                        .required(false)
                        .help("Follow clearnet links as well as hidden services")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("graph")
                .about("Recompute link-graph centrality and print the most central pages")
                .arg(
                    arg!(--"db" <PATH>)
                        .required(false)
                        .help("Database file, overriding the config")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-c --"config" <PATH>)
                        .required(false)
                        .help("Config file (default: ~/.config/nightcrawl/config.json if present)")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(-n --"top" <N>)
                        .required(false)
                        .help("How many pages to list")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("10"),
                ),
        )
}
