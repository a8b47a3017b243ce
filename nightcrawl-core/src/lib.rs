pub mod alert;
pub mod analyzer;
pub mod config;
pub mod crawl;
pub mod data;
pub mod error;
pub mod graph;
pub mod threat;

use colored::Colorize;

pub use error::{CoreError, Result};

const BANNER: &str = r#"
   _   _ _       _     _                            _
  | \ | (_) __ _| |__ | |_ ___ _ __ __ ___      __ | |
  |  \| | |/ _` | '_ \| __/ __| '__/ _` \ \ /\ / / | |
  | |\  | | (_| | | | | || (__| | | (_| |\ V  V /  | |
  |_| \_|_|\__, |_| |_|\__\___|_|  \__,_| \_/\_/   |_|
           |___/
"#;

pub fn print_banner() {
    println!("{}", BANNER.bright_blue().bold());
    println!(
        "  {} {}\n",
        "nightcrawl".bright_white().bold(),
        env!("CARGO_PKG_VERSION").bright_black()
    );
}
