// src/main.rs — memtree driver entrypoint

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use memtree::config::{self, Cli};
use memtree::launch;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let json = cli.json;
    let cfg = match config::resolve(cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("memtree: {e}");
            return ExitCode::from(2);
        }
    };

    let default_filter = if cfg.verbose { "memtree=debug" } else { "memtree=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let report = if cfg.quicksort {
        launch::run_quicksort(&cfg.world)
    } else {
        launch::run_battery(&cfg.world)
    };

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("memtree: report serialization failed: {e}"),
        }
    } else {
        print!("{}", report.render_text());
    }

    if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
