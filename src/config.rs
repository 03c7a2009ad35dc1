// src/config.rs — driver configuration
//
// Flags win over the optional TOML file, the file wins over the built-in
// defaults. The file carries the same keys as the flags so a cluster shape
// can be checked in next to the code that exercises it.

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

use crate::launch::WorldConfig;

#[derive(Parser, Debug)]
#[command(
    name = "memtree",
    version,
    about = "memtree — distributed tree-structured memory allocator",
    long_about = "Launches a world of ranked processes, arranges the lower half as a k-ary \
                  allocator tree, and drives the application battery (or the distributed \
                  quicksort) against it."
)]
pub struct Cli {
    /// Total number of ranks in the world (the lower half become allocators)
    #[arg(long)]
    pub procs: Option<usize>,

    /// Number of variables an allocator node can hold
    #[arg(long, alias = "node_size")]
    pub node_size: Option<usize>,

    /// Fan-out of the allocator tree
    #[arg(long, alias = "nb_children")]
    pub nb_children: Option<usize>,

    /// Run the distributed quicksort instead of the test battery
    #[arg(long)]
    pub quicksort: bool,

    /// Stream per-process log lines to stderr
    #[arg(long)]
    pub verbose: bool,

    /// Emit the battery report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Directory for the per-process log files
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// TOML file supplying defaults for the flags above
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    procs: Option<usize>,
    node_size: Option<usize>,
    nb_children: Option<usize>,
    log_dir: Option<PathBuf>,
}

#[derive(Debug)]
pub struct RunConfig {
    pub world: WorldConfig,
    pub quicksort: bool,
    pub verbose: bool,
    pub json: bool,
}

pub fn resolve(cli: Cli) -> Result<RunConfig, String> {
    let file = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
            toml::from_str::<FileConfig>(&text)
                .map_err(|e| format!("cannot parse {}: {e}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let procs = cli.procs.or(file.procs).unwrap_or(8);
    if procs < 2 {
        return Err("at least 2 processes are needed: one allocator, one application".into());
    }
    let node_size = cli.node_size.or(file.node_size).unwrap_or(2);
    let nb_children = cli.nb_children.or(file.nb_children).unwrap_or(3);
    if nb_children == 0 {
        return Err("the allocator tree needs a fan-out of at least 1".into());
    }
    let log_dir = cli.log_dir.or(file.log_dir).unwrap_or_else(|| PathBuf::from("."));

    Ok(RunConfig {
        world: WorldConfig { procs, node_size, nb_children, log_dir },
        quicksort: cli.quicksort,
        verbose: cli.verbose,
        json: cli.json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bare_cli() -> Cli {
        Cli::parse_from(["memtree"])
    }

    #[test]
    fn defaults_match_the_driver_contract() {
        let cfg = resolve(bare_cli()).expect("resolve");
        assert_eq!(cfg.world.procs, 8);
        assert_eq!(cfg.world.node_size, 2);
        assert_eq!(cfg.world.nb_children, 3);
        assert!(!cfg.quicksort);
    }

    #[test]
    fn flags_override_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("memtree.toml");
        std::fs::write(&path, "procs = 12\nnode_size = 4\n").expect("write");

        let cli = Cli::parse_from([
            "memtree",
            "--node-size",
            "6",
            "--config",
            path.to_str().expect("utf-8 path"),
        ]);
        let cfg = resolve(cli).expect("resolve");
        assert_eq!(cfg.world.procs, 12, "file supplies what the flags omit");
        assert_eq!(cfg.world.node_size, 6, "flags win over the file");
    }

    #[test]
    fn degenerate_worlds_are_rejected() {
        let cli = Cli::parse_from(["memtree", "--procs", "1"]);
        assert!(resolve(cli).is_err());
        let cli = Cli::parse_from(["memtree", "--nb-children", "0"]);
        assert!(resolve(cli).is_err());
    }
}
