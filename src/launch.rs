// src/launch.rs — world bring-up and the sequenced test battery
//
// Each scenario gets a fresh world: one thread per rank, the lower half
// running allocator nodes, the upper half running the application under
// test. The lowest application rank triggers the stop protocol once the
// partition has drained, and the launcher joins every guard before moving
// to the next scenario.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Utc;
use colored::Colorize;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::alloc::TreeAllocator;
use crate::apps::{self, AppEnv};
use crate::client::Client;
use crate::comm::{self, SubGroup};
use crate::error::AppError;
use crate::logbook::Logbook;

#[derive(Debug, Clone)]
pub struct WorldConfig {
    pub procs: usize,
    pub node_size: usize,
    pub nb_children: usize,
    pub log_dir: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub aborted: bool,
    pub detail: Option<String>,
    pub elapsed_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct BatteryReport {
    pub started: String,
    pub scenarios: Vec<ScenarioReport>,
}

impl BatteryReport {
    pub fn all_passed(&self) -> bool {
        self.scenarios.iter().all(|s| s.passed)
    }

    /// One line per scenario, in the shape the battery has always printed.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for s in &self.scenarios {
            let status =
                if s.passed { "SUCCESS".green() } else { "FAIL".red() };
            out.push_str(&format!("Test application: {}; Status: {}", s.name, status));
            if let Some(detail) = &s.detail {
                out.push_str(&format!(" ({detail})"));
            }
            out.push('\n');
        }
        out
    }
}

/// Run one application scenario on a fresh world and report the verdict.
pub fn run_scenario<F>(cfg: &WorldConfig, name: &str, app: F) -> ScenarioReport
where
    F: Fn(&mut AppEnv) -> Result<(), AppError> + Send + Sync + 'static,
{
    let start = Instant::now();
    let nb_alloc = (cfg.procs / 2).max(1);
    let (endpoints, handle) = comm::world(cfg.procs);
    let group = SubGroup::new((nb_alloc..cfg.procs).collect(), &handle);
    let logic = Arc::new(app);

    tracing::info!(scenario = name, procs = cfg.procs, allocators = nb_alloc, "world starting");

    let mut guards = Vec::with_capacity(cfg.procs);
    for mut ep in endpoints {
        let rank = ep.rank();
        let logbook = Logbook::open(&cfg.log_dir, rank, name).unwrap_or_else(|e| {
            tracing::warn!(rank, error = %e, "logbook unavailable, mirroring to tracing only");
            Logbook::sink(rank)
        });
        ep.attach_logbook(logbook);

        let group = group.clone();
        let logic = logic.clone();
        let stop_note = format!("{name} done");
        let (node_size, nb_children) = (cfg.node_size, cfg.nb_children);
        let guard = thread::Builder::new()
            .name(format!("rank-{rank}"))
            .spawn(move || -> Result<(), String> {
                ep.barrier().map_err(|e| e.to_string())?;
                if rank < nb_alloc {
                    TreeAllocator::new(ep, nb_children, node_size, nb_alloc)
                        .run()
                        .map_err(|e| e.to_string())
                } else {
                    let mut rng = StdRng::seed_from_u64(rank as u64);
                    let allocator = rng.gen_range(0..nb_alloc);
                    let mut env = AppEnv { client: Client::new(ep, allocator), group };
                    env.client.note(&format!("bound to allocator {allocator}"));
                    let outcome = (*logic)(&mut env);
                    match &outcome {
                        Ok(()) => {
                            // drain the partition, then let one rank pull the plug
                            let _ = env.group.barrier();
                            if env.client.rank() == env.group.leader() {
                                let _ = env.client.request_stop(Some(stop_note));
                            }
                        }
                        Err(e) => {
                            env.client.note(&format!("application failed: {e}"));
                            env.client.comm_mut().abort_world();
                        }
                    }
                    outcome.map_err(|e| e.to_string())
                }
            })
            .expect("thread spawn");
        guards.push(guard);
    }

    let mut failures = Vec::new();
    for guard in guards {
        match guard.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(e),
            Err(_) => failures.push("rank panicked".to_string()),
        }
    }

    let aborted = handle.is_aborted();
    // an aborted world drowns every rank in "world aborted" errors; the
    // first failure recorded is the one that actually happened
    let detail = failures.into_iter().find(|f| !f.contains("world aborted")).or_else(|| {
        aborted.then(|| "world aborted".to_string())
    });
    let passed = detail.is_none() && !aborted;

    tracing::info!(scenario = name, passed, aborted, "world finished");
    ScenarioReport {
        name: name.to_string(),
        passed,
        aborted,
        detail,
        elapsed_ms: start.elapsed().as_millis(),
    }
}

/// Run the whole battery, one fresh world per scenario.
pub fn run_battery(cfg: &WorldConfig) -> BatteryReport {
    let started = Utc::now().to_rfc3339();
    let scenarios = apps::BATTERY
        .iter()
        .map(|&(name, app)| run_scenario(cfg, name, app))
        .collect();
    BatteryReport { started, scenarios }
}

/// Run the distributed quicksort instead of the battery.
pub fn run_quicksort(cfg: &WorldConfig) -> BatteryReport {
    let started = Utc::now().to_rfc3339();
    let scenarios = vec![run_scenario(cfg, "QuickSort", apps::quick_sort)];
    BatteryReport { started, scenarios }
}
