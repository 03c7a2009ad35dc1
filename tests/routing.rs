// tests/routing.rs — topology shapes beyond the default world
//
// The default battery runs four allocators under one root. These worlds
// bend the tree the other ways: three levels deep, and a fan-out of one
// (a plain chain), where the ancestor-path arithmetic has the least slack.

use memtree::apps::AppEnv;
use memtree::error::AppError;
use memtree::launch::{self, WorldConfig};
use memtree::proto::ReadValue;
use memtree::storage::{Value, Vid};

/// Fourteen single-cell allocators spanning three tree levels. One
/// application fills the whole cluster, reads everything back through
/// multi-hop routes, drains it, and fills part of it again.
#[test]
fn a_three_level_tree_routes_every_operation_to_its_owner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = WorldConfig {
        procs: 28,
        node_size: 1,
        nb_children: 3,
        log_dir: dir.path().to_path_buf(),
    };
    let report = launch::run_scenario(&cfg, "DeepTree", |env: &mut AppEnv| {
        if env.group.position(env.client.rank()) != Some(0) {
            return Ok(());
        }
        let mut held: Vec<Vid> = Vec::new();
        for i in 0..14 {
            let vid = env
                .client
                .allocate(1)?
                .ok_or_else(|| AppError::failed(format!("cell {i} refused within capacity")))?;
            held.push(vid);
        }
        if env.client.allocate(1)?.is_some() {
            return Err(AppError::failed("fifteenth cell granted past capacity"));
        }

        // every owner rank should be carrying exactly its one cell
        let mut owners: Vec<usize> = held.iter().map(|v| v.owner_rank).collect();
        owners.sort_unstable();
        owners.dedup();
        if owners.len() != 14 {
            return Err(AppError::failed(format!(
                "expected 14 distinct owners, got {owners:?}"
            )));
        }

        for &vid in &held {
            match env.client.read(vid, None)? {
                ReadValue::Entity(var) if var.vid == vid => {}
                other => return Err(AppError::failed(format!("read {vid:?} yielded {other:?}"))),
            }
        }
        for &vid in &held {
            if !env.client.free(vid)? {
                return Err(AppError::failed(format!("free {vid:?} refused")));
            }
        }
        for _ in 0..5 {
            if env.client.allocate(1)?.is_none() {
                return Err(AppError::failed("drained cluster refused a reallocation"));
            }
        }
        Ok(())
    });
    assert!(report.passed, "scenario failed: {:?}", report.detail);
}

/// A fan-out of one degenerates the tree into a chain of three allocators.
/// A six-cell array then has to put one segment on every node, and every
/// indexed access walks the full chain.
#[test]
fn a_chain_shaped_tree_shards_an_array_across_every_node() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = WorldConfig {
        procs: 6,
        node_size: 2,
        nb_children: 1,
        log_dir: dir.path().to_path_buf(),
    };
    let report = launch::run_scenario(&cfg, "ChainTree", |env: &mut AppEnv| {
        if env.group.position(env.client.rank()) != Some(0) {
            return Ok(());
        }
        let vid = env
            .client
            .allocate(6)?
            .ok_or_else(|| AppError::failed("six cells must fit a six-cell chain"))?;
        for i in 0..6 {
            if !env.client.write(vid, Value::Int(i as i64 * 11), Some(i))? {
                return Err(AppError::failed(format!("write at {i} rejected")));
            }
        }
        for i in 0..6 {
            match env.client.read(vid, Some(i))? {
                ReadValue::Cell(v) if v.as_int() == Some(i as i64 * 11) => {}
                other => return Err(AppError::failed(format!("cell {i} read {other:?}"))),
            }
        }
        if !env.client.free(vid)? {
            return Err(AppError::failed("freeing the chain refused"));
        }
        // all six cells must be back before a second chain fits
        env.client
            .allocate(6)?
            .ok_or_else(|| AppError::failed("chain capacity was not released"))?;
        Ok(())
    });
    assert!(report.passed, "scenario failed: {:?}", report.detail);
}

/// Payloads are not just integers: a text value survives the trip through
/// the wire format and back.
#[test]
fn text_payloads_round_trip_through_the_cluster() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = WorldConfig {
        procs: 8,
        node_size: 2,
        nb_children: 3,
        log_dir: dir.path().to_path_buf(),
    };
    let report = launch::run_scenario(&cfg, "TextPayload", |env: &mut AppEnv| {
        if env.group.position(env.client.rank()) != Some(0) {
            return Ok(());
        }
        let vid = env
            .client
            .allocate(1)?
            .ok_or_else(|| AppError::failed("a fresh cluster must grant one cell"))?;
        if !env.client.write(vid, Value::Text("carried across the tree".into()), None)? {
            return Err(AppError::failed("text write rejected"));
        }
        match env.client.read(vid, None)? {
            ReadValue::Entity(var) if var.value == Value::Text("carried across the tree".into()) => Ok(()),
            other => Err(AppError::failed(format!("text readback yielded {other:?}"))),
        }
    });
    assert!(report.passed, "scenario failed: {:?}", report.detail);
}
