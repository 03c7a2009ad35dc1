// src/apps.rs — the sample applications driven by the launch harness
//
// Each application is a plain function run by every application rank of a
// fresh world. Apps that only make sense once per cluster gate themselves on
// the first position of the application partition, exactly like the battery
// the allocator grew up against.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::client::Client;
use crate::comm::SubGroup;
use crate::error::AppError;
use crate::proto::ReadValue;
use crate::storage::{Value, Vid};

/// Everything an application rank has at its disposal: a client bound to
/// one allocator, and the application partition for barriers/allgather.
pub struct AppEnv {
    pub client: Client,
    pub group: SubGroup,
}

impl AppEnv {
    fn is_partition_leader(&self) -> bool {
        self.group.position(self.client.rank()) == Some(0)
    }
}

pub type AppFn = fn(&mut AppEnv) -> Result<(), AppError>;

/// The sequenced test battery, in the order the scenarios are run.
pub const BATTERY: &[(&str, AppFn)] = &[
    ("SimpleAlloc", simple_alloc),
    ("MultipleRead", multiple_read),
    ("SimpleFree", simple_free),
    ("SimpleWrite", simple_write),
    ("SimpleArray", simple_array),
    ("SimpleArrayWrite", simple_array_write),
    ("BigArrayAlloc", big_array_alloc),
    ("BigArrayWrite", big_array_write),
];

/// Allocate scalars until the cluster refuses, reading each one back.
pub fn simple_alloc(env: &mut AppEnv) -> Result<(), AppError> {
    for _ in 0..5 {
        env.client.note("request allocation");
        let Some(vid) = env.client.allocate(1)? else {
            env.client.note("allocation refused, cluster exhausted");
            break;
        };
        env.client.note(&format!("allocation done, got {vid:?}"));
        let value = env.client.read(vid, None)?;
        if !matches!(value, ReadValue::Entity(_)) {
            return Err(AppError::failed(format!("scalar read returned {value:?}")));
        }
    }
    Ok(())
}

/// Every app allocates one cell, the vids are allgathered, and every app
/// reads every vid. Each read must resolve to a whole entity.
pub fn multiple_read(env: &mut AppEnv) -> Result<(), AppError> {
    let mine = env.client.allocate(1)?;
    env.client.note(&format!("allocation id: {mine:?}"));
    let AppEnv { client, group } = env;
    let all: Vec<Option<Vid>> = group.allgather(client.comm_mut(), &mine)?;
    for vid in all.into_iter().flatten() {
        match client.read(vid, None)? {
            ReadValue::Entity(var) => client.note(&format!("read {:?}", var.vid)),
            other => {
                return Err(AppError::failed(format!(
                    "invalid read on app {} with vid {vid:?}: {other:?} (allocator rank {})",
                    client.rank(),
                    client.allocator()
                )))
            }
        }
    }
    Ok(())
}

/// Allocate/free cycles; capacity released by a free must be allocatable
/// again, so two successful rounds always complete.
pub fn simple_free(env: &mut AppEnv) -> Result<(), AppError> {
    let mut rounds = 2;
    while rounds > 0 {
        let Some(vid) = env.client.allocate(1)? else {
            env.client.note("allocation refused, cluster exhausted");
            break;
        };
        let freed = env.client.free(vid)?;
        env.client.note(&format!("freed {vid:?}: {freed}"));
        if freed {
            rounds -= 1;
        }
    }
    Ok(())
}

/// Allocate, observe the unset cell, write 67, read it back.
pub fn simple_write(env: &mut AppEnv) -> Result<(), AppError> {
    loop {
        let Some(vid) = env.client.allocate(1)? else {
            env.client.note("allocation refused, cluster exhausted");
            return Ok(());
        };
        match env.client.read(vid, None)? {
            ReadValue::Entity(var) if var.value.is_nil() => {}
            other => return Err(AppError::failed(format!("fresh cell not unset: {other:?}"))),
        }
        let wrote = env.client.write(vid, Value::Int(67), None)?;
        env.client.note(&format!("wrote 67 into {vid:?}: {wrote}"));
        if wrote {
            match env.client.read(vid, None)? {
                ReadValue::Entity(var) if var.value == Value::Int(67) => return Ok(()),
                other => {
                    return Err(AppError::failed(format!("readback after write: {other:?}")))
                }
            }
        }
    }
}

/// A small array that fits one node: allocate four cells, read one back.
pub fn simple_array(env: &mut AppEnv) -> Result<(), AppError> {
    if !env.is_partition_leader() {
        return Ok(());
    }
    env.client.note("array allocation test");
    let Some(vid) = env.client.allocate(4)? else {
        return Err(AppError::failed("not enough memory for a 4-cell array"));
    };
    match env.client.read(vid, Some(3))? {
        ReadValue::Cell(_) => Ok(()),
        other => Err(AppError::failed(format!("indexed read returned {other:?}"))),
    }
}

/// Write then read every cell of a single-request array.
pub fn simple_array_write(env: &mut AppEnv) -> Result<(), AppError> {
    if !env.is_partition_leader() {
        return Ok(());
    }
    let Some(vid) = env.client.allocate(4)? else {
        return Err(AppError::failed("not enough memory for a 4-cell array"));
    };
    for i in 0..4 {
        env.client.write(vid, Value::Int(4 - i as i64), Some(i))?;
    }
    for i in 0..4 {
        let got = read_int(&mut env.client, vid, i)?;
        if got != 4 - i as i64 {
            return Err(AppError::failed(format!("cell {i} holds {got}, expected {}", 4 - i as i64)));
        }
    }
    Ok(())
}

fn alloc_big(env: &mut AppEnv) -> Result<Vid, AppError> {
    env.client.note("big array allocation test");
    let Some(vid) = env.client.allocate(6)? else {
        return Err(AppError::failed("could not allocate the big array"));
    };
    env.client.note(&format!("big array chained from {vid:?}"));
    for i in 0..4 {
        let value = env.client.read(vid, Some(i))?;
        if !matches!(value, ReadValue::Cell(_)) {
            return Err(AppError::failed(format!("indexed read returned {value:?}")));
        }
    }
    Ok(vid)
}

/// An array bigger than any single node: six cells over two-cell nodes must
/// span the tree and still be readable through the chain.
pub fn big_array_alloc(env: &mut AppEnv) -> Result<(), AppError> {
    if !env.is_partition_leader() {
        return Ok(());
    }
    alloc_big(env).map(|_| ())
}

/// Write through the chain and read every cell back.
pub fn big_array_write(env: &mut AppEnv) -> Result<(), AppError> {
    if !env.is_partition_leader() {
        return Ok(());
    }
    let vid = alloc_big(env)?;
    for i in 0..6 {
        let wrote = env.client.write(vid, Value::Int(-(i as i64)), Some(i))?;
        if !wrote {
            return Err(AppError::failed(format!("write at index {i} was rejected")));
        }
    }
    for i in 0..6 {
        let got = read_int(&mut env.client, vid, i)?;
        if got != -(i as i64) {
            return Err(AppError::failed(format!("cell {i} holds {got}, expected {}", -(i as i64))));
        }
    }
    Ok(())
}

const ARRAY_LEN: usize = 50;

/// End-to-end quicksort over a distributed array: write 50 random integers,
/// sort them in place purely through read/write, and check the readback.
pub fn quick_sort(env: &mut AppEnv) -> Result<(), AppError> {
    if !env.is_partition_leader() {
        return Ok(());
    }
    let mut rng = StdRng::seed_from_u64(env.client.rank() as u64);
    let input: Vec<i64> =
        rand::seq::index::sample(&mut rng, ARRAY_LEN * 3, ARRAY_LEN).iter().map(|x| x as i64).collect();

    let Some(vid) = env.client.allocate(ARRAY_LEN)? else {
        return Err(AppError::failed(
            "array too big for the cluster; raise --node-size or --procs",
        ));
    };
    for (i, &x) in input.iter().enumerate() {
        env.client.write(vid, Value::Int(x), Some(i))?;
    }

    sort_range(&mut env.client, vid, 0, ARRAY_LEN as i64 - 1)?;

    let mut output = Vec::with_capacity(ARRAY_LEN);
    for i in 0..ARRAY_LEN {
        output.push(read_int(&mut env.client, vid, i)?);
    }
    env.client.note(&format!("before: {input:?}"));
    env.client.note(&format!("after:  {output:?}"));

    if !output.windows(2).all(|w| w[0] <= w[1]) {
        return Err(AppError::failed(format!("readback is not sorted: {output:?}")));
    }
    let mut expect = input.clone();
    expect.sort_unstable();
    let mut got = output.clone();
    got.sort_unstable();
    if expect != got {
        return Err(AppError::failed("readback is not a permutation of the input"));
    }
    Ok(())
}

fn read_int(client: &mut Client, vid: Vid, i: usize) -> Result<i64, AppError> {
    match client.read(vid, Some(i))? {
        ReadValue::Cell(v) => v
            .as_int()
            .ok_or_else(|| AppError::failed(format!("cell {i} holds no integer"))),
        ReadValue::Entity(_) => Err(AppError::failed("expected an array cell, got an entity")),
    }
}

fn sort_range(client: &mut Client, vid: Vid, start: i64, end: i64) -> Result<(), AppError> {
    if start >= end {
        return Ok(());
    }
    let pivot = read_int(client, vid, end as usize)?;
    let mut border = start;
    let mut border_value = read_int(client, vid, border as usize)?;
    for i in start..=end {
        let xi = read_int(client, vid, i as usize)?;
        if xi <= pivot {
            client.write(vid, Value::Int(border_value), Some(i as usize))?;
            client.write(vid, Value::Int(xi), Some(border as usize))?;
            if i != end {
                border += 1;
                border_value = read_int(client, vid, border as usize)?;
            }
        }
    }
    sort_range(client, vid, start, border - 1)?;
    sort_range(client, vid, border + 1, end)
}
