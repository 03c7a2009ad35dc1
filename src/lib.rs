//! memtree — a distributed memory allocator over a rooted k-ary tree.
//!
//! A fixed world of ranks is split in half: the lower ranks run allocator
//! nodes arranged as a k-ary tree, the upper ranks run applications bound to
//! one allocator each. Applications allocate, read, write and free opaque
//! vids; the allocator layer routes every operation along tree edges to the
//! rank that physically owns the storage, sharding oversized arrays into
//! chains of per-node segments on the way.
//!
//! The crate is organized the way the wire sees it: [`comm`] moves ranked
//! envelopes, [`proto`] names what they carry, [`storage`] is what the
//! payloads become at rest, [`tree`] decides where they go next, [`alloc`]
//! is the node state machine, [`client`] the synchronous application view,
//! and [`launch`] spins whole worlds up and down around the [`apps`]
//! battery.

pub mod alloc;
pub mod apps;
pub mod client;
pub mod comm;
pub mod config;
pub mod error;
pub mod launch;
pub mod logbook;
pub mod proto;
pub mod storage;
pub mod tree;

pub use alloc::TreeAllocator;
pub use client::Client;
pub use error::{AllocError, AppError, CommError};
pub use proto::{OpCtx, ReadValue, Request};
pub use storage::{Array, Entity, Value, Variable, Vid};
